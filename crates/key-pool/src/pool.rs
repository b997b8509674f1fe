//! Credential pool
//!
//! The pool is the single source of truth for which credentials exist, whether
//! they are enabled, and how healthy they are. Dispatch reads candidates from
//! it once per attempt and writes health back after classifying the outcome;
//! nothing caches a credential beyond one attempt.
//!
//! When backed by a `CredentialFile`, every admin mutation and every health
//! change is persisted. `last_used_at` is only updated in memory and reaches
//! disk with the next persisted change.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use provider::{ProviderKind, TransientKind};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::credential::{Credential, CredentialView, Health};
use crate::error::{Error, Result};
use crate::store::{CredentialFile, parse_key_lines};

/// Outcome of a bulk import.
#[derive(Debug, Default, Clone, Serialize)]
pub struct ImportSummary {
    pub added: usize,
    pub duplicates: usize,
    pub invalid: usize,
    pub ids: Vec<String>,
}

pub struct CredentialPool {
    credentials: RwLock<BTreeMap<String, Credential>>,
    file: Option<CredentialFile>,
    /// Serializes file writes so the last snapshot written is the newest.
    write_lock: Mutex<()>,
}

impl CredentialPool {
    /// Pool that lives only in memory.
    pub fn in_memory() -> Self {
        Self {
            credentials: RwLock::new(BTreeMap::new()),
            file: None,
            write_lock: Mutex::new(()),
        }
    }

    /// Pool backed by `file`, loading whatever it already holds.
    pub async fn load(file: CredentialFile) -> Result<Self> {
        let loaded = file.load().await?;
        let credentials = loaded.into_iter().map(|c| (c.id.clone(), c)).collect();
        Ok(Self {
            credentials: RwLock::new(credentials),
            file: Some(file),
            write_lock: Mutex::new(()),
        })
    }

    /// Apply an admin mutation. With a file the new state is written first
    /// and only becomes visible once the write succeeded; a failed write
    /// leaves the pool untouched.
    async fn commit<T>(
        &self,
        f: impl FnOnce(&mut BTreeMap<String, Credential>) -> Result<T>,
    ) -> Result<T> {
        let _guard = self.write_lock.lock().await;
        let mut map = self.credentials.write().await;
        let Some(file) = &self.file else {
            return f(&mut *map);
        };

        let mut next = map.clone();
        let out = f(&mut next)?;
        let snapshot: Vec<Credential> = next.values().cloned().collect();
        file.save(&snapshot).await?;
        *map = next;
        Ok(out)
    }

    async fn persist(&self) -> Result<()> {
        let Some(file) = &self.file else {
            return Ok(());
        };
        let _guard = self.write_lock.lock().await;
        let snapshot: Vec<Credential> = self.credentials.read().await.values().cloned().collect();
        file.save(&snapshot).await
    }

    /// Enabled credentials for `provider`, in id order.
    pub async fn list(&self, provider: ProviderKind) -> Vec<Credential> {
        self.credentials
            .read()
            .await
            .values()
            .filter(|c| c.provider == provider && c.enabled)
            .cloned()
            .collect()
    }

    /// Secret-free view of every credential, optionally filtered by provider.
    pub async fn list_all(&self, provider: Option<ProviderKind>) -> Vec<CredentialView> {
        let now = Utc::now();
        self.credentials
            .read()
            .await
            .values()
            .filter(|c| provider.is_none_or(|p| c.provider == p))
            .map(|c| c.view(now))
            .collect()
    }

    pub async fn get(&self, id: &str) -> Option<Credential> {
        self.credentials.read().await.get(id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.credentials.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Credentials dispatch may try next: enabled, not dead, not in `tried`.
    pub async fn candidates(
        &self,
        provider: ProviderKind,
        tried: &HashSet<String>,
    ) -> Vec<Credential> {
        self.credentials
            .read()
            .await
            .values()
            .filter(|c| {
                c.provider == provider && c.enabled && !c.health.is_dead() && !tried.contains(&c.id)
            })
            .cloned()
            .collect()
    }

    fn insert_new(
        map: &mut BTreeMap<String, Credential>,
        provider: ProviderKind,
        secret: String,
        label: Option<String>,
    ) -> Result<String> {
        if secret.trim().is_empty() {
            return Err(Error::InvalidSecret("secret is empty".into()));
        }
        if secret.trim().chars().any(char::is_control) {
            return Err(Error::InvalidSecret("secret contains control characters".into()));
        }
        let credential = Credential::new(provider, secret, label);
        if map.contains_key(&credential.id) {
            return Err(Error::Duplicate(credential.id));
        }
        let id = credential.id.clone();
        map.insert(id.clone(), credential);
        Ok(id)
    }

    /// Register a secret for `provider`. The same secret twice is rejected.
    pub async fn add(
        &self,
        provider: ProviderKind,
        secret: String,
        label: Option<String>,
    ) -> Result<String> {
        let id = self
            .commit(|map| Self::insert_new(map, provider, secret, label))
            .await?;
        info!(credential_id = %id, %provider, "credential added");
        Ok(id)
    }

    /// Add many secrets at once, skipping duplicates. Persists once.
    pub async fn import(
        &self,
        provider: ProviderKind,
        secrets: impl IntoIterator<Item = String>,
    ) -> Result<ImportSummary> {
        let summary = self
            .commit(|map| {
                let mut summary = ImportSummary::default();
                for secret in secrets {
                    match Self::insert_new(map, provider, secret, None) {
                        Ok(id) => {
                            summary.added += 1;
                            summary.ids.push(id);
                        }
                        Err(Error::Duplicate(_)) => summary.duplicates += 1,
                        Err(_) => summary.invalid += 1,
                    }
                }
                Ok(summary)
            })
            .await?;
        info!(
            %provider,
            added = summary.added,
            duplicates = summary.duplicates,
            invalid = summary.invalid,
            "credentials imported"
        );
        Ok(summary)
    }

    /// Import a plain-text key file (one secret per line).
    pub async fn import_file(
        &self,
        provider: ProviderKind,
        path: &std::path::Path,
    ) -> Result<ImportSummary> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| Error::Store(format!("reading key file {}: {e}", path.display())))?;
        self.import(provider, parse_key_lines(&contents)).await
    }

    /// Exclude a credential from selection. An attempt already using it runs
    /// to completion.
    pub async fn disable(&self, id: &str) -> Result<()> {
        self.update(id, |c| c.enabled = false).await?;
        info!(credential_id = id, "credential disabled");
        Ok(())
    }

    /// Re-admit a credential, clearing any cool-down or dead state.
    pub async fn enable(&self, id: &str) -> Result<()> {
        self.update(id, |c| {
            c.enabled = true;
            c.health = Health::Healthy;
        })
        .await?;
        info!(credential_id = id, "credential enabled");
        Ok(())
    }

    pub async fn remove(&self, id: &str) -> Result<()> {
        self.commit(|map| {
            map.remove(id)
                .map(|_| ())
                .ok_or_else(|| Error::NotFound(id.to_string()))
        })
        .await?;
        info!(credential_id = id, "credential removed");
        Ok(())
    }

    async fn update(&self, id: &str, f: impl FnOnce(&mut Credential)) -> Result<()> {
        self.commit(|map| {
            let credential = map
                .get_mut(id)
                .ok_or_else(|| Error::NotFound(id.to_string()))?;
            f(credential);
            Ok(())
        })
        .await
    }

    /// Demote a credential after a transient failure.
    ///
    /// `SessionRevoked` marks it dead; every other kind starts a cool-down.
    /// A credential removed while its attempt was in flight is ignored.
    /// Returns the health that was written.
    pub async fn report_failure(
        &self,
        id: &str,
        kind: TransientKind,
        cooldown: Duration,
    ) -> Option<Health> {
        let now = Utc::now();
        let health = if kind.is_permanent() {
            Health::Dead
        } else {
            let cooldown = chrono::Duration::from_std(cooldown).unwrap_or(chrono::Duration::MAX);
            Health::CoolingDown {
                until: now.checked_add_signed(cooldown).unwrap_or(DateTime::<Utc>::MAX_UTC),
            }
        };

        {
            let mut map = self.credentials.write().await;
            let Some(credential) = map.get_mut(id) else {
                debug!(credential_id = id, "failure reported for removed credential");
                return None;
            };
            credential.health = health;
            credential.last_error_at = Some(now);
        }

        match health {
            Health::Dead => warn!(credential_id = id, kind = kind.label(), "credential marked dead"),
            _ => info!(
                credential_id = id,
                kind = kind.label(),
                cooldown_secs = cooldown.as_secs(),
                "credential cooling down"
            ),
        }
        if let Err(e) = self.persist().await {
            warn!(credential_id = id, error = %e, "failed to persist health change");
        }
        Some(health)
    }

    /// Record a successful use.
    pub async fn touch(&self, id: &str, at: DateTime<Utc>) {
        if let Some(credential) = self.credentials.write().await.get_mut(id) {
            credential.last_used_at = Some(at);
        }
    }

    /// Pool health summary for the health endpoint.
    ///
    /// Per provider: all usable → healthy, some usable → degraded, none →
    /// unhealthy. The overall status is the worst provider's status among
    /// providers that have any credential.
    pub async fn health(&self) -> serde_json::Value {
        let now = Utc::now();
        let map = self.credentials.read().await;
        let mut providers = serde_json::Map::new();
        let mut overall = "healthy";

        for provider in ProviderKind::ALL {
            let mut total = 0usize;
            let mut healthy = 0usize;
            let mut cooling = 0usize;
            let mut dead = 0usize;
            let mut disabled = 0usize;

            for c in map.values().filter(|c| c.provider == provider) {
                total += 1;
                if !c.enabled {
                    disabled += 1;
                    continue;
                }
                match c.health.at(now) {
                    Health::Healthy => healthy += 1,
                    Health::CoolingDown { .. } => cooling += 1,
                    Health::Dead => dead += 1,
                }
            }
            if total == 0 {
                continue;
            }

            let status = if healthy == total {
                "healthy"
            } else if healthy + cooling > 0 {
                "degraded"
            } else {
                "unhealthy"
            };
            overall = match (overall, status) {
                (_, "unhealthy") | ("unhealthy", _) => "unhealthy",
                (_, "degraded") | ("degraded", _) => "degraded",
                _ => "healthy",
            };

            providers.insert(
                provider.to_string(),
                serde_json::json!({
                    "status": status,
                    "credentials_total": total,
                    "credentials_healthy": healthy,
                    "credentials_cooling_down": cooling,
                    "credentials_dead": dead,
                    "credentials_disabled": disabled,
                }),
            );
        }

        if providers.is_empty() {
            overall = "unhealthy";
        }

        serde_json::json!({
            "status": overall,
            "credentials_total": map.len(),
            "providers": providers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn add_rejects_duplicate_secret() {
        let pool = CredentialPool::in_memory();
        let id = pool.add(ProviderKind::Grok, "sso-a".into(), None).await.unwrap();

        let err = pool.add(ProviderKind::Grok, " sso-a ".into(), None).await.unwrap_err();
        match err {
            Error::Duplicate(dup) => assert_eq!(dup, id),
            other => panic!("expected duplicate, got {other:?}"),
        }
        assert_eq!(pool.len().await, 1);
    }

    #[tokio::test]
    async fn add_rejects_empty_and_control_chars() {
        let pool = CredentialPool::in_memory();
        assert!(matches!(
            pool.add(ProviderKind::Grok, "   ".into(), None).await,
            Err(Error::InvalidSecret(_))
        ));
        assert!(matches!(
            pool.add(ProviderKind::Grok, "a\u{0}b".into(), None).await,
            Err(Error::InvalidSecret(_))
        ));
    }

    #[tokio::test]
    async fn list_is_provider_scoped_and_enabled_only() {
        let pool = CredentialPool::in_memory();
        let a = pool.add(ProviderKind::Grok, "g1".into(), None).await.unwrap();
        pool.add(ProviderKind::Grok, "g2".into(), None).await.unwrap();
        pool.add(ProviderKind::Gemini, "m1".into(), None).await.unwrap();

        pool.disable(&a).await.unwrap();
        let grok = pool.list(ProviderKind::Grok).await;
        assert_eq!(grok.len(), 1);
        assert!(grok.iter().all(|c| c.id != a));

        assert_eq!(pool.list_all(Some(ProviderKind::Grok)).await.len(), 2);
        assert_eq!(pool.list_all(None).await.len(), 3);
    }

    #[tokio::test]
    async fn candidates_exclude_dead_disabled_and_tried() {
        let pool = CredentialPool::in_memory();
        let a = pool.add(ProviderKind::Grok, "a".into(), None).await.unwrap();
        let b = pool.add(ProviderKind::Grok, "b".into(), None).await.unwrap();
        let c = pool.add(ProviderKind::Grok, "c".into(), None).await.unwrap();
        let d = pool.add(ProviderKind::Grok, "d".into(), None).await.unwrap();

        pool.report_failure(&a, TransientKind::SessionRevoked, Duration::from_secs(60))
            .await;
        pool.disable(&b).await.unwrap();
        pool.report_failure(&c, TransientKind::RateLimited, Duration::from_secs(60))
            .await;

        let tried: HashSet<String> = [d.clone()].into_iter().collect();
        let candidates = pool.candidates(ProviderKind::Grok, &tried).await;
        let ids: Vec<_> = candidates.iter().map(|c| c.id.clone()).collect();
        // Cooling-down stays a candidate; the selector ranks it last
        assert_eq!(ids, vec![c]);
    }

    #[tokio::test]
    async fn enable_clears_dead_state() {
        let pool = CredentialPool::in_memory();
        let id = pool.add(ProviderKind::Gemini, "s".into(), None).await.unwrap();
        let written = pool
            .report_failure(&id, TransientKind::SessionRevoked, Duration::from_secs(60))
            .await;
        assert_eq!(written, Some(Health::Dead));
        assert!(pool.candidates(ProviderKind::Gemini, &HashSet::new()).await.is_empty());

        pool.enable(&id).await.unwrap();
        let c = pool.get(&id).await.unwrap();
        assert_eq!(c.health, Health::Healthy);
        assert!(c.last_error_at.is_some());
    }

    #[tokio::test]
    async fn report_failure_on_removed_credential_is_ignored() {
        let pool = CredentialPool::in_memory();
        let id = pool.add(ProviderKind::Grok, "gone".into(), None).await.unwrap();
        pool.remove(&id).await.unwrap();

        let written = pool
            .report_failure(&id, TransientKind::RateLimited, Duration::from_secs(1))
            .await;
        assert!(written.is_none());
        assert!(matches!(pool.remove(&id).await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn import_counts_duplicates_and_invalid() {
        let pool = CredentialPool::in_memory();
        pool.add(ProviderKind::Grok, "k1".into(), None).await.unwrap();

        let summary = pool
            .import(
                ProviderKind::Grok,
                vec!["k1".into(), "k2".into(), "k2".into(), "".into(), "k3".into()],
            )
            .await
            .unwrap();
        assert_eq!(summary.added, 2);
        assert_eq!(summary.duplicates, 2);
        assert_eq!(summary.invalid, 1);
        assert_eq!(pool.len().await, 3);
    }

    #[tokio::test]
    async fn import_file_reads_one_key_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key.txt");
        tokio::fs::write(&path, "first\n\nsecond\n").await.unwrap();

        let pool = CredentialPool::in_memory();
        let summary = pool.import_file(ProviderKind::Grok, &path).await.unwrap();
        assert_eq!(summary.added, 2);
    }

    #[tokio::test]
    async fn file_backed_pool_persists_mutations() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");

        let pool = CredentialPool::load(CredentialFile::new(&path)).await.unwrap();
        let a = pool.add(ProviderKind::Grok, "sso-a".into(), Some("primary".into())).await.unwrap();
        let b = pool.add(ProviderKind::Grok, "sso-b".into(), None).await.unwrap();
        pool.report_failure(&a, TransientKind::SessionRevoked, Duration::from_secs(60))
            .await;
        pool.remove(&b).await.unwrap();

        let reloaded = CredentialPool::load(CredentialFile::new(&path)).await.unwrap();
        assert_eq!(reloaded.len().await, 1);
        let c = reloaded.get(&a).await.unwrap();
        assert_eq!(c.health, Health::Dead);
        assert_eq!(c.label.as_deref(), Some("primary"));
    }

    #[tokio::test]
    async fn failed_write_leaves_pool_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");

        let pool = CredentialPool::load(CredentialFile::new(&path)).await.unwrap();
        let a = pool.add(ProviderKind::Grok, "sso-a".into(), None).await.unwrap();

        // A directory in place of the file makes the rename fail
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();

        assert!(matches!(
            pool.add(ProviderKind::Grok, "sso-b".into(), None).await,
            Err(Error::Store(_))
        ));
        assert_eq!(pool.len().await, 1);
        assert_eq!(pool.candidates(ProviderKind::Grok, &HashSet::new()).await.len(), 1);

        let summary = pool
            .import(ProviderKind::Grok, vec!["sso-c".to_string(), "sso-d".to_string()])
            .await;
        assert!(summary.is_err());
        assert_eq!(pool.len().await, 1);

        assert!(pool.disable(&a).await.is_err());
        assert!(pool.get(&a).await.unwrap().enabled);

        assert!(pool.remove(&a).await.is_err());
        assert!(pool.get(&a).await.is_some());
    }

    #[tokio::test]
    async fn health_reports_per_provider_status() {
        let pool = CredentialPool::in_memory();
        assert_eq!(pool.health().await["status"], "unhealthy");

        let a = pool.add(ProviderKind::Grok, "a".into(), None).await.unwrap();
        pool.add(ProviderKind::Grok, "b".into(), None).await.unwrap();
        pool.add(ProviderKind::Gemini, "c".into(), None).await.unwrap();
        assert_eq!(pool.health().await["status"], "healthy");

        pool.report_failure(&a, TransientKind::RateLimited, Duration::from_secs(600))
            .await;
        let health = pool.health().await;
        assert_eq!(health["status"], "degraded");
        assert_eq!(health["providers"]["grok"]["status"], "degraded");
        assert_eq!(health["providers"]["grok"]["credentials_cooling_down"], 1);
        assert_eq!(health["providers"]["gemini"]["status"], "healthy");
    }

    #[tokio::test]
    async fn touch_sets_last_used() {
        let pool = CredentialPool::in_memory();
        let id = pool.add(ProviderKind::Grok, "a".into(), None).await.unwrap();
        let at = Utc::now();
        pool.touch(&id, at).await;
        assert_eq!(pool.get(&id).await.unwrap().last_used_at, Some(at));
    }
}
