//! Credential file persistence
//!
//! A JSON file mapping credential id to its record, secret included. Every
//! write goes to a temp file in the same directory which is then renamed over
//! the target, so a crash never leaves a half-written file. The file is
//! created with 0600 permissions since it holds live session cookies.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use common::Secret;
use provider::ProviderKind;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::credential::{Credential, Health};
use crate::error::{Error, Result};

/// On-disk shape of a credential. Kept separate so `Secret` never gains a
/// `Serialize` impl.
#[derive(Debug, Serialize, Deserialize)]
struct StoredCredential {
    provider: ProviderKind,
    secret: String,
    enabled: bool,
    health: Health,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    label: Option<String>,
    added_at: DateTime<Utc>,
    #[serde(default)]
    last_used_at: Option<DateTime<Utc>>,
    #[serde(default)]
    last_error_at: Option<DateTime<Utc>>,
}

impl From<&Credential> for StoredCredential {
    fn from(c: &Credential) -> Self {
        Self {
            provider: c.provider,
            secret: c.secret.expose().clone(),
            enabled: c.enabled,
            health: c.health,
            label: c.label.clone(),
            added_at: c.added_at,
            last_used_at: c.last_used_at,
            last_error_at: c.last_error_at,
        }
    }
}

impl StoredCredential {
    fn into_credential(self, id: String) -> Credential {
        Credential {
            id,
            provider: self.provider,
            secret: Secret::new(self.secret),
            enabled: self.enabled,
            health: self.health,
            label: self.label,
            added_at: self.added_at,
            last_used_at: self.last_used_at,
            last_error_at: self.last_error_at,
        }
    }
}

/// Location of the credential file.
#[derive(Debug, Clone)]
pub struct CredentialFile {
    path: PathBuf,
}

impl CredentialFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every credential from disk.
    ///
    /// A missing file is a cold start: it is created as `{}` and an empty
    /// list is returned.
    pub async fn load(&self) -> Result<Vec<Credential>> {
        if !self.path.exists() {
            info!(path = %self.path.display(), "credential file not found, starting with empty pool");
            self.save(&[]).await?;
            return Ok(Vec::new());
        }

        let contents = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| Error::Store(format!("reading credential file: {e}")))?;
        let records: BTreeMap<String, StoredCredential> = serde_json::from_str(&contents)
            .map_err(|e| Error::Store(format!("parsing credential file: {e}")))?;

        info!(path = %self.path.display(), credentials = records.len(), "loaded credentials");
        Ok(records
            .into_iter()
            .map(|(id, record)| record.into_credential(id))
            .collect())
    }

    /// Persist `credentials` atomically.
    pub async fn save(&self, credentials: &[Credential]) -> Result<()> {
        let records: BTreeMap<&str, StoredCredential> = credentials
            .iter()
            .map(|c| (c.id.as_str(), StoredCredential::from(c)))
            .collect();
        let json = serde_json::to_string_pretty(&records)
            .map_err(|e| Error::Store(format!("serializing credentials: {e}")))?;
        write_atomic(&self.path, json.as_bytes()).await?;
        debug!(path = %self.path.display(), credentials = credentials.len(), "persisted credentials");
        Ok(())
    }
}

async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));

    let tmp_path = dir.join(format!(".credentials.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, data)
        .await
        .map_err(|e| Error::Store(format!("writing temp credential file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Store(format!("setting credential file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Store(format!("renaming temp credential file: {e}")))?;
    Ok(())
}

/// Parse a plain-text key file: one secret per line, blank lines and
/// `#` comments ignored.
pub fn parse_key_lines(contents: &str) -> Vec<String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}
