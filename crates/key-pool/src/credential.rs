//! Credential record and health state machine

use chrono::{DateTime, Utc};
use common::Secret;
use provider::ProviderKind;
use serde::{Deserialize, Serialize};

/// Runtime health of a credential.
///
/// Transitions (written only by dispatch, except admin `enable`):
/// - Healthy → CoolingDown (transient failure)
/// - Healthy | CoolingDown → Dead (session revoked)
/// - CoolingDown → Healthy (cool-down elapsed, observed lazily)
/// - Dead → Healthy (administrative re-enable)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Health {
    Healthy,
    CoolingDown { until: DateTime<Utc> },
    Dead,
}

impl Health {
    pub fn label(&self) -> &'static str {
        match self {
            Health::Healthy => "healthy",
            Health::CoolingDown { .. } => "cooling_down",
            Health::Dead => "dead",
        }
    }

    /// Health as observed at `now`: an elapsed cool-down counts as healthy.
    pub fn at(&self, now: DateTime<Utc>) -> Health {
        match self {
            Health::CoolingDown { until } if now >= *until => Health::Healthy,
            other => *other,
        }
    }

    pub fn is_dead(&self) -> bool {
        matches!(self, Health::Dead)
    }
}

/// One session credential for one provider.
///
/// The secret is only read on the dispatch path; everything else that leaves
/// the pool goes through `CredentialView`.
#[derive(Debug, Clone)]
pub struct Credential {
    /// First 16 hex chars of SHA-256(secret).
    pub id: String,
    pub provider: ProviderKind,
    pub secret: Secret<String>,
    pub enabled: bool,
    pub health: Health,
    pub label: Option<String>,
    pub added_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub last_error_at: Option<DateTime<Utc>>,
}

impl Credential {
    pub fn new(provider: ProviderKind, secret: String, label: Option<String>) -> Self {
        let secret = Secret::new(secret.trim().to_string());
        Self {
            id: secret.fingerprint(),
            provider,
            secret,
            enabled: true,
            health: Health::Healthy,
            label,
            added_at: Utc::now(),
            last_used_at: None,
            last_error_at: None,
        }
    }

    pub fn view(&self, now: DateTime<Utc>) -> CredentialView {
        let health = self.health.at(now);
        let cooldown_remaining_secs = match health {
            Health::CoolingDown { until } => Some((until - now).num_seconds().max(0) as u64),
            _ => None,
        };
        CredentialView {
            id: self.id.clone(),
            provider: self.provider,
            masked: self.secret.masked(),
            label: self.label.clone(),
            enabled: self.enabled,
            health: health.label(),
            cooldown_remaining_secs,
            added_at: self.added_at,
            last_used_at: self.last_used_at,
            last_error_at: self.last_error_at,
        }
    }
}

/// Secret-free projection for admin listings and health output.
#[derive(Debug, Clone, Serialize)]
pub struct CredentialView {
    pub id: String,
    pub provider: ProviderKind,
    pub masked: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub enabled: bool,
    pub health: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cooldown_remaining_secs: Option<u64>,
    pub added_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub last_error_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_is_fingerprint_of_trimmed_secret() {
        let a = Credential::new(ProviderKind::Grok, "  sso-value\n".into(), None);
        let b = Credential::new(ProviderKind::Grok, "sso-value".into(), None);
        assert_eq!(a.id, b.id);
        assert_eq!(a.id.len(), 16);
        assert_eq!(a.secret.expose(), "sso-value");
    }

    #[test]
    fn elapsed_cooldown_reads_as_healthy() {
        let now = Utc::now();
        let cooling = Health::CoolingDown {
            until: now - chrono::Duration::seconds(1),
        };
        assert_eq!(cooling.at(now), Health::Healthy);

        let still = Health::CoolingDown {
            until: now + chrono::Duration::seconds(60),
        };
        assert_eq!(still.at(now).label(), "cooling_down");
        assert_eq!(Health::Dead.at(now), Health::Dead);
    }

    #[test]
    fn health_serializes_with_state_tag() {
        let json = serde_json::to_value(Health::Dead).unwrap();
        assert_eq!(json, serde_json::json!({"state": "dead"}));
        let back: Health =
            serde_json::from_value(serde_json::json!({"state": "healthy"})).unwrap();
        assert_eq!(back, Health::Healthy);
    }

    #[test]
    fn view_never_contains_secret() {
        let credential = Credential::new(
            ProviderKind::Gemini,
            "very-secret-session-cookie".into(),
            Some("main".into()),
        );
        let json = serde_json::to_string(&credential.view(Utc::now())).unwrap();
        assert!(!json.contains("very-secret-session-cookie"));
        assert!(json.contains("very-s...okie"));
        assert!(json.contains("\"label\":\"main\""));
    }

    #[test]
    fn view_reports_cooldown_remaining() {
        let mut credential = Credential::new(ProviderKind::Grok, "k".into(), None);
        let now = Utc::now();
        credential.health = Health::CoolingDown {
            until: now + chrono::Duration::seconds(90),
        };
        let view = credential.view(now);
        assert_eq!(view.health, "cooling_down");
        assert_eq!(view.cooldown_remaining_secs, Some(90));
    }
}
