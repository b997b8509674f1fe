//! Retry coordinator
//!
//! `Dispatcher::dispatch` runs one logical request against a provider:
//!
//! 1. ask the selector for a credential not yet tried in this request
//! 2. attach the clearance token when the client needs one
//! 3. call the client under the per-attempt timeout
//! 4. classify the outcome:
//!    - success: count one use, stamp `last_used_at`, return
//!    - transient: demote the credential (cool-down, or dead when revoked),
//!      force a clearance refresh on a challenge page, try the next one
//!    - fatal: return immediately, no health change
//!
//! Attempts within a request are strictly sequential and never repeat a
//! credential. The whole loop runs under a request deadline. Dropping the
//! returned future abandons the in-flight attempt without demoting the
//! credential or counting a use, since neither outcome was observed.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use clearance::{Lease, Refresher};
use provider::{
    Operation, Outcome, ProviderClient, ProviderKind, RawResult, TransientKind, UpstreamCall,
    UpstreamError,
};
use rand::RngExt;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::credential::Credential;
use crate::error::{Error, Result};
use crate::pool::CredentialPool;
use crate::selector::{
    Candidate, OverflowPolicy, SelectionContext, SelectionPolicy, Strategy, select,
};
use crate::usage::{Bucket, BucketClock, UsageStore};

/// Longest upstream message carried into a surfaced error.
const MAX_ERROR_MESSAGE: usize = 512;

/// Retry budget and timing for every dispatch.
#[derive(Debug, Clone)]
pub struct DispatchPolicy {
    /// Credentials tried per request.
    pub max_attempts: usize,
    /// How long a transiently failing credential sits out.
    pub cooldown: Duration,
    /// Cool-down after a clearance challenge. The session itself is usually
    /// fine, so it returns sooner than after other failures.
    pub clearance_cooldown: Duration,
    /// Bound on a single upstream call.
    pub attempt_timeout: Duration,
    /// Bound on the whole request, across attempts.
    pub deadline: Duration,
}

impl DispatchPolicy {
    /// Cool-down applied after a transient failure of `kind`.
    pub fn cooldown_for(&self, kind: TransientKind) -> Duration {
        match kind {
            TransientKind::ClearanceRejected => self.clearance_cooldown,
            _ => self.cooldown,
        }
    }
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            cooldown: Duration::from_secs(300),
            clearance_cooldown: Duration::from_secs(30),
            attempt_timeout: Duration::from_secs(120),
            deadline: Duration::from_secs(300),
        }
    }
}

/// Successful dispatch.
#[derive(Debug)]
pub struct Dispatched {
    pub result: RawResult,
    pub credential_id: String,
    pub attempts: usize,
    /// Usage count of the credential after this request.
    pub usage_count: u64,
}

/// Bookkeeping for one logical request. Never persisted.
#[derive(Debug)]
pub struct DispatchAttempt {
    pub request_id: String,
    pub provider: ProviderKind,
    pub credentials_tried: Vec<String>,
    pub attempt_count: usize,
    pub last_error_kind: Option<TransientKind>,
    last_message: String,
    tried: HashSet<String>,
}

impl DispatchAttempt {
    fn new(request_id: &str, provider: ProviderKind) -> Self {
        Self {
            request_id: request_id.to_string(),
            provider,
            credentials_tried: Vec::new(),
            attempt_count: 0,
            last_error_kind: None,
            last_message: String::new(),
            tried: HashSet::new(),
        }
    }

    fn record(&mut self, credential_id: &str) {
        if self.tried.insert(credential_id.to_string()) {
            self.credentials_tried.push(credential_id.to_string());
        }
        self.attempt_count += 1;
    }

    /// Terminal error once no further attempt is possible.
    fn exhausted(&self) -> Error {
        let provider = self.provider;
        let attempts = self.attempt_count;
        match self.last_error_kind {
            Some(TransientKind::ClearanceRejected) => Error::ClearanceInvalid {
                provider,
                attempts,
                message: self.last_message.clone(),
            },
            Some(kind) if kind.is_transport() => Error::TransportFailure {
                provider,
                attempts,
                message: self.last_message.clone(),
            },
            last => Error::CredentialsExhausted {
                provider,
                attempts,
                last,
            },
        }
    }
}

/// Per-provider view of rotation state for the admin API.
#[derive(Debug, Clone, Serialize)]
pub struct RotationSnapshot {
    pub provider: ProviderKind,
    pub strategy: Strategy,
    pub cursor: u64,
    pub bucket: String,
    pub daily_limit: Option<u64>,
    pub overflow: OverflowPolicy,
    pub credentials: Vec<CredentialUsage>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CredentialUsage {
    pub id: String,
    pub enabled: bool,
    pub health: &'static str,
    pub count: u64,
    pub last_used_at: Option<chrono::DateTime<Utc>>,
}

pub struct Dispatcher {
    pool: Arc<CredentialPool>,
    usage: Arc<dyn UsageStore>,
    clock: BucketClock,
    clearance: Option<Arc<Refresher>>,
    policy: DispatchPolicy,
    default_selection: SelectionPolicy,
    selection: HashMap<ProviderKind, SelectionPolicy>,
}

impl Dispatcher {
    pub fn new(
        pool: Arc<CredentialPool>,
        usage: Arc<dyn UsageStore>,
        clock: BucketClock,
        policy: DispatchPolicy,
        default_selection: SelectionPolicy,
    ) -> Self {
        Self {
            pool,
            usage,
            clock,
            clearance: None,
            policy,
            default_selection,
            selection: HashMap::new(),
        }
    }

    pub fn with_clearance(mut self, refresher: Arc<Refresher>) -> Self {
        self.clearance = Some(refresher);
        self
    }

    /// Override the selection policy for one provider.
    pub fn with_selection(mut self, provider: ProviderKind, policy: SelectionPolicy) -> Self {
        self.selection.insert(provider, policy);
        self
    }

    pub fn selection_policy(&self, provider: ProviderKind) -> SelectionPolicy {
        self.selection
            .get(&provider)
            .copied()
            .unwrap_or(self.default_selection)
    }

    pub fn pool(&self) -> &Arc<CredentialPool> {
        &self.pool
    }

    pub fn usage(&self) -> &Arc<dyn UsageStore> {
        &self.usage
    }

    pub fn clock(&self) -> &BucketClock {
        &self.clock
    }

    pub fn clearance(&self) -> Option<&Arc<Refresher>> {
        self.clearance.as_ref()
    }

    pub fn policy(&self) -> &DispatchPolicy {
        &self.policy
    }

    /// Run `operation` against `client`, rotating credentials on transient
    /// failure.
    #[instrument(skip_all, fields(request_id = %request_id, provider = %client.kind()))]
    pub async fn dispatch(
        &self,
        request_id: &str,
        client: &dyn ProviderClient,
        operation: &Operation,
    ) -> Result<Dispatched> {
        let provider = client.kind();
        let mut attempt = DispatchAttempt::new(request_id, provider);

        let outcome = tokio::time::timeout(
            self.policy.deadline,
            self.run(&mut attempt, client, operation),
        )
        .await;

        match outcome {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    attempts = attempt.attempt_count,
                    deadline_secs = self.policy.deadline.as_secs(),
                    "dispatch deadline exceeded"
                );
                Err(Error::DeadlineExceeded {
                    provider,
                    attempts: attempt.attempt_count,
                })
            }
        }
    }

    async fn run(
        &self,
        attempt: &mut DispatchAttempt,
        client: &dyn ProviderClient,
        operation: &Operation,
    ) -> Result<Dispatched> {
        let provider = attempt.provider;

        while attempt.attempt_count < self.policy.max_attempts {
            let bucket = self.clock.today();
            let Some(credential) = self.choose(provider, &attempt.tried, &bucket).await? else {
                debug!(tried = attempt.credentials_tried.len(), "no candidate left");
                return Err(attempt.exhausted());
            };

            let lease = self.lease_for(client, attempt).await?;
            attempt.record(&credential.id);
            let n = attempt.attempt_count;

            let call = UpstreamCall {
                operation,
                secret: &credential.secret,
                clearance: lease.as_ref().map(|l| &l.token),
            };
            let started = Instant::now();
            let result =
                match tokio::time::timeout(self.policy.attempt_timeout, client.execute(call)).await {
                    Ok(result) => result,
                    Err(_) => Err(UpstreamError::Timeout),
                };

            let error = match result {
                Ok(raw) => return Ok(self.succeed(&credential, &bucket, raw, n).await),
                Err(e) => e,
            };

            let kind = match client.classify(&error) {
                Outcome::Transient(kind) => kind,
                // An error that classifies as success is an unusable answer
                Outcome::Success => TransientKind::ProviderUnavailable,
                Outcome::Fatal(kind) => {
                    metrics::counter!(
                        "dispatch_attempts_total",
                        "provider" => provider.as_str(),
                        "outcome" => kind.label()
                    )
                    .increment(1);
                    info!(
                        credential_id = %credential.id,
                        attempt = n,
                        kind = kind.label(),
                        "upstream rejected request"
                    );
                    let status = match &error {
                        UpstreamError::Status { status, .. } => Some(*status),
                        _ => None,
                    };
                    return Err(Error::ProviderRejected {
                        provider,
                        kind,
                        status,
                        attempts: n,
                        message: truncate(&error.to_string()),
                    });
                }
            };

            metrics::counter!(
                "dispatch_attempts_total",
                "provider" => provider.as_str(),
                "outcome" => kind.label()
            )
            .increment(1);
            let message = truncate(&error.to_string());
            warn!(
                credential_id = %credential.id,
                attempt = n,
                kind = kind.label(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                error = %message,
                "transient upstream failure, rotating credential"
            );
            attempt.last_error_kind = Some(kind);
            attempt.last_message = message;

            if let Some(health) = self
                .pool
                .report_failure(&credential.id, kind, self.policy.cooldown_for(kind))
                .await
            {
                metrics::counter!(
                    "credential_demotions_total",
                    "provider" => provider.as_str(),
                    "health" => health.label()
                )
                .increment(1);
            }

            if kind == TransientKind::ClearanceRejected {
                self.refresh_clearance(lease.as_ref()).await;
            }
        }

        Err(attempt.exhausted())
    }

    /// Pick the next credential for `provider`, excluding `tried`.
    async fn choose(
        &self,
        provider: ProviderKind,
        tried: &HashSet<String>,
        bucket: &Bucket,
    ) -> Result<Option<Credential>> {
        let mut candidates = self.pool.candidates(provider, tried).await;
        if candidates.is_empty() {
            return Ok(None);
        }

        let ids: Vec<String> = candidates.iter().map(|c| c.id.clone()).collect();
        let counts = self.usage.get_many(&ids, bucket).await?;
        let policy = self.selection_policy(provider);
        let cursor = if policy.strategy == Strategy::RoundRobin {
            self.usage.advance_cursor(provider.as_str()).await?
        } else {
            0
        };
        let seed: u64 = rand::rng().random();

        let views: Vec<Candidate> = candidates
            .iter()
            .map(|c| Candidate::new(c, counts.get(&c.id).copied().unwrap_or(0)))
            .collect();
        let ctx = SelectionContext {
            cursor,
            seed,
            now: Utc::now(),
        };

        let Some(chosen) = select(&views, &policy, &ctx) else {
            return Ok(None);
        };
        let index = candidates.iter().position(|c| c.id == chosen.id);
        Ok(index.map(|i| candidates.swap_remove(i)))
    }

    /// Clearance token for this attempt, when the client needs one.
    async fn lease_for(
        &self,
        client: &dyn ProviderClient,
        attempt: &DispatchAttempt,
    ) -> Result<Option<Lease>> {
        if !client.requires_clearance() {
            return Ok(None);
        }
        let Some(refresher) = &self.clearance else {
            debug!("client requires clearance but no refresher is configured");
            return Ok(None);
        };
        match refresher.lease().await {
            Ok(lease) => Ok(Some(lease)),
            Err(e) => {
                warn!(error = %e, "no clearance token, failing request");
                Err(Error::ClearanceInvalid {
                    provider: attempt.provider,
                    attempts: attempt.attempt_count,
                    message: e.to_string(),
                })
            }
        }
    }

    async fn refresh_clearance(&self, lease: Option<&Lease>) {
        let (Some(refresher), Some(lease)) = (&self.clearance, lease) else {
            return;
        };
        if let Err(e) = refresher.force_refresh(lease.generation).await {
            warn!(error = %e, "out-of-cycle clearance refresh failed");
        }
    }

    async fn succeed(
        &self,
        credential: &Credential,
        bucket: &Bucket,
        result: RawResult,
        attempts: usize,
    ) -> Dispatched {
        metrics::counter!(
            "dispatch_attempts_total",
            "provider" => credential.provider.as_str(),
            "outcome" => "success"
        )
        .increment(1);

        // The request already succeeded upstream; a counter failure must not
        // turn it into an error for the caller
        let usage_count = match self.usage.increment(&credential.id, bucket).await {
            Ok(count) => count,
            Err(e) => {
                warn!(credential_id = %credential.id, error = %e, "failed to record usage");
                0
            }
        };
        self.pool.touch(&credential.id, Utc::now()).await;

        debug!(
            credential_id = %credential.id,
            attempts,
            usage_count,
            "dispatch succeeded"
        );
        Dispatched {
            result,
            credential_id: credential.id.clone(),
            attempts,
            usage_count,
        }
    }

    /// Current rotation state of `provider`.
    pub async fn rotation_snapshot(&self, provider: ProviderKind) -> Result<RotationSnapshot> {
        let policy = self.selection_policy(provider);
        let bucket = self.clock.today();

        let credentials = self.pool.list_all(Some(provider)).await;
        let ids: Vec<String> = credentials.iter().map(|c| c.id.clone()).collect();
        let counts = self.usage.get_many(&ids, &bucket).await?;
        let cursor = self.usage.cursor(provider.as_str()).await?;

        let usage = credentials
            .into_iter()
            .map(|view| CredentialUsage {
                count: counts.get(&view.id).copied().unwrap_or(0),
                id: view.id,
                enabled: view.enabled,
                health: view.health,
                last_used_at: view.last_used_at,
            })
            .collect();

        Ok(RotationSnapshot {
            provider,
            strategy: policy.strategy,
            cursor,
            bucket: bucket.to_string(),
            daily_limit: policy.daily_limit,
            overflow: policy.overflow,
            credentials: usage,
        })
    }
}

fn truncate(message: &str) -> String {
    if message.len() <= MAX_ERROR_MESSAGE {
        return message.to_string();
    }
    let mut end = MAX_ERROR_MESSAGE;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &message[..end])
}
