//! Single-flight clearance refresher
//!
//! Holds the current `ClearanceToken` and serializes every solve behind one
//! mutex. Each completed refresh (success or failure) bumps a generation
//! counter. A caller records the generation it observed before queueing on
//! the mutex; if the generation moved while it waited, somebody else already
//! refreshed on its behalf and it takes that result instead of solving again.
//!
//! State machine:
//! - Uninitialized → Refreshing (first `token()` call or background task)
//! - Refreshing → Valid (solve succeeded)
//! - Valid → Expired (ttl elapsed) / Invalid (`force_refresh` after rejection)
//! - Expired | Invalid → Refreshing
//!
//! A failed refresh keeps the previous token in place and counts a
//! consecutive failure. Until `next_delay` has passed since that attempt,
//! callers get the stale token (or an error if there never was one) without
//! another solve; the background task sleeps on the same schedule.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::Secret;
use provider::ClearanceToken;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::solver::Solver;

/// Floor for every scheduled refresh delay.
const MIN_DELAY: Duration = Duration::from_secs(1);

/// Settings for one refresher.
#[derive(Debug, Clone)]
pub struct RefresherConfig {
    /// Page the solver opens to pass the challenge.
    pub target: String,
    /// Token lifetime assumed when the solver reports none.
    pub default_ttl: Duration,
    /// Background refresh period while the solver is healthy.
    pub interval: Duration,
    /// Backoff step per consecutive failure, capped at `interval`.
    pub backoff_base: Duration,
}

impl Default for RefresherConfig {
    fn default() -> Self {
        Self {
            target: "https://grok.com".into(),
            default_ttl: Duration::from_secs(3600),
            interval: Duration::from_secs(3600),
            backoff_base: Duration::from_secs(300),
        }
    }
}

/// Observable refresher state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClearanceState {
    Uninitialized,
    Refreshing,
    Valid,
    Expired,
    Invalid,
}

/// Snapshot for the admin API.
#[derive(Debug, Clone, Serialize)]
pub struct ClearanceStatus {
    pub state: ClearanceState,
    pub generation: u64,
    pub last_refresh: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub token_preview: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Default)]
struct Inner {
    token: Option<ClearanceToken>,
    generation: u64,
    invalidated: bool,
    consecutive_failures: u32,
    last_refresh: Option<DateTime<Utc>>,
    last_attempt_at: Option<Instant>,
    last_error: Option<String>,
}

impl Inner {
    fn lease(&self) -> Option<Lease> {
        self.token.as_ref().map(|token| Lease {
            token: token.clone(),
            generation: self.generation,
        })
    }

    fn unavailable(&self) -> Error {
        Error::Unavailable(
            self.last_error
                .clone()
                .unwrap_or_else(|| "refresh failed".into()),
        )
    }
}

/// A token together with the refresh generation that produced it.
#[derive(Debug, Clone)]
pub struct Lease {
    pub token: ClearanceToken,
    pub generation: u64,
}

/// Clears the in-progress flag even if the refreshing future is dropped.
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn start(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::Release);
        Self(flag)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct Refresher {
    solver: Arc<dyn Solver>,
    config: RefresherConfig,
    inner: RwLock<Inner>,
    flight: Mutex<()>,
    refreshing: AtomicBool,
}

impl Refresher {
    pub fn new(solver: Arc<dyn Solver>, config: RefresherConfig) -> Self {
        Self {
            solver,
            config,
            inner: RwLock::new(Inner::default()),
            flight: Mutex::new(()),
            refreshing: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &RefresherConfig {
        &self.config
    }

    /// Generation of the most recently completed refresh.
    pub async fn generation(&self) -> u64 {
        self.inner.read().await.generation
    }

    /// Token usable for a request right now.
    ///
    /// Refreshes first when there is no token, it expired, or it was reported
    /// rejected. If that refresh fails the stale token is returned anyway;
    /// only a process that never obtained a token gets an error. While
    /// refreshes are backing off no solve runs on the caller's path.
    pub async fn token(&self) -> Result<ClearanceToken> {
        self.lease().await.map(|lease| lease.token)
    }

    /// Like `token()`, also returning the generation the token belongs to so
    /// a later rejection can be reported against it.
    pub async fn lease(&self) -> Result<Lease> {
        let observed = {
            let inner = self.inner.read().await;
            match &inner.token {
                Some(token) if !inner.invalidated && !token.is_expired_at(Utc::now()) => {
                    return Ok(Lease {
                        token: token.clone(),
                        generation: inner.generation,
                    });
                }
                _ if self.backing_off(&inner) => {
                    return inner.lease().ok_or_else(|| inner.unavailable());
                }
                _ => inner.generation,
            }
        };
        self.refresh_after(observed).await
    }

    /// Report that upstream rejected the token handed out at `observed`
    /// generation and refresh it out of cycle.
    ///
    /// Many requests can hit the same rejection at once; only the first to
    /// acquire the flight lock solves, the rest reuse its result.
    pub async fn force_refresh(&self, observed: u64) -> Result<ClearanceToken> {
        {
            let mut inner = self.inner.write().await;
            if inner.generation == observed {
                inner.invalidated = true;
            }
        }
        self.refresh_after(observed).await.map(|lease| lease.token)
    }

    /// Unconditional refresh, for operators and the background task.
    pub async fn refresh_now(&self) -> Result<ClearanceToken> {
        let _guard = self.flight.lock().await;
        self.solve_locked().await.map(|lease| lease.token)
    }

    async fn refresh_after(&self, observed: u64) -> Result<Lease> {
        let _guard = self.flight.lock().await;
        {
            let inner = self.inner.read().await;
            if inner.generation != observed {
                debug!(
                    observed,
                    current = inner.generation,
                    "refresh completed while waiting, reusing result"
                );
                return inner.lease().ok_or_else(|| inner.unavailable());
            }
            if self.backing_off(&inner) {
                debug!(
                    failures = inner.consecutive_failures,
                    "clearance refresh backing off, serving stale token"
                );
                return inner.lease().ok_or_else(|| inner.unavailable());
            }
        }
        self.solve_locked().await
    }

    /// True while the last refresh failed less than `next_delay` ago.
    fn backing_off(&self, inner: &Inner) -> bool {
        inner.consecutive_failures > 0
            && inner.last_attempt_at.is_some_and(|at| {
                at.elapsed() < next_delay(&self.config, inner.consecutive_failures, None)
            })
    }

    /// Run one solve. Caller must hold `flight`.
    async fn solve_locked(&self) -> Result<Lease> {
        let result = {
            let _in_flight = InFlight::start(&self.refreshing);
            self.solver.solve(&self.config.target).await
        };

        let mut inner = self.inner.write().await;
        inner.generation += 1;
        inner.last_attempt_at = Some(Instant::now());

        match result {
            Ok(solved) => {
                let now = Utc::now();
                let token = ClearanceToken {
                    value: Secret::new(solved.token),
                    user_agent: solved.user_agent,
                    obtained_at: now,
                    ttl: solved.ttl.unwrap_or(self.config.default_ttl),
                };
                inner.token = Some(token.clone());
                inner.invalidated = false;
                inner.consecutive_failures = 0;
                inner.last_refresh = Some(now);
                inner.last_error = None;
                metrics::counter!("clearance_refresh_total", "result" => "success").increment(1);
                info!(
                    generation = inner.generation,
                    ttl_secs = token.ttl.as_secs(),
                    token = %token.value.masked(),
                    "clearance token refreshed"
                );
                Ok(Lease {
                    token,
                    generation: inner.generation,
                })
            }
            Err(e) => {
                inner.consecutive_failures += 1;
                inner.last_error = Some(e.to_string());
                metrics::counter!("clearance_refresh_total", "result" => "failure").increment(1);
                match &inner.token {
                    Some(stale) => {
                        warn!(
                            error = %e,
                            failures = inner.consecutive_failures,
                            "clearance refresh failed, keeping stale token"
                        );
                        Ok(Lease {
                            token: stale.clone(),
                            generation: inner.generation,
                        })
                    }
                    None => {
                        warn!(
                            error = %e,
                            failures = inner.consecutive_failures,
                            "clearance refresh failed, no token available"
                        );
                        Err(Error::Unavailable(e.to_string()))
                    }
                }
            }
        }
    }

    pub async fn consecutive_failures(&self) -> u32 {
        self.inner.read().await.consecutive_failures
    }

    pub async fn status(&self) -> ClearanceStatus {
        let inner = self.inner.read().await;
        let now = Utc::now();

        let state = if self.refreshing.load(Ordering::Acquire) {
            ClearanceState::Refreshing
        } else {
            match &inner.token {
                None => ClearanceState::Uninitialized,
                Some(_) if inner.invalidated => ClearanceState::Invalid,
                Some(token) if token.is_expired_at(now) => ClearanceState::Expired,
                Some(_) => ClearanceState::Valid,
            }
        };

        let expires_at = inner.token.as_ref().and_then(|t| {
            chrono::Duration::from_std(t.ttl)
                .ok()
                .map(|ttl| t.obtained_at + ttl)
        });

        ClearanceStatus {
            state,
            generation: inner.generation,
            last_refresh: inner.last_refresh,
            expires_at,
            consecutive_failures: inner.consecutive_failures,
            last_error: inner.last_error.clone(),
            token_preview: inner.token.as_ref().map(|t| t.value.masked()),
            user_agent: inner.token.as_ref().map(|t| t.user_agent.clone()),
        }
    }
}

/// Delay before the next background refresh.
///
/// Healthy: the configured interval, shortened so the token is renewed
/// before its ttl runs out. Failing: `backoff_base * failures`, capped at
/// the interval. Never less than one second.
pub fn next_delay(config: &RefresherConfig, failures: u32, ttl: Option<Duration>) -> Duration {
    let delay = if failures == 0 {
        match ttl {
            Some(ttl) => config.interval.min(ttl - ttl / 10),
            None => config.interval,
        }
    } else {
        config
            .interval
            .min(config.backoff_base.saturating_mul(failures))
    };
    delay.max(MIN_DELAY)
}

/// Spawn the background refresh loop.
///
/// Refreshes immediately, then again after `next_delay`. Runs until the
/// returned handle is aborted.
pub fn spawn_refresh_task(refresher: Arc<Refresher>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let delay = refresh_cycle(&refresher).await;
            debug!(delay_secs = delay.as_secs(), "next clearance refresh scheduled");
            tokio::time::sleep(delay).await;
        }
    })
}

/// Run one background refresh and return the delay until the next one.
async fn refresh_cycle(refresher: &Refresher) -> Duration {
    let ttl = match refresher.refresh_now().await {
        Ok(token) => Some(token.ttl),
        Err(_) => None,
    };
    let failures = refresher.consecutive_failures().await;
    next_delay(refresher.config(), failures, if failures == 0 { ttl } else { None })
}
