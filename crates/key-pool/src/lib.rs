//! Credential pool and dispatch engine for upstream media providers
//!
//! Holds many interchangeable session credentials per provider and spreads
//! requests across them. Credentials that get rate-limited or logged out are
//! benched for a cool-down (or retired, when revoked) and the request moves to
//! the next one, within a fixed attempt budget and a request deadline.
//!
//! Credential lifecycle:
//! 1. Admin adds or imports a secret → stored, `Healthy`
//! 2. Selector picks it for a request by the provider's strategy
//! 3. Upstream succeeds → usage count for today's bucket +1
//! 4. Upstream fails transiently → `CoolingDown` (or `Dead` when revoked),
//!    request retried on another credential
//! 5. Cool-down elapses → treated as `Healthy` again on the next read
//! 6. Admin disables, re-enables or removes it at any time

pub mod credential;
pub mod dispatch;
pub mod error;
pub mod pool;
pub mod router;
pub mod selector;
pub mod store;
pub mod usage;

pub use credential::{Credential, CredentialView, Health};
pub use dispatch::{
    CredentialUsage, DispatchAttempt, DispatchPolicy, Dispatched, Dispatcher, RotationSnapshot,
};
pub use error::{Error, Result};
pub use pool::{CredentialPool, ImportSummary};
pub use router::BackendRouter;
pub use selector::{OverflowPolicy, SelectionPolicy, Strategy};
pub use store::{CredentialFile, parse_key_lines};
pub use usage::{
    Bucket, BucketClock, MemoryUsageStore, RedisUsageStore, SqliteUsageStore, UsageBackend,
    UsageStore, spawn_prune_task,
};
