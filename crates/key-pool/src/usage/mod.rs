//! Usage counters and rotation cursors
//!
//! `UsageStore` is the only writer of per-credential usage counts. Counts are
//! keyed by `(credential_id, bucket)` where a bucket is one calendar day in a
//! fixed UTC offset, so "daily limit" means the same thing on every host.
//!
//! Three backends implement the same contract:
//! - `MemoryUsageStore`: correct within one process
//! - `SqliteUsageStore`: a database file shared by every gateway process
//!   on the host, with atomic server-side increments
//! - `RedisUsageStore`: a Redis server shared by every instance on every
//!   host, with atomic `HINCRBY` increments
//!
//! The store also owns the round-robin cursors, so cursors survive restarts
//! exactly when the shared backend is in use.

mod memory;
mod redis_store;
mod sqlite;

pub use memory::MemoryUsageStore;
pub use redis_store::RedisUsageStore;
pub use sqlite::SqliteUsageStore;

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Offset, Utc};
use tracing::{debug, info, warn};

use crate::error::Result;

/// Boxed future returned by `UsageStore` methods.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// One calendar day (`YYYY-MM-DD`) in the reference offset. Orders
/// chronologically.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Bucket(String);

impl Bucket {
    pub fn new(day: impl Into<String>) -> Self {
        Self(day.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Maps instants to buckets in a fixed UTC offset.
#[derive(Debug, Clone, Copy)]
pub struct BucketClock {
    offset: FixedOffset,
}

impl BucketClock {
    pub fn new(offset: FixedOffset) -> Self {
        Self { offset }
    }

    /// Parse an offset such as `+08:00` or `-05:30`.
    pub fn parse(offset: &str) -> std::result::Result<Self, String> {
        offset
            .parse::<FixedOffset>()
            .map(Self::new)
            .map_err(|e| format!("invalid utc offset {offset:?}: {e}"))
    }

    pub fn bucket_at(&self, at: DateTime<Utc>) -> Bucket {
        Bucket(at.with_timezone(&self.offset).format("%Y-%m-%d").to_string())
    }

    pub fn today(&self) -> Bucket {
        self.bucket_at(Utc::now())
    }

    /// The bucket before the one containing `at`.
    pub fn previous(&self, at: DateTime<Utc>) -> Bucket {
        self.bucket_at(at - chrono::Duration::days(1))
    }
}

impl Default for BucketClock {
    /// UTC+8.
    fn default() -> Self {
        Self {
            offset: FixedOffset::east_opt(8 * 3600).unwrap_or_else(|| Utc.fix()),
        }
    }
}

/// Atomic usage counters plus rotation cursors.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility (`Arc<dyn UsageStore>`).
pub trait UsageStore: Send + Sync {
    /// Add one use and return the new count. Concurrent calls never lose an
    /// update.
    fn increment<'a>(&'a self, credential_id: &'a str, bucket: &'a Bucket) -> StoreFuture<'a, u64>;

    fn get<'a>(&'a self, credential_id: &'a str, bucket: &'a Bucket) -> StoreFuture<'a, u64>;

    /// Counts for several credentials in one call; missing ids read as 0.
    fn get_many<'a>(
        &'a self,
        credential_ids: &'a [String],
        bucket: &'a Bucket,
    ) -> StoreFuture<'a, HashMap<String, u64>>;

    /// Clear every counter in `bucket`. Returns the number of counters removed.
    fn reset<'a>(&'a self, bucket: &'a Bucket) -> StoreFuture<'a, u64>;

    /// Drop every bucket older than `keep_from`. Returns rows removed.
    fn prune<'a>(&'a self, keep_from: &'a Bucket) -> StoreFuture<'a, u64>;

    /// Return the cursor for `scope` and advance it by one.
    fn advance_cursor<'a>(&'a self, scope: &'a str) -> StoreFuture<'a, u64>;

    /// Current cursor for `scope` without advancing.
    fn cursor<'a>(&'a self, scope: &'a str) -> StoreFuture<'a, u64>;

    /// Backend name for logs and the admin API.
    fn backend(&self) -> &'static str;
}

/// Which backend to construct.
#[derive(Debug, Clone)]
pub enum UsageBackend {
    Memory,
    Sqlite { path: PathBuf },
    /// `url` may carry a password, so it is never logged.
    Redis { url: String, key_prefix: String },
}

/// Build the configured backend. This is the only place the choice is made.
pub async fn open(backend: &UsageBackend) -> Result<Arc<dyn UsageStore>> {
    match backend {
        UsageBackend::Memory => {
            info!("usage store: in-process");
            Ok(Arc::new(MemoryUsageStore::new()))
        }
        UsageBackend::Sqlite { path } => {
            let owned = path.clone();
            let store = tokio::task::spawn_blocking(move || SqliteUsageStore::open(&owned))
                .await
                .map_err(|e| crate::Error::Store(format!("opening usage database: {e}")))??;
            info!(path = %path.display(), "usage store: shared sqlite");
            Ok(Arc::new(store))
        }
        UsageBackend::Redis { url, key_prefix } => {
            let store = RedisUsageStore::connect(url, key_prefix.clone()).await?;
            info!(key_prefix = %key_prefix, "usage store: shared redis");
            Ok(Arc::new(store))
        }
    }
}

/// Spawn a task that drops buckets older than yesterday every `interval`.
pub fn spawn_prune_task(
    store: Arc<dyn UsageStore>,
    clock: BucketClock,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            prune_cycle(store.as_ref(), &clock, Utc::now()).await;
        }
    })
}

async fn prune_cycle(store: &dyn UsageStore, clock: &BucketClock, now: DateTime<Utc>) {
    let keep_from = clock.previous(now);
    match store.prune(&keep_from).await {
        Ok(0) => debug!(keep_from = %keep_from, "no usage buckets to prune"),
        Ok(removed) => info!(keep_from = %keep_from, removed, "pruned old usage buckets"),
        Err(e) => warn!(error = %e, "usage prune failed, will retry next cycle"),
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn bucket_uses_reference_offset() {
        let clock = BucketClock::parse("+08:00").unwrap();
        // 2025-03-01 17:30 UTC is already 2025-03-02 in UTC+8
        let at = Utc.with_ymd_and_hms(2025, 3, 1, 17, 30, 0).unwrap();
        assert_eq!(clock.bucket_at(at).as_str(), "2025-03-02");
        assert_eq!(clock.previous(at).as_str(), "2025-03-01");

        let utc = BucketClock::parse("+00:00").unwrap();
        assert_eq!(utc.bucket_at(at).as_str(), "2025-03-01");
    }

    #[test]
    fn default_clock_is_utc_plus_eight() {
        let at = Utc.with_ymd_and_hms(2025, 3, 1, 16, 0, 0).unwrap();
        assert_eq!(BucketClock::default().bucket_at(at).as_str(), "2025-03-02");
    }

    #[test]
    fn invalid_offset_is_rejected() {
        assert!(BucketClock::parse("Asia/Shanghai").is_err());
    }

    #[test]
    fn buckets_order_chronologically() {
        assert!(Bucket::new("2025-01-09") < Bucket::new("2025-01-10"));
        assert!(Bucket::new("2024-12-31") < Bucket::new("2025-01-01"));
    }

    #[tokio::test]
    async fn prune_cycle_keeps_previous_day() {
        let store: Arc<dyn UsageStore> = Arc::new(MemoryUsageStore::new());
        let clock = BucketClock::parse("+00:00").unwrap();
        let now = Utc.with_ymd_and_hms(2025, 1, 10, 12, 0, 0).unwrap();
        for day in ["2025-01-08", "2025-01-09", "2025-01-10"] {
            store.increment("a", &Bucket::new(day)).await.unwrap();
        }

        prune_cycle(store.as_ref(), &clock, now).await;

        assert_eq!(store.get("a", &Bucket::new("2025-01-08")).await.unwrap(), 0);
        assert_eq!(store.get("a", &Bucket::new("2025-01-09")).await.unwrap(), 1);
        assert_eq!(store.get("a", &Bucket::new("2025-01-10")).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn open_selects_backend() {
        let memory = open(&UsageBackend::Memory).await.unwrap();
        assert_eq!(memory.backend(), "memory");

        let dir = tempfile::tempdir().unwrap();
        let sqlite = open(&UsageBackend::Sqlite {
            path: dir.path().join("usage.db"),
        })
        .await
        .unwrap();
        assert_eq!(sqlite.backend(), "sqlite");

        let Ok(url) = std::env::var("USAGE_TEST_REDIS_URL") else {
            return;
        };
        let redis = open(&UsageBackend::Redis {
            url,
            key_prefix: "media-gateway-test:open:".into(),
        })
        .await
        .unwrap();
        assert_eq!(redis.backend(), "redis");
    }

    #[tokio::test]
    async fn unreachable_redis_fails_to_open() {
        let err = open(&UsageBackend::Redis {
            url: "redis://127.0.0.1:1/".into(),
            key_prefix: "x:".into(),
        })
        .await
        .err()
        .unwrap();
        assert!(matches!(err, crate::Error::Store(_)));
    }
}
