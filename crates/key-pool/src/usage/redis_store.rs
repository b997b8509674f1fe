//! Shared usage store on a Redis server
//!
//! Any number of gateway instances on any number of hosts point at the same
//! server. Counts for one bucket live in a hash `{prefix}usage:{bucket}` and
//! are bumped with `HINCRBY`, which the server applies atomically. A set
//! `{prefix}usage:buckets` indexes the live buckets so prune can find them
//! without scanning the keyspace. Cursors are plain `INCR` counters.

use std::collections::HashMap;

use redis::aio::ConnectionManager;
use tracing::debug;

use super::{Bucket, StoreFuture, UsageStore};
use crate::error::Result;

/// Buckets expire on their own after this long even if prune never runs.
const BUCKET_TTL_SECS: i64 = 3 * 24 * 3600;

pub struct RedisUsageStore {
    conn: ConnectionManager,
    prefix: String,
}

impl RedisUsageStore {
    /// Connect to `url` (`redis://` or `rediss://`). Every key is placed
    /// under `prefix`.
    pub async fn connect(url: &str, prefix: impl Into<String>) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        let store = Self::with_connection(conn, prefix);
        debug!(prefix = %store.prefix, "usage redis connection ready");
        Ok(store)
    }

    /// Wrap an existing connection. Clones of one manager share a socket.
    pub fn with_connection(conn: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            conn,
            prefix: prefix.into(),
        }
    }

    fn bucket_key(&self, bucket: &str) -> String {
        format!("{}usage:{bucket}", self.prefix)
    }

    fn index_key(&self) -> String {
        format!("{}usage:buckets", self.prefix)
    }

    fn cursor_key(&self, scope: &str) -> String {
        format!("{}cursor:{scope}", self.prefix)
    }

    /// Delete one bucket hash and its index entry. Returns the fields removed.
    async fn drop_bucket(&self, bucket: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        let key = self.bucket_key(bucket);
        let (removed,): (i64,) = redis::pipe()
            .atomic()
            .cmd("HLEN")
            .arg(&key)
            .cmd("DEL")
            .arg(&key)
            .ignore()
            .cmd("SREM")
            .arg(self.index_key())
            .arg(bucket)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(to_count(removed))
    }
}

fn to_count(value: i64) -> u64 {
    value.max(0) as u64
}

impl UsageStore for RedisUsageStore {
    fn increment<'a>(&'a self, credential_id: &'a str, bucket: &'a Bucket) -> StoreFuture<'a, u64> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let key = self.bucket_key(bucket.as_str());
            let (count,): (i64,) = redis::pipe()
                .atomic()
                .cmd("HINCRBY")
                .arg(&key)
                .arg(credential_id)
                .arg(1)
                .cmd("EXPIRE")
                .arg(&key)
                .arg(BUCKET_TTL_SECS)
                .ignore()
                .cmd("SADD")
                .arg(self.index_key())
                .arg(bucket.as_str())
                .ignore()
                .query_async(&mut conn)
                .await?;
            Ok(to_count(count))
        })
    }

    fn get<'a>(&'a self, credential_id: &'a str, bucket: &'a Bucket) -> StoreFuture<'a, u64> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let count: Option<i64> = redis::cmd("HGET")
                .arg(self.bucket_key(bucket.as_str()))
                .arg(credential_id)
                .query_async(&mut conn)
                .await?;
            Ok(to_count(count.unwrap_or(0)))
        })
    }

    fn get_many<'a>(
        &'a self,
        credential_ids: &'a [String],
        bucket: &'a Bucket,
    ) -> StoreFuture<'a, HashMap<String, u64>> {
        Box::pin(async move {
            if credential_ids.is_empty() {
                return Ok(HashMap::new());
            }
            let mut conn = self.conn.clone();
            let counts: Vec<Option<i64>> = redis::cmd("HMGET")
                .arg(self.bucket_key(bucket.as_str()))
                .arg(credential_ids)
                .query_async(&mut conn)
                .await?;
            Ok(credential_ids
                .iter()
                .zip(counts)
                .map(|(id, count)| (id.clone(), to_count(count.unwrap_or(0))))
                .collect())
        })
    }

    fn reset<'a>(&'a self, bucket: &'a Bucket) -> StoreFuture<'a, u64> {
        Box::pin(self.drop_bucket(bucket.as_str()))
    }

    fn prune<'a>(&'a self, keep_from: &'a Bucket) -> StoreFuture<'a, u64> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let buckets: Vec<String> = redis::cmd("SMEMBERS")
                .arg(self.index_key())
                .query_async(&mut conn)
                .await?;
            let mut removed = 0;
            for bucket in buckets.iter().filter(|b| b.as_str() < keep_from.as_str()) {
                removed += self.drop_bucket(bucket).await?;
            }
            Ok(removed)
        })
    }

    fn advance_cursor<'a>(&'a self, scope: &'a str) -> StoreFuture<'a, u64> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let next: i64 = redis::cmd("INCR")
                .arg(self.cursor_key(scope))
                .query_async(&mut conn)
                .await?;
            Ok(to_count(next - 1))
        })
    }

    fn cursor<'a>(&'a self, scope: &'a str) -> StoreFuture<'a, u64> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let value: Option<i64> = redis::cmd("GET")
                .arg(self.cursor_key(scope))
                .query_async(&mut conn)
                .await?;
            Ok(to_count(value.unwrap_or(0)))
        })
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}
