//! Shared usage store on a SQLite database file
//!
//! Every gateway process on a host opens the same file. WAL mode lets readers
//! proceed while one writer commits, and the busy timeout makes concurrent
//! writers queue instead of failing. Increments are a single upsert with
//! `RETURNING`, so the read-modify-write happens inside SQLite and no update
//! is lost between processes.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension, params};
use tracing::debug;

use super::{Bucket, StoreFuture, UsageStore};
use crate::error::{Error, Result};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS credential_usage (
    credential_id TEXT NOT NULL,
    bucket        TEXT NOT NULL,
    count         INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (credential_id, bucket)
);
CREATE INDEX IF NOT EXISTS idx_credential_usage_bucket ON credential_usage (bucket);
CREATE TABLE IF NOT EXISTS rotation_cursor (
    scope TEXT PRIMARY KEY,
    value INTEGER NOT NULL
);
";

pub struct SqliteUsageStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteUsageStore {
    /// Open (creating if needed) the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Store(format!("creating usage db directory: {e}")))?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.execute_batch(SCHEMA)?;
        debug!(path = %path.display(), journal_mode = %mode, "usage database ready");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` on the connection from the blocking pool.
    fn run<'a, T, F>(&'a self, f: F) -> StoreFuture<'a, T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || {
                let conn = conn
                    .lock()
                    .map_err(|_| Error::Store("usage connection lock poisoned".into()))?;
                f(&conn)
            })
            .await
            .map_err(|e| Error::Store(format!("usage task failed: {e}")))?
        })
    }
}

fn to_count(value: i64) -> u64 {
    value.max(0) as u64
}

impl UsageStore for SqliteUsageStore {
    fn increment<'a>(&'a self, credential_id: &'a str, bucket: &'a Bucket) -> StoreFuture<'a, u64> {
        let id = credential_id.to_string();
        let bucket = bucket.as_str().to_string();
        self.run(move |conn| {
            let count: i64 = conn.query_row(
                "INSERT INTO credential_usage (credential_id, bucket, count) VALUES (?1, ?2, 1)
                 ON CONFLICT (credential_id, bucket) DO UPDATE SET count = count + 1
                 RETURNING count",
                params![id, bucket],
                |row| row.get(0),
            )?;
            Ok(to_count(count))
        })
    }

    fn get<'a>(&'a self, credential_id: &'a str, bucket: &'a Bucket) -> StoreFuture<'a, u64> {
        let id = credential_id.to_string();
        let bucket = bucket.as_str().to_string();
        self.run(move |conn| {
            let count: Option<i64> = conn
                .query_row(
                    "SELECT count FROM credential_usage WHERE credential_id = ?1 AND bucket = ?2",
                    params![id, bucket],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(to_count(count.unwrap_or(0)))
        })
    }

    fn get_many<'a>(
        &'a self,
        credential_ids: &'a [String],
        bucket: &'a Bucket,
    ) -> StoreFuture<'a, HashMap<String, u64>> {
        let ids = credential_ids.to_vec();
        let bucket = bucket.as_str().to_string();
        self.run(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT credential_id, count FROM credential_usage WHERE bucket = ?1",
            )?;
            let rows = stmt.query_map(params![bucket], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            let mut found = HashMap::new();
            for row in rows {
                let (id, count) = row?;
                found.insert(id, to_count(count));
            }
            Ok(ids
                .into_iter()
                .map(|id| {
                    let count = found.get(&id).copied().unwrap_or(0);
                    (id, count)
                })
                .collect())
        })
    }

    fn reset<'a>(&'a self, bucket: &'a Bucket) -> StoreFuture<'a, u64> {
        let bucket = bucket.as_str().to_string();
        self.run(move |conn| {
            let removed = conn.execute(
                "DELETE FROM credential_usage WHERE bucket = ?1",
                params![bucket],
            )?;
            Ok(removed as u64)
        })
    }

    fn prune<'a>(&'a self, keep_from: &'a Bucket) -> StoreFuture<'a, u64> {
        let keep_from = keep_from.as_str().to_string();
        self.run(move |conn| {
            let removed = conn.execute(
                "DELETE FROM credential_usage WHERE bucket < ?1",
                params![keep_from],
            )?;
            Ok(removed as u64)
        })
    }

    fn advance_cursor<'a>(&'a self, scope: &'a str) -> StoreFuture<'a, u64> {
        let scope = scope.to_string();
        self.run(move |conn| {
            let next: i64 = conn.query_row(
                "INSERT INTO rotation_cursor (scope, value) VALUES (?1, 1)
                 ON CONFLICT (scope) DO UPDATE SET value = value + 1
                 RETURNING value",
                params![scope],
                |row| row.get(0),
            )?;
            Ok(to_count(next - 1))
        })
    }

    fn cursor<'a>(&'a self, scope: &'a str) -> StoreFuture<'a, u64> {
        let scope = scope.to_string();
        self.run(move |conn| {
            let value: Option<i64> = conn
                .query_row(
                    "SELECT value FROM rotation_cursor WHERE scope = ?1",
                    params![scope],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(to_count(value.unwrap_or(0)))
        })
    }

    fn backend(&self) -> &'static str {
        "sqlite"
    }
}
