//! In-process usage store

use std::collections::HashMap;
use std::sync::Mutex;

use super::{Bucket, StoreFuture, UsageStore};
use crate::error::{Error, Result};

/// Mutex-guarded counter map. Correct within one process only.
#[derive(Default)]
pub struct MemoryUsageStore {
    counts: Mutex<HashMap<(String, Bucket), u64>>,
    cursors: Mutex<HashMap<String, u64>>,
}

impl MemoryUsageStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_counts<T>(&self, f: impl FnOnce(&mut HashMap<(String, Bucket), u64>) -> T) -> Result<T> {
        let mut counts = self
            .counts
            .lock()
            .map_err(|_| Error::Store("usage map lock poisoned".into()))?;
        Ok(f(&mut counts))
    }

    fn with_cursors<T>(&self, f: impl FnOnce(&mut HashMap<String, u64>) -> T) -> Result<T> {
        let mut cursors = self
            .cursors
            .lock()
            .map_err(|_| Error::Store("cursor map lock poisoned".into()))?;
        Ok(f(&mut cursors))
    }
}

impl UsageStore for MemoryUsageStore {
    fn increment<'a>(&'a self, credential_id: &'a str, bucket: &'a Bucket) -> StoreFuture<'a, u64> {
        let result = self.with_counts(|counts| {
            let count = counts
                .entry((credential_id.to_string(), bucket.clone()))
                .or_insert(0);
            *count += 1;
            *count
        });
        Box::pin(async move { result })
    }

    fn get<'a>(&'a self, credential_id: &'a str, bucket: &'a Bucket) -> StoreFuture<'a, u64> {
        let result = self.with_counts(|counts| {
            counts
                .get(&(credential_id.to_string(), bucket.clone()))
                .copied()
                .unwrap_or(0)
        });
        Box::pin(async move { result })
    }

    fn get_many<'a>(
        &'a self,
        credential_ids: &'a [String],
        bucket: &'a Bucket,
    ) -> StoreFuture<'a, HashMap<String, u64>> {
        let result = self.with_counts(|counts| {
            credential_ids
                .iter()
                .map(|id| {
                    let count = counts
                        .get(&(id.clone(), bucket.clone()))
                        .copied()
                        .unwrap_or(0);
                    (id.clone(), count)
                })
                .collect()
        });
        Box::pin(async move { result })
    }

    fn reset<'a>(&'a self, bucket: &'a Bucket) -> StoreFuture<'a, u64> {
        let result = self.with_counts(|counts| {
            let before = counts.len();
            counts.retain(|(_, b), _| b != bucket);
            (before - counts.len()) as u64
        });
        Box::pin(async move { result })
    }

    fn prune<'a>(&'a self, keep_from: &'a Bucket) -> StoreFuture<'a, u64> {
        let result = self.with_counts(|counts| {
            let before = counts.len();
            counts.retain(|(_, b), _| b >= keep_from);
            (before - counts.len()) as u64
        });
        Box::pin(async move { result })
    }

    fn advance_cursor<'a>(&'a self, scope: &'a str) -> StoreFuture<'a, u64> {
        let result = self.with_cursors(|cursors| {
            let cursor = cursors.entry(scope.to_string()).or_insert(0);
            let current = *cursor;
            *cursor = cursor.wrapping_add(1);
            current
        });
        Box::pin(async move { result })
    }

    fn cursor<'a>(&'a self, scope: &'a str) -> StoreFuture<'a, u64> {
        let result = self.with_cursors(|cursors| cursors.get(scope).copied().unwrap_or(0));
        Box::pin(async move { result })
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}
