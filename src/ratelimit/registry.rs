use std::sync::Arc;

use dashmap::{DashMap, mapref::entry::Entry};

use crate::ratelimit::bucket::TokenBucket;

/// Concurrency-safe mapping from client key to its live bucket.
///
/// Entries are created lazily and never removed during normal operation;
/// `stop_all` tears everything down at shutdown. The map is owned by the
/// reconciliation service and shared by reference with the limiter, never
/// a process-wide global.
#[derive(Default)]
pub struct BucketRegistry {
    buckets: DashMap<String, Arc<TokenBucket>>,
}

impl BucketRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(&self, key: &str) -> Option<Arc<TokenBucket>> {
        self.buckets.get(key).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.buckets.contains_key(key)
    }

    /// Atomic create-if-absent. Returns the bucket plus whether this call
    /// created it, so at most one live bucket ever exists per key even
    /// under simultaneous first requests. The shard lock is held only for
    /// the insert itself.
    pub fn get_or_insert_with(
        &self,
        key: &str,
        create: impl FnOnce() -> TokenBucket,
    ) -> (Arc<TokenBucket>, bool) {
        match self.buckets.entry(key.to_string()) {
            Entry::Occupied(entry) => (entry.get().clone(), false),
            Entry::Vacant(entry) => {
                let bucket = Arc::new(create());
                entry.insert(bucket.clone());
                (bucket, true)
            }
        }
    }

    /// Stops every registered bucket's refill task. Shutdown only.
    pub fn stop_all(&self) {
        for entry in self.buckets.iter() {
            entry.value().stop();
        }
        tracing::debug!(buckets = self.buckets.len(), "stopped all bucket refill tasks");
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.buckets.len()
    }
}
