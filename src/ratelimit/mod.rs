pub mod bucket;
pub mod registry;
pub mod service;

use std::sync::Arc;

use crate::{
    config::BucketDefaults,
    ratelimit::{bucket::TokenBucket, registry::BucketRegistry},
};

/// Admission façade consulted once per inbound request.
///
/// Unknown keys are auto-provisioned with the service-wide defaults; that
/// provisioning is purely in-memory and never touches the config store.
#[derive(Clone)]
pub struct RateLimiter {
    registry: Arc<BucketRegistry>,
    defaults: BucketDefaults,
}

impl RateLimiter {
    pub fn new(registry: Arc<BucketRegistry>, defaults: BucketDefaults) -> Self {
        Self { registry, defaults }
    }

    /// Decides admission for `key`. Never fails; a previously unseen key
    /// gets a default bucket before the check.
    pub async fn allow(&self, key: &str) -> bool {
        let (bucket, created) = self
            .registry
            .get_or_insert_with(key, || {
                TokenBucket::new(self.defaults.capacity, self.defaults.rate_per_sec)
            });

        if created {
            tracing::debug!(
                client = key,
                capacity = self.defaults.capacity,
                rate_per_sec = self.defaults.rate_per_sec,
                "provisioned default bucket for unseen client"
            );
        }

        bucket.allow().await
    }

    /// Pure existence probe; never provisions.
    pub fn is_exists(&self, key: &str) -> bool {
        self.registry.contains(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn limiter(capacity: u32, rate_per_sec: f64) -> RateLimiter {
        RateLimiter::new(
            Arc::new(BucketRegistry::new()),
            BucketDefaults {
                capacity,
                rate_per_sec,
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn auto_provisions_unseen_keys_with_defaults() {
        let limiter = limiter(3, 1.0);

        assert!(!limiter.is_exists("new-client"));
        assert!(limiter.allow("new-client").await);
        assert!(limiter.is_exists("new-client"));
    }

    #[tokio::test(start_paused = true)]
    async fn is_exists_never_provisions() {
        let limiter = limiter(3, 1.0);

        assert!(!limiter.is_exists("probe-only"));
        assert!(!limiter.is_exists("probe-only"));
        assert_eq!(limiter.registry.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn keys_are_limited_independently() {
        let limiter = limiter(1, 1.0);

        assert!(limiter.allow("a").await);
        assert!(!limiter.allow("a").await);
        assert!(limiter.allow("b").await);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_bucket_recovers_after_a_second() {
        let limiter = limiter(10, 1.0);

        for _ in 0..10 {
            assert!(limiter.allow("new-client").await);
        }
        assert!(!limiter.allow("new-client").await);

        tokio::time::advance(Duration::from_millis(1_050)).await;
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }

        assert!(limiter.allow("new-client").await);
        assert!(!limiter.allow("new-client").await);
    }
}
