use std::{
    sync::Arc,
    time::Duration,
};

use tokio::time::timeout;

use crate::{
    error::GatewayResult,
    ratelimit::{bucket::TokenBucket, registry::BucketRegistry},
    store::{ClientConfig, ConfigStore},
};

/// Keeps the bucket registry consistent with the durable config store.
///
/// Every store call is bounded by `store_timeout`; a timeout surfaces as an
/// ordinary error and no retries happen here. The ordering discipline is
/// strict: durable write first, live-state reconciliation only after the
/// write succeeded.
pub struct ReconciliationService {
    store: Arc<dyn ConfigStore>,
    registry: Arc<BucketRegistry>,
    store_timeout: Duration,
}

impl ReconciliationService {
    /// Loads every persisted config and reconciles it into the registry.
    /// Fails fast: a service that cannot read its starting configuration
    /// must not come up.
    pub async fn bootstrap(
        store: Arc<dyn ConfigStore>,
        registry: Arc<BucketRegistry>,
        store_timeout: Duration,
    ) -> GatewayResult<Self> {
        let service = Self {
            store,
            registry,
            store_timeout,
        };

        let configs = timeout(service.store_timeout, service.store.get_all()).await??;
        for config in &configs {
            service.reconcile(config).await;
        }
        tracing::info!(clients = configs.len(), "loaded persisted client configs");

        Ok(service)
    }

    /// Persists `config`, then reconciles the live bucket. On store failure
    /// or timeout the registry is left untouched so enforcement never
    /// diverges from what is actually persisted.
    pub async fn create_or_update_config(&self, config: ClientConfig) -> GatewayResult<()> {
        let stored = timeout(self.store_timeout, self.store.create_or_update(&config))
            .await
            .map_err(|err| {
                tracing::warn!(client = %config.key, "config store write timed out");
                err
            })?
            .map_err(|err| {
                tracing::warn!(client = %config.key, error = %err, "config store write failed");
                err
            })?;

        self.reconcile(&stored).await;
        tracing::info!(
            client = %stored.key,
            capacity = stored.capacity,
            rate_per_sec = stored.rate_per_sec,
            "client config updated"
        );
        Ok(())
    }

    /// Create-or-update rule shared by bootstrap and runtime updates. A
    /// bucket that already exists (for instance from a request that raced
    /// ahead of bootstrap) is settled via `update_config`, never blindly
    /// overwritten.
    async fn reconcile(&self, config: &ClientConfig) {
        let (bucket, created) = self.registry.get_or_insert_with(&config.key, || {
            TokenBucket::new(config.capacity, config.rate_per_sec)
        });

        if !created {
            bucket.update_config(config.capacity, config.rate_per_sec).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crate::{
        error::{GatewayError, GatewayResult},
        store::memory::InMemoryConfigStore,
    };

    struct FailingStore;

    #[async_trait]
    impl ConfigStore for FailingStore {
        async fn create_or_update(&self, _config: &ClientConfig) -> GatewayResult<ClientConfig> {
            Err(GatewayError::Store("connection refused".to_string()))
        }

        async fn get_by_key(&self, key: &str) -> GatewayResult<ClientConfig> {
            Err(GatewayError::ConfigNotFound(key.to_string()))
        }

        async fn get_all(&self) -> GatewayResult<Vec<ClientConfig>> {
            Err(GatewayError::Store("connection refused".to_string()))
        }
    }

    struct HangingStore;

    #[async_trait]
    impl ConfigStore for HangingStore {
        async fn create_or_update(&self, _config: &ClientConfig) -> GatewayResult<ClientConfig> {
            std::future::pending().await
        }

        async fn get_by_key(&self, _key: &str) -> GatewayResult<ClientConfig> {
            std::future::pending().await
        }

        async fn get_all(&self) -> GatewayResult<Vec<ClientConfig>> {
            std::future::pending().await
        }
    }

    fn config(key: &str, capacity: u32, rate_per_sec: f64) -> ClientConfig {
        ClientConfig {
            key: key.to_string(),
            capacity,
            rate_per_sec,
        }
    }

    const TIMEOUT: Duration = Duration::from_millis(500);

    #[tokio::test(start_paused = true)]
    async fn bootstrap_provisions_buckets_from_persisted_configs() {
        let store = Arc::new(InMemoryConfigStore::new());
        store
            .create_or_update(&config("10.0.0.1", 5, 2.0))
            .await
            .unwrap();

        let registry = Arc::new(BucketRegistry::new());
        ReconciliationService::bootstrap(store, registry.clone(), TIMEOUT)
            .await
            .unwrap();

        let bucket = registry.load("10.0.0.1").expect("bucket from bootstrap");
        for _ in 0..5 {
            assert!(bucket.allow().await);
        }
        assert!(!bucket.allow().await);
    }

    #[tokio::test(start_paused = true)]
    async fn bootstrap_settles_a_bucket_that_raced_ahead() {
        let store = Arc::new(InMemoryConfigStore::new());
        store
            .create_or_update(&config("early-bird", 3, 1.0))
            .await
            .unwrap();

        // a request provisioned a default bucket before bootstrap ran
        let registry = Arc::new(BucketRegistry::new());
        let (default_bucket, created) =
            registry.get_or_insert_with("early-bird", || TokenBucket::new(10, 1.0));
        assert!(created);
        for _ in 0..4 {
            assert!(default_bucket.allow().await);
        }

        ReconciliationService::bootstrap(store, registry.clone(), TIMEOUT)
            .await
            .unwrap();

        let bucket = registry.load("early-bird").unwrap();
        assert!(
            Arc::ptr_eq(&bucket, &default_bucket),
            "reconciliation must not replace the live bucket"
        );
        // 6 tokens remained; the new capacity of 3 clamps them down
        assert_eq!(bucket.available().await, 3.0);
    }

    #[tokio::test(start_paused = true)]
    async fn bootstrap_fails_when_the_store_is_unreadable() {
        let result = ReconciliationService::bootstrap(
            Arc::new(FailingStore),
            Arc::new(BucketRegistry::new()),
            TIMEOUT,
        )
        .await;

        assert!(matches!(result, Err(GatewayError::Store(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn bootstrap_fails_when_the_store_hangs() {
        let result = ReconciliationService::bootstrap(
            Arc::new(HangingStore),
            Arc::new(BucketRegistry::new()),
            TIMEOUT,
        )
        .await;

        assert!(matches!(result, Err(GatewayError::StoreTimeout)));
    }

    #[tokio::test(start_paused = true)]
    async fn update_persists_before_reconciling() {
        let store = Arc::new(InMemoryConfigStore::new());
        let registry = Arc::new(BucketRegistry::new());
        let service =
            ReconciliationService::bootstrap(store.clone(), registry.clone(), TIMEOUT)
                .await
                .unwrap();

        service
            .create_or_update_config(config("10.0.0.2", 4, 1.5))
            .await
            .unwrap();

        assert_eq!(
            store.get_by_key("10.0.0.2").await.unwrap(),
            config("10.0.0.2", 4, 1.5)
        );
        let bucket = registry.load("10.0.0.2").expect("bucket created on update");
        for _ in 0..4 {
            assert!(bucket.allow().await);
        }
        assert!(!bucket.allow().await);
    }

    #[tokio::test(start_paused = true)]
    async fn update_reconfigures_an_existing_bucket_with_settlement() {
        let store = Arc::new(InMemoryConfigStore::new());
        let registry = Arc::new(BucketRegistry::new());
        let service =
            ReconciliationService::bootstrap(store, registry.clone(), TIMEOUT)
                .await
                .unwrap();

        let (bucket, _) = registry.get_or_insert_with("c", || TokenBucket::new(10, 1.0));
        for _ in 0..8 {
            assert!(bucket.allow().await);
        }

        tokio::time::advance(Duration::from_secs(3)).await;

        service
            .create_or_update_config(config("c", 20, 2.0))
            .await
            .unwrap();

        // 2 remaining + 3s at the old 1/s rate, then the new quota applies
        let available = bucket.available().await;
        assert!(
            (available - 5.0).abs() < 0.01,
            "available = {available}, expected ~5"
        );
        assert_eq!(bucket.capacity().await, 20);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_write_leaves_live_state_untouched() {
        let registry = Arc::new(BucketRegistry::new());
        let (bucket, _) = registry.get_or_insert_with("d", || TokenBucket::new(5, 1.0));
        for _ in 0..2 {
            assert!(bucket.allow().await);
        }

        let service = ReconciliationService {
            store: Arc::new(FailingStore),
            registry: registry.clone(),
            store_timeout: TIMEOUT,
        };

        let result = service.create_or_update_config(config("d", 100, 50.0)).await;
        assert!(matches!(result, Err(GatewayError::Store(_))));

        // pre-update state, never the rejected configuration
        assert_eq!(bucket.available().await, 3.0);
        assert_eq!(bucket.capacity().await, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_write_leaves_live_state_untouched() {
        let registry = Arc::new(BucketRegistry::new());
        let service = ReconciliationService {
            store: Arc::new(HangingStore),
            registry: registry.clone(),
            store_timeout: TIMEOUT,
        };

        let result = service.create_or_update_config(config("e", 9, 9.0)).await;
        assert!(matches!(result, Err(GatewayError::StoreTimeout)));
        assert!(registry.load("e").is_none());
    }
}
