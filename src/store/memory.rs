use async_trait::async_trait;
use dashmap::DashMap;

use crate::{
    error::{GatewayError, GatewayResult},
    store::{ClientConfig, ConfigStore},
};

/// Process-local config store. Default backend when no durable store is
/// configured, and the test double for the reconciliation service.
#[derive(Default)]
pub struct InMemoryConfigStore {
    configs: DashMap<String, ClientConfig>,
}

impl InMemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConfigStore for InMemoryConfigStore {
    async fn create_or_update(&self, config: &ClientConfig) -> GatewayResult<ClientConfig> {
        self.configs.insert(config.key.clone(), config.clone());
        Ok(config.clone())
    }

    async fn get_by_key(&self, key: &str) -> GatewayResult<ClientConfig> {
        self.configs
            .get(key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| GatewayError::ConfigNotFound(key.to_string()))
    }

    async fn get_all(&self) -> GatewayResult<Vec<ClientConfig>> {
        Ok(self
            .configs
            .iter()
            .map(|entry| entry.value().clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(key: &str, capacity: u32, rate_per_sec: f64) -> ClientConfig {
        ClientConfig {
            key: key.to_string(),
            capacity,
            rate_per_sec,
        }
    }

    #[tokio::test]
    async fn upsert_overwrites_existing_row() {
        let store = InMemoryConfigStore::new();

        store.create_or_update(&config("a", 5, 2.0)).await.unwrap();
        store.create_or_update(&config("a", 9, 4.0)).await.unwrap();

        let loaded = store.get_by_key("a").await.unwrap();
        assert_eq!(loaded, config("a", 9, 4.0));
    }

    #[tokio::test]
    async fn lookup_of_unknown_key_is_an_error() {
        let store = InMemoryConfigStore::new();
        let err = store.get_by_key("missing").await.unwrap_err();
        assert!(matches!(err, GatewayError::ConfigNotFound(_)));
    }

    #[tokio::test]
    async fn get_all_returns_every_row() {
        let store = InMemoryConfigStore::new();
        store.create_or_update(&config("a", 5, 2.0)).await.unwrap();
        store.create_or_update(&config("b", 7, 1.0)).await.unwrap();

        let mut all = store.get_all().await.unwrap();
        all.sort_by(|x, y| x.key.cmp(&y.key));
        assert_eq!(all, vec![config("a", 5, 2.0), config("b", 7, 1.0)]);
    }
}
