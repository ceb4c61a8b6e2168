use std::collections::HashMap;

use async_trait::async_trait;
use redis::{AsyncCommands, aio::ConnectionManager};

use crate::{
    error::{GatewayError, GatewayResult},
    store::{ClientConfig, ConfigStore},
};

/// Durable config store backed by a single Redis hash: field = client key,
/// value = JSON-encoded config. Survives process restarts, which is all the
/// durability the gateway needs from this boundary.
pub struct RedisConfigStore {
    manager: ConnectionManager,
    hash_key: String,
}

impl RedisConfigStore {
    pub async fn new(url: String, key_prefix: String) -> GatewayResult<Self> {
        let client = redis::Client::open(url)?;
        let manager = client.get_connection_manager().await?;
        Ok(Self {
            manager,
            hash_key: key_prefix,
        })
    }

    fn decode(raw: &str) -> GatewayResult<ClientConfig> {
        serde_json::from_str(raw)
            .map_err(|e| GatewayError::Store(format!("corrupt client config row: {e}")))
    }
}

#[async_trait]
impl ConfigStore for RedisConfigStore {
    async fn create_or_update(&self, config: &ClientConfig) -> GatewayResult<ClientConfig> {
        let mut conn = self.manager.clone();
        let value = serde_json::to_string(config)
            .map_err(|e| GatewayError::Store(format!("failed to encode client config: {e}")))?;
        let _: () = conn.hset(&self.hash_key, &config.key, value).await?;
        Ok(config.clone())
    }

    async fn get_by_key(&self, key: &str) -> GatewayResult<ClientConfig> {
        let mut conn = self.manager.clone();
        let raw: Option<String> = conn.hget(&self.hash_key, key).await?;
        match raw {
            Some(raw) => Self::decode(&raw),
            None => Err(GatewayError::ConfigNotFound(key.to_string())),
        }
    }

    async fn get_all(&self) -> GatewayResult<Vec<ClientConfig>> {
        let mut conn = self.manager.clone();
        let rows: HashMap<String, String> = conn.hgetall(&self.hash_key).await?;
        rows.values().map(|raw| Self::decode(raw)).collect()
    }
}
