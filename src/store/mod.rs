pub mod memory;
pub mod redis_backend;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, GatewayResult};

/// A client's durable quota configuration, one row per key.
///
/// Only the configuration is durable; live token counts are not persisted
/// and reset to full capacity on restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    pub key: String,
    pub capacity: u32,
    pub rate_per_sec: f64,
}

impl ClientConfig {
    /// Boundary validation; the core assumes positive values past this
    /// point.
    pub fn validate(&self) -> GatewayResult<()> {
        if self.key.trim().is_empty() {
            return Err(GatewayError::Validation("key must be non-empty".to_string()));
        }
        if self.capacity == 0 {
            return Err(GatewayError::Validation("capacity must be > 0".to_string()));
        }
        if !(self.rate_per_sec > 0.0) {
            return Err(GatewayError::Validation(
                "rate_per_sec must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Durable configuration store consumed by the reconciliation service.
/// Lookups for unknown keys are errors; no default substitution happens at
/// this boundary.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Upsert by unique key.
    async fn create_or_update(&self, config: &ClientConfig) -> GatewayResult<ClientConfig>;

    async fn get_by_key(&self, key: &str) -> GatewayResult<ClientConfig>;

    /// Full scan; used only at bootstrap.
    async fn get_all(&self) -> GatewayResult<Vec<ClientConfig>>;
}
