use anyhow::{Context, Result, anyhow};
use std::{
    env,
    net::SocketAddr,
    time::Duration,
};

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_addr: SocketAddr,
    pub target_url: String,
    pub client_key_header: String,
    pub max_body_bytes: usize,
    pub upstream_timeout: Duration,
    pub default_bucket: BucketDefaults,
    pub store: ConfigStoreConfig,
    pub store_timeout: Duration,
}

/// Quota handed to clients that were never explicitly configured.
#[derive(Debug, Clone, Copy)]
pub struct BucketDefaults {
    pub capacity: u32,
    pub rate_per_sec: f64,
}

#[derive(Debug, Clone)]
pub enum ConfigStoreConfig {
    InMemory,
    Redis { url: String, key_prefix: String },
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self> {
        let bind_addr = env::var("BIND_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
            .parse::<SocketAddr>()
            .context("invalid BIND_ADDR")?;

        let target_url = env::var("TARGET_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:9000".to_string())
            .trim_end_matches('/')
            .to_string();
        target_url
            .parse::<http::Uri>()
            .context("invalid TARGET_URL")?;

        let default_bucket = BucketDefaults {
            capacity: parse_env("DEFAULT_BUCKET_CAPACITY", 100u32),
            rate_per_sec: parse_env("DEFAULT_REFILL_RATE", 10.0f64),
        };
        if default_bucket.capacity == 0 {
            return Err(anyhow!("DEFAULT_BUCKET_CAPACITY must be > 0"));
        }
        if default_bucket.rate_per_sec <= 0.0 {
            return Err(anyhow!("DEFAULT_REFILL_RATE must be > 0"));
        }

        let store = match env::var("CONFIG_STORE")
            .unwrap_or_else(|_| "memory".to_string())
            .to_ascii_lowercase()
            .as_str()
        {
            "memory" | "in_memory" => ConfigStoreConfig::InMemory,
            "redis" => {
                let url = env::var("REDIS_URL")
                    .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
                let key_prefix = env::var("REDIS_KEY_PREFIX")
                    .unwrap_or_else(|_| "rategate:clients".to_string());
                ConfigStoreConfig::Redis { url, key_prefix }
            }
            other => return Err(anyhow!("unsupported CONFIG_STORE: {other}")),
        };

        Ok(Self {
            bind_addr,
            target_url,
            client_key_header: env::var("CLIENT_KEY_HEADER")
                .unwrap_or_else(|_| "x-client-id".to_string()),
            max_body_bytes: parse_env("MAX_BODY_BYTES", 1_048_576usize),
            upstream_timeout: Duration::from_millis(
                parse_env("UPSTREAM_TIMEOUT_MS", 3_000u64).max(100),
            ),
            default_bucket,
            store,
            store_timeout: Duration::from_millis(parse_env("STORE_TIMEOUT_MS", 2_000u64).max(1)),
        })
    }
}

fn parse_env<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr,
{
    env::var(key)
        .ok()
        .and_then(|s| s.parse::<T>().ok())
        .unwrap_or(default)
}
