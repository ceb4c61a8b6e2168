use std::{
    net::IpAddr,
    sync::Arc,
};

use axum::{
    body::{Body, to_bytes},
    http::{HeaderMap, Request, StatusCode},
    response::{IntoResponse, Response},
};
use uuid::Uuid;

use crate::{
    config::{ConfigStoreConfig, GatewayConfig},
    context::RequestContext,
    error::{GatewayError, GatewayResult},
    forward::Forwarder,
    ratelimit::{
        RateLimiter,
        registry::BucketRegistry,
        service::ReconciliationService,
    },
    store::{
        ClientConfig,
        ConfigStore,
        memory::InMemoryConfigStore,
        redis_backend::RedisConfigStore,
    },
};

/// Delivery façade: owns the admission core and the forwarder, and exposes
/// the operations the HTTP layer calls.
pub struct Gateway {
    limiter: RateLimiter,
    service: ReconciliationService,
    registry: Arc<BucketRegistry>,
    forwarder: Forwarder,
    client_key_header: String,
    max_body_bytes: usize,
}

impl Gateway {
    pub async fn from_config(config: GatewayConfig) -> GatewayResult<Self> {
        let store: Arc<dyn ConfigStore> = match &config.store {
            ConfigStoreConfig::InMemory => Arc::new(InMemoryConfigStore::new()),
            ConfigStoreConfig::Redis { url, key_prefix } => {
                Arc::new(RedisConfigStore::new(url.clone(), key_prefix.clone()).await?)
            }
        };

        let registry = Arc::new(BucketRegistry::new());
        let service =
            ReconciliationService::bootstrap(store, registry.clone(), config.store_timeout)
                .await?;
        let limiter = RateLimiter::new(registry.clone(), config.default_bucket);
        let forwarder = Forwarder::new(config.target_url, config.upstream_timeout)?;

        Ok(Self {
            limiter,
            service,
            registry,
            forwarder,
            client_key_header: config.client_key_header,
            max_body_bytes: config.max_body_bytes,
        })
    }

    /// Gates one inbound request: resolve the client key, consult the
    /// limiter, forward on admission, 429 on rejection.
    pub async fn handle_http(
        &self,
        request: Request<Body>,
        client_ip: Option<IpAddr>,
    ) -> Response<Body> {
        let (parts, body) = request.into_parts();

        let request_id = parts
            .headers
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let client_key = resolve_client_key(&parts.headers, &self.client_key_header, client_ip);

        // admission is decided before the body is read; a rejected request
        // must not cost its buffering
        if !self.limiter.allow(&client_key).await {
            tracing::warn!(
                request_id = %request_id,
                client = %client_key,
                path = %parts.uri.path(),
                "rate limit exceeded"
            );
            return GatewayError::RateLimited.into_response();
        }

        let body = match to_bytes(body, self.max_body_bytes.saturating_add(1)).await {
            Ok(body) => body,
            Err(_) => {
                return (StatusCode::PAYLOAD_TOO_LARGE, "request body too large").into_response();
            }
        };

        let ctx = RequestContext::new(
            request_id,
            parts.method,
            parts.uri,
            parts.headers,
            body,
            client_ip,
        );

        tracing::debug!(
            request_id = %ctx.request_id,
            client = %client_key,
            path = %ctx.uri.path(),
            "proxying admitted request"
        );

        match self.forwarder.forward(&ctx).await {
            Ok(response) => {
                tracing::debug!(
                    request_id = %ctx.request_id,
                    status = %response.status(),
                    latency_ms = ctx.started_at.elapsed().as_millis() as u64,
                    "upstream responded"
                );
                response
            }
            Err(err) => {
                tracing::warn!(
                    request_id = %ctx.request_id,
                    error = %err,
                    "upstream call failed"
                );
                err.into_response()
            }
        }
    }

    /// Administrative path: validate, persist, reconcile.
    pub async fn update_client_config(&self, config: ClientConfig) -> GatewayResult<()> {
        config.validate()?;
        self.service.create_or_update_config(config).await
    }

    /// Live-bucket existence probe; never provisions.
    pub fn client_exists(&self, key: &str) -> bool {
        self.limiter.is_exists(key)
    }

    /// Stops every bucket's refill task. Must run during graceful shutdown
    /// so no background work outlives the process.
    pub fn shutdown(&self) {
        self.registry.stop_all();
    }
}

/// Client identity: configured header first, then the peer address, then a
/// shared anonymous key.
fn resolve_client_key(headers: &HeaderMap, key_header: &str, client_ip: Option<IpAddr>) -> String {
    if let Some(key) = headers
        .get(key_header)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
    {
        return key.to_string();
    }

    if let Some(ip) = client_ip {
        return ip.to_string();
    }

    "anonymous".to_string()
}
