use std::time::Duration;

use axum::{
    body::Body,
    response::Response,
};
use http::{
    HeaderMap,
    HeaderValue,
    header::HeaderName,
};

use crate::{
    context::RequestContext,
    error::{GatewayError, GatewayResult},
};

/// Forwards admitted requests to the single configured target service.
pub struct Forwarder {
    client: reqwest::Client,
    target_url: String,
    timeout: Duration,
}

impl Forwarder {
    pub fn new(target_url: String, timeout: Duration) -> GatewayResult<Self> {
        let client = reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(32)
            .tcp_nodelay(true)
            .build()
            .map_err(|e| GatewayError::Internal(e.to_string()))?;

        Ok(Self {
            client,
            target_url,
            timeout,
        })
    }

    pub async fn forward(&self, ctx: &RequestContext) -> GatewayResult<Response<Body>> {
        let path_and_query = ctx
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or(ctx.uri.path());
        let target = format!("{}{}", self.target_url, path_and_query);

        let request = self
            .client
            .request(ctx.method.clone(), &target)
            .headers(forward_headers(ctx))
            .body(ctx.body.clone());

        let upstream_response = request.timeout(self.timeout).send().await?;

        let status = upstream_response.status();
        let headers = upstream_response.headers().clone();
        let body = upstream_response.bytes().await?;

        let mut builder = Response::builder().status(status);
        for (name, value) in &headers {
            if should_forward_header(name) {
                builder = builder.header(name, value);
            }
        }

        builder
            .body(Body::from(body))
            .map_err(|e| GatewayError::Internal(e.to_string()))
    }
}

/// Outgoing header set: pass-through headers minus hop-by-hop ones, with
/// exactly one `x-request-id` (the resolved id, never a second copy of the
/// client's) and the peer address as `x-forwarded-for`.
fn forward_headers(ctx: &RequestContext) -> HeaderMap {
    let mut headers = HeaderMap::new();

    for (name, value) in &ctx.headers {
        if name.as_str() == "x-request-id" {
            continue;
        }
        if should_forward_header(name) {
            headers.append(name, value.clone());
        }
    }

    if let Ok(value) = HeaderValue::from_str(&ctx.request_id) {
        headers.insert("x-request-id", value);
    }
    if let Some(client_ip) = ctx.client_ip
        && let Ok(value) = HeaderValue::from_str(&client_ip.to_string())
    {
        headers.insert("x-forwarded-for", value);
    }

    headers
}

fn should_forward_header(name: &HeaderName) -> bool {
    let lowercase = name.as_str().to_ascii_lowercase();
    !matches!(
        lowercase.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
            | "host"
            | "content-length"
    )
}
