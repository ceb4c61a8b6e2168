mod config;
mod context;
mod error;
mod forward;
mod gateway;
mod ratelimit;
mod store;

use std::{
    net::SocketAddr,
    sync::Arc,
};

use anyhow::Context;
use axum::{
    Json,
    Router,
    body::Body,
    extract::{
        ConnectInfo,
        Path,
        State,
    },
    http::Request,
    response::IntoResponse,
    routing::{any, get, post},
};
use gateway::Gateway;
use serde_json::json;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use crate::{
    config::GatewayConfig,
    error::GatewayError,
    store::ClientConfig,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cfg = GatewayConfig::from_env().context("failed to build gateway config")?;
    let bind_addr = cfg.bind_addr;

    let gateway = Arc::new(
        Gateway::from_config(cfg)
            .await
            .context("failed to initialize gateway")?,
    );

    let app = Router::new()
        .route("/config", post(update_config_handler))
        .route("/config/{key}", get(probe_config_handler))
        .fallback(any(proxy_handler))
        .with_state(gateway.clone());

    let listener = TcpListener::bind(bind_addr)
        .await
        .context("failed to bind listener")?;

    tracing::info!(addr = %bind_addr, "admission gateway listening");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("gateway server error")?;

    gateway.shutdown();
    tracing::info!("gateway stopped");

    Ok(())
}

async fn proxy_handler(
    State(gateway): State<Arc<Gateway>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> axum::response::Response {
    gateway.handle_http(request, Some(addr.ip())).await
}

async fn update_config_handler(
    State(gateway): State<Arc<Gateway>>,
    Json(config): Json<ClientConfig>,
) -> Result<impl IntoResponse, GatewayError> {
    let key = config.key.clone();
    gateway.update_client_config(config).await?;
    Ok(Json(json!({
        "status": "configuration updated",
        "key": key,
    })))
}

async fn probe_config_handler(
    State(gateway): State<Arc<Gateway>>,
    Path(key): Path<String>,
) -> impl IntoResponse {
    Json(json!({
        "key": key,
        "exists": gateway.client_exists(&key),
    }))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    tracing::info!("shutdown signal received");
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,hyper=warn,reqwest=warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
