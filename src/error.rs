use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

pub type GatewayResult<T> = Result<T, GatewayError>;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid client config: {0}")]
    Validation(String),
    #[error("no configuration stored for client: {0}")]
    ConfigNotFound(String),
    #[error("rate limit exceeded")]
    RateLimited,
    #[error("config store error: {0}")]
    Store(String),
    #[error("config store call timed out")]
    StoreTimeout,
    #[error("upstream error: {0}")]
    Upstream(String),
    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = match self {
            GatewayError::Validation(_) => StatusCode::BAD_REQUEST,
            GatewayError::ConfigNotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::Store(_) | GatewayError::StoreTimeout => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            GatewayError::Upstream(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(ErrorBody {
            error: self.to_string(),
        });
        (status, body).into_response()
    }
}

impl From<anyhow::Error> for GatewayError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<redis::RedisError> for GatewayError {
    fn from(err: redis::RedisError) -> Self {
        Self::Store(err.to_string())
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        Self::Upstream(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for GatewayError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::StoreTimeout
    }
}
