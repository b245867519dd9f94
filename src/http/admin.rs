//! Operator endpoints, served on their own listener so they never collide
//! with proxied paths.
//!
//! - `GET /healthz` - local cache health
//! - `GET /metrics` - Prometheus metrics

use std::sync::Arc;

use axum::{
    Router,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};

use super::handler::AppError;
use crate::AppState;
use crate::cache::CacheStore;

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(crate::health::health_handler))
        .route("/metrics", get(handle_metrics))
        .with_state(state)
}

/// `GET /metrics`
async fn handle_metrics(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    if let Some(store) = &state.store {
        state
            .metrics
            .metrics
            .cache_size_bytes
            .set(i64::try_from(store.size_bytes()).unwrap_or(i64::MAX));
    }

    let buf = state
        .metrics
        .encode()
        .map_err(|e| AppError::Internal(anyhow::anyhow!("metrics encoding failed: {e}")))?;

    Ok((
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        buf,
    )
        .into_response())
}
