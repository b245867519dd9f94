use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Serialize;

use crate::AppState;
use crate::cache::{CacheStore, DiskStore};

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub checks: HealthChecks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    pub local_cache: CheckResult,
}

#[derive(Debug, Serialize)]
pub struct CheckResult {
    pub ok: bool,
    /// Set when the check passed but the component runs with reduced
    /// capability.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub degraded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CheckResult {
    fn healthy(detail: impl Into<String>) -> Self {
        Self {
            ok: true,
            degraded: false,
            detail: Some(detail.into()),
        }
    }

    fn degraded(detail: impl Into<String>) -> Self {
        Self {
            ok: true,
            degraded: true,
            detail: Some(detail.into()),
        }
    }

    fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            degraded: false,
            detail: Some(detail.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Individual checks
// ---------------------------------------------------------------------------

/// The local tier is healthy when its directory exists and is writable.
/// A read-only directory still serves hits but can no longer commit.
async fn check_local_cache(store: Option<&DiskStore>) -> CheckResult {
    let Some(store) = store else {
        return CheckResult::healthy("disabled");
    };

    match tokio::fs::metadata(store.base_path()).await {
        Ok(meta) if !meta.is_dir() => {
            CheckResult::unhealthy(format!("{} is not a directory", store.base_path().display()))
        }
        Ok(meta) if meta.permissions().readonly() => CheckResult::degraded(format!(
            "{} is read-only; responses are not being cached",
            store.base_path().display()
        )),
        Ok(_) => CheckResult::healthy(format!(
            "{} entries, {} / {} bytes",
            store.entry_count(),
            store.size_bytes(),
            store.max_bytes()
        )),
        Err(e) => CheckResult::unhealthy(format!(
            "cache directory {} unavailable: {e}",
            store.base_path().display()
        )),
    }
}

// ---------------------------------------------------------------------------
// Aggregate status
// ---------------------------------------------------------------------------

fn aggregate_status(checks: &HealthChecks) -> HealthStatus {
    if !checks.local_cache.ok {
        HealthStatus::Unhealthy
    } else if checks.local_cache.degraded {
        HealthStatus::Degraded
    } else {
        HealthStatus::Ok
    }
}

// ---------------------------------------------------------------------------
// Axum handler
// ---------------------------------------------------------------------------

/// `GET /healthz` handler.  Returns 200 on Ok/Degraded, 503 on Unhealthy.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let local_cache = check_local_cache(state.store.as_deref()).await;

    let checks = HealthChecks { local_cache };
    let status = aggregate_status(&checks);
    let body = HealthResponse { status, checks };

    let http_status = match status {
        HealthStatus::Ok | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (http_status, Json(body))
}
