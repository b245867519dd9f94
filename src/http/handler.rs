//! Proxy frontend.
//!
//! Every method and path goes through a single fallback handler that
//! buffers the request body, hands the request to the caching transport and
//! streams the response back.

use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    extract::{Request, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use tracing::{error, warn};

use crate::AppState;
use crate::transport::{ProxyRequest, TransportError};

/// Connection-level headers that must not cross the proxy.
const HOP_BY_HOP: [header::HeaderName; 8] = [
    header::CONNECTION,
    header::HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Build the proxy [`Router`].
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new().fallback(handle_proxy).with_state(state)
}

async fn handle_proxy(
    State(state): State<Arc<AppState>>,
    req: Request,
) -> Result<Response, AppError> {
    let (parts, body) = req.into_parts();
    let body = axum::body::to_bytes(body, usize::MAX).await.map_err(|e| {
        warn!(error = %e, "failed to read request body");
        AppError::BadRequest(format!("failed to read request body: {e}"))
    })?;

    let mut headers = parts.headers;
    strip_hop_by_hop(&mut headers);
    headers.remove(header::HOST);

    let resp = state
        .transport
        .execute(ProxyRequest {
            method: parts.method,
            uri: parts.uri,
            headers,
            body,
        })
        .await?;

    let mut response = Response::new(Body::from_stream(resp.body));
    *response.status_mut() = resp.status;
    *response.headers_mut() = resp.headers;
    strip_hop_by_hop(response.headers_mut());
    Ok(response)
}

/// Remove hop-by-hop headers, including any named by `Connection`.
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<header::HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| name.trim().parse().ok())
        .collect();
    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Application-level error that converts into an HTTP response.
#[derive(Debug)]
pub enum AppError {
    /// The inbound request could not be read.
    BadRequest(String),
    /// The backend could not be reached or its response failed.
    BadGateway(TransportError),
    /// The request could not be addressed to the backend.
    Internal(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            AppError::BadGateway(err) => {
                error!(error = %err, "backend request failed");
                (StatusCode::BAD_GATEWAY, format!("Bad gateway: {err}")).into_response()
            }
            AppError::Internal(err) => {
                error!(error = %err, "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Internal server error: {err:#}"),
                )
                    .into_response()
            }
        }
    }
}

impl From<TransportError> for AppError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Director(e) => AppError::Internal(e),
            other => AppError::BadGateway(other),
        }
    }
}
