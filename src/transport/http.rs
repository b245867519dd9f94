use anyhow::{Context, Result};
use futures::TryStreamExt;
use tracing::trace;

use super::{BackendRequest, ProxyResponse, Transport, TransportError};

/// Network transport backed by a shared `reqwest` connection pool.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Redirects are returned to the caller rather than followed.
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("tiercache/", env!("CARGO_PKG_VERSION")))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context("failed to build reqwest client")?;
        Ok(Self { client })
    }
}

#[async_trait::async_trait]
impl Transport for HttpTransport {
    async fn execute(&self, req: BackendRequest) -> Result<ProxyResponse, TransportError> {
        trace!(method = %req.method, host = ?req.url.host_str(), "sending backend request");

        let resp = self
            .client
            .request(req.method, req.url)
            .headers(req.headers)
            .body(req.body)
            .send()
            .await?;

        let status = resp.status();
        let version = resp.version();
        let headers = resp.headers().clone();
        let body = resp.bytes_stream().map_err(TransportError::Body);

        Ok(ProxyResponse {
            status,
            version,
            headers,
            body: Box::pin(body),
        })
    }
}
