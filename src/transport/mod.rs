//! Request execution pipeline.
//!
//! A [`Transport`] executes one backend request and yields a streamed
//! response.  [`HttpTransport`] talks to the network,
//! [`RetryingTransport`] wraps any transport with bounded retries, and
//! [`CachingTransport`] sits in front of both to serve and fill the local
//! tier.

pub mod caching;
pub mod http;
pub mod retry;

use std::fmt;
use std::pin::Pin;

use axum::http::{HeaderMap, Method, StatusCode, Uri, Version};
use bytes::Bytes;
use futures::{Stream, stream};
use thiserror::Error;
use url::Url;

use crate::cache::CachedResponse;
use crate::director::BackendDirective;

pub use caching::{CacheDecision, CachingTransport};
pub use http::HttpTransport;
pub use retry::{RetryPolicy, RetryingTransport};

/// Response body as a stream of chunks.
pub type BodyStream = Pin<Box<dyn Stream<Item = Result<Bytes, TransportError>> + Send>>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("backend request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("backend body read failed: {0}")]
    Body(#[source] reqwest::Error),
    #[error("backend stream failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to direct request to backend: {0:#}")]
    Director(anyhow::Error),
}

/// An inbound request as received by the proxy frontend.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// A request addressed to the backend.  Cheap to clone so it can be resent.
#[derive(Debug, Clone)]
pub struct BackendRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl BackendRequest {
    /// Address `req` according to `directive`.  The inbound `Host` is
    /// dropped so the directive URL's authority is used.
    pub fn directed(req: ProxyRequest, directive: BackendDirective) -> Self {
        let mut headers = req.headers;
        headers.remove(axum::http::header::HOST);
        for (name, value) in directive.headers {
            headers.insert(name, value);
        }
        Self {
            method: req.method,
            url: directive.url,
            headers,
            body: req.body,
        }
    }
}

pub struct ProxyResponse {
    pub status: StatusCode,
    pub version: Version,
    pub headers: HeaderMap,
    pub body: BodyStream,
}

impl fmt::Debug for ProxyResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyResponse")
            .field("status", &self.status)
            .field("version", &self.version)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

impl ProxyResponse {
    /// A fully buffered response with a single-chunk body.
    pub fn buffered(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            status,
            version: Version::HTTP_11,
            headers,
            body: Box::pin(stream::once(async move { Ok(body) })),
        }
    }

    /// The local rejection for methods the proxy does not forward.
    pub fn method_not_allowed() -> Self {
        Self {
            status: StatusCode::METHOD_NOT_ALLOWED,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            body: Box::pin(stream::empty()),
        }
    }
}

impl From<CachedResponse> for ProxyResponse {
    fn from(cached: CachedResponse) -> Self {
        Self {
            version: cached.version,
            ..Self::buffered(cached.status, cached.headers, cached.body)
        }
    }
}

/// Executes backend requests.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, req: BackendRequest) -> Result<ProxyResponse, TransportError>;
}
