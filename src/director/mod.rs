//! Backend directors.
//!
//! A director turns an inbound `(method, path)` into a backend-addressed
//! request.  Exactly one director is built at startup from the backend URI
//! scheme and shared for the lifetime of the process.

pub mod passthrough;
pub mod s3;

use anyhow::{Result, bail};
use axum::http::{HeaderName, HeaderValue, Method, Uri};
use chrono::{DateTime, Utc};
use url::Url;

use crate::config::Config;

pub use passthrough::PassthroughDirector;
pub use s3::S3Director;

/// Where and how to send one outbound request.  Single use: object-store
/// directives carry credentials that stop working at `expires_at`.
#[derive(Debug, Clone)]
pub struct BackendDirective {
    /// Storage key the request addresses on the backend.
    pub key: String,
    /// Absolute URL to send the request to.
    pub url: Url,
    /// Headers the backend requires in addition to the forwarded ones.
    pub headers: Vec<(HeaderName, HeaderValue)>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// The closed set of supported backend kinds.
#[derive(Debug)]
pub enum Director {
    /// Plain HTTP(S) origin; only scheme and authority are rewritten.
    Passthrough(PassthroughDirector),
    /// S3 bucket addressed through presigned URLs.
    ObjectStore(S3Director),
}

impl Director {
    /// Select and build the director for `config.backend`.
    pub async fn from_config(config: &Config) -> Result<Self> {
        match config.backend.scheme() {
            "s3" => Ok(Self::ObjectStore(S3Director::from_config(config).await?)),
            "http" | "https" => Ok(Self::Passthrough(PassthroughDirector::new(
                config.backend.clone(),
            ))),
            other => bail!("unsupported backend scheme: {other}"),
        }
    }

    /// Rewrite `method uri` into a directive for the backend.
    pub async fn direct(&self, method: &Method, uri: &Uri) -> Result<BackendDirective> {
        match self {
            Self::Passthrough(d) => d.direct(uri),
            Self::ObjectStore(d) => d.direct(method, uri.path()).await,
        }
    }

    /// Backend name used in request logs.
    pub fn backend_host(&self) -> &str {
        match self {
            Self::Passthrough(d) => d.host(),
            Self::ObjectStore(d) => d.bucket(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Passthrough(_) => "passthrough",
            Self::ObjectStore(_) => "s3",
        }
    }
}

/// Join `prefix` and `path` into a storage key.
///
/// Leading and trailing slashes of `path` are dropped; an empty prefix or an
/// empty path collapses to the other component.
pub fn effective_key(prefix: &str, path: &str) -> String {
    let path = path.trim_matches('/');
    if prefix.is_empty() {
        return path.to_string();
    }
    if path.is_empty() {
        return prefix.to_string();
    }
    format!("{prefix}/{path}")
}
