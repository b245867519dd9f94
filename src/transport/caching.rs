//! Cache decision core.
//!
//! Every request gets exactly one [`CacheDecision`]:
//!
//! | decision        | when                                                      |
//! |-----------------|-----------------------------------------------------------|
//! | `CACHE_HIT`     | GET, entry found, 2xx or younger than the refresh delay   |
//! | `CACHE_REFRESH` | GET, non-2xx entry at/after the refresh delay (deleted)   |
//! | `CACHE_MISS`    | GET, no usable entry                                      |
//! | `PASSTHROUGH`   | GET without a local tier, or PUT with writes enabled      |
//! | `DROP`          | anything else; answered locally with 405                  |
//! | `ERROR`         | directing or the backend call failed                      |
//!
//! Misses and refreshes are filled by teeing the backend body into the local
//! tier; the entry is written only once the whole body has been received.
//! Store I/O runs on the blocking pool, never on a runtime worker.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::http::header::{CONTENT_LENGTH, DATE};
use axum::http::{HeaderMap, Method, StatusCode, Version};
use bytes::Bytes;
use chrono::Utc;
use prometheus_client::encoding::EncodeLabelValue;
use tracing::{debug, info, warn};

use super::{BackendRequest, ProxyRequest, ProxyResponse, Transport, TransportError};
use crate::cache::entry::http_date;
use crate::cache::{CacheStore, CachedResponse, CachingBodyTee};
use crate::config::Config;
use crate::director::Director;
use crate::metrics::MetricsRegistry;

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum CacheDecision {
    Hit,
    Miss,
    Refresh,
    Drop,
    Passthrough,
    Error,
}

impl CacheDecision {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hit => "CACHE_HIT",
            Self::Miss => "CACHE_MISS",
            Self::Refresh => "CACHE_REFRESH",
            Self::Drop => "DROP",
            Self::Passthrough => "PASSTHROUGH",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for CacheDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of consulting the local tier.
enum Lookup {
    Fresh(CachedResponse),
    Stale,
    Absent,
}

pub struct CachingTransport {
    director: Director,
    inner: Arc<dyn Transport>,
    store: Option<Arc<dyn CacheStore>>,
    refresh_delay: Duration,
    allow_writes: bool,
    metrics: MetricsRegistry,
}

impl CachingTransport {
    pub fn new(
        config: &Config,
        director: Director,
        inner: Arc<dyn Transport>,
        store: Option<Arc<dyn CacheStore>>,
        metrics: MetricsRegistry,
    ) -> Self {
        Self {
            director,
            inner,
            store,
            refresh_delay: config.refresh_delay,
            allow_writes: config.allow_writes,
            metrics,
        }
    }

    /// Serve `req` from the local tier or the backend.
    ///
    /// Emits exactly one audit record once the decision is final.
    pub async fn execute(&self, req: ProxyRequest) -> Result<ProxyResponse, TransportError> {
        let method = req.method.clone();
        let path = req.uri.path().to_owned();

        let (decision, result) = self.dispatch(req).await;
        let decision = if result.is_err() {
            CacheDecision::Error
        } else {
            decision
        };

        self.metrics.metrics.record_decision(decision);
        info!(
            decision = %decision,
            status = result.as_ref().ok().map(|r| r.status.as_u16()),
            host = %self.director.backend_host(),
            method = %method,
            path = %path,
            "request"
        );
        result
    }

    async fn dispatch(
        &self,
        req: ProxyRequest,
    ) -> (CacheDecision, Result<ProxyResponse, TransportError>) {
        let cache_key = req.uri.path().to_owned();
        let store = self.store.as_ref().filter(|_| req.method == Method::GET);

        let decision = if let Some(store) = store {
            match self.lookup(store, &cache_key).await {
                Lookup::Fresh(cached) => return (CacheDecision::Hit, Ok(cached.into())),
                Lookup::Stale => {
                    if let Err(e) = off_runtime(store, &cache_key, |s, k| s.delete(k)).await {
                        warn!(error = %e, key = %cache_key, "failed to delete stale cache entry");
                    }
                    CacheDecision::Refresh
                }
                Lookup::Absent => CacheDecision::Miss,
            }
        } else if req.method == Method::GET || (req.method == Method::PUT && self.allow_writes) {
            CacheDecision::Passthrough
        } else {
            return (CacheDecision::Drop, Ok(ProxyResponse::method_not_allowed()));
        };

        let commit_to = store.map(|s| (Arc::clone(s), cache_key));
        (decision, self.fetch(req, commit_to).await)
    }

    /// Read and classify the entry for `key`.  Anything unreadable counts as
    /// absent.
    async fn lookup(&self, store: &Arc<dyn CacheStore>, key: &str) -> Lookup {
        let raw = match off_runtime(store, key, |s, k| s.get(k)).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return Lookup::Absent,
            Err(e) => {
                self.read_error(key, &e);
                return Lookup::Absent;
            }
        };

        let cached = match CachedResponse::decode(&raw) {
            Ok(c) => c,
            Err(e) => {
                self.read_error(key, &e);
                return Lookup::Absent;
            }
        };

        let stored_at = match cached.stored_at() {
            Ok(t) => t,
            Err(e) => {
                self.read_error(key, &e);
                return Lookup::Absent;
            }
        };

        // Successful entries never go stale; failed lookups are retried
        // against the backend once they are old enough.
        let age = (Utc::now() - stored_at).to_std().unwrap_or(Duration::ZERO);
        if cached.status.is_success() || age < self.refresh_delay {
            Lookup::Fresh(cached)
        } else {
            debug!(
                %key,
                status = cached.status.as_u16(),
                age_secs = age.as_secs(),
                "cache entry is stale"
            );
            Lookup::Stale
        }
    }

    fn read_error(&self, key: &str, err: &dyn fmt::Display) {
        self.metrics.metrics.cache_read_errors_total.inc();
        warn!(%key, error = %err, "failed to read cached response, treating as miss");
    }

    async fn fetch(
        &self,
        req: ProxyRequest,
        commit_to: Option<(Arc<dyn CacheStore>, String)>,
    ) -> Result<ProxyResponse, TransportError> {
        let directive = self
            .director
            .direct(&req.method, &req.uri)
            .await
            .map_err(TransportError::Director)?;
        debug!(
            key = %directive.key,
            backend = ?directive.url.host_str(),
            expires_at = ?directive.expires_at,
            "request directed"
        );
        let resp = self
            .inner
            .execute(BackendRequest::directed(req, directive))
            .await?;

        match commit_to {
            Some((store, key)) if !resp.status.is_server_error() => {
                let ProxyResponse {
                    status,
                    version,
                    headers,
                    body,
                } = resp;
                let declared_len = headers
                    .get(CONTENT_LENGTH)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.trim().parse::<u64>().ok());
                let commit = self.commit_fn(store, key, status, version, &headers);
                Ok(ProxyResponse {
                    status,
                    version,
                    headers,
                    body: Box::pin(CachingBodyTee::new(body, declared_len, commit)),
                })
            }
            _ => Ok(resp),
        }
    }

    /// Build the completion handler that stores the full response.  It runs
    /// inside a body poll, so the write itself goes to the blocking pool.
    fn commit_fn(
        &self,
        store: Arc<dyn CacheStore>,
        key: String,
        status: StatusCode,
        version: Version,
        headers: &HeaderMap,
    ) -> crate::cache::tee::OnComplete {
        let mut headers = headers.clone();
        if !headers.contains_key(DATE) {
            headers.insert(DATE, http_date(Utc::now()));
        }
        let metrics = self.metrics.clone();

        Box::new(move |body: Bytes| {
            tokio::task::spawn_blocking(move || {
                let entry = CachedResponse {
                    status,
                    version,
                    headers,
                    body,
                }
                .encode();
                let len = entry.len() as u64;

                match store.set(&key, entry) {
                    Ok(()) => {
                        metrics.metrics.cache_commits_total.inc();
                        metrics.metrics.cache_commit_bytes_total.inc_by(len);
                        metrics
                            .metrics
                            .cache_size_bytes
                            .set(i64::try_from(store.size_bytes()).unwrap_or(i64::MAX));
                        debug!(%key, bytes = len, "response committed to local cache");
                    }
                    Err(e) => warn!(%key, error = %e, "failed to commit response to local cache"),
                }
            });
        })
    }
}

/// Run a store operation on the blocking pool.
async fn off_runtime<T, F>(store: &Arc<dyn CacheStore>, key: &str, op: F) -> anyhow::Result<T>
where
    T: Send + 'static,
    F: FnOnce(&dyn CacheStore, &str) -> anyhow::Result<T> + Send + 'static,
{
    let store = Arc::clone(store);
    let key = key.to_owned();
    tokio::task::spawn_blocking(move || op(store.as_ref(), &key))
        .await
        .context("cache I/O task failed")?
}
