//! Bounded retries with exponential, fully jittered backoff.

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use super::{BackendRequest, ProxyResponse, Transport, TransportError};
use crate::metrics::MetricsRegistry;

/// Immutable retry configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Upper bound of the delay before retry number `retry` (0-based):
    /// `min(max_backoff, initial_backoff * 2^retry)`.
    pub fn backoff_ceiling(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// A uniformly random delay in `[0, backoff_ceiling(retry)]`.
    pub fn backoff(&self, retry: u32) -> Duration {
        self.backoff_ceiling(retry).mul_f64(rand::random::<f64>())
    }
}

/// Retries transport errors and 5xx responses, uniformly for every method.
pub struct RetryingTransport {
    inner: Arc<dyn Transport>,
    policy: RetryPolicy,
    metrics: MetricsRegistry,
}

impl RetryingTransport {
    pub fn new(inner: Arc<dyn Transport>, policy: RetryPolicy, metrics: MetricsRegistry) -> Self {
        Self {
            inner,
            policy,
            metrics,
        }
    }
}

#[async_trait::async_trait]
impl Transport for RetryingTransport {
    async fn execute(&self, req: BackendRequest) -> Result<ProxyResponse, TransportError> {
        let mut retry = 0;
        loop {
            let result = self.inner.execute(req.clone()).await;

            let failure = match &result {
                Ok(resp) if resp.status.is_server_error() => Some(resp.status.to_string()),
                Ok(_) => None,
                Err(e) => Some(e.to_string()),
            };
            let Some(failure) = failure else {
                return result;
            };
            if retry >= self.policy.max_retries {
                return result;
            }
            // Release the failed response's connection before sleeping.
            drop(result);

            let delay = self.policy.backoff(retry);
            warn!(
                method = %req.method,
                host = ?req.url.host_str(),
                attempt = retry + 1,
                max_retries = self.policy.max_retries,
                delay_ms = delay.as_millis() as u64,
                %failure,
                "backend request failed, retrying"
            );
            self.metrics.metrics.backend_retries_total.inc();
            tokio::time::sleep(delay).await;
            retry += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::http::{HeaderMap, Method, StatusCode};
    use bytes::Bytes;
    use url::Url;

    use super::*;

    /// Replays a scripted list of outcomes, one per call.
    struct Scripted {
        outcomes: Mutex<VecDeque<Result<StatusCode, ()>>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(outcomes: Vec<Result<StatusCode, ()>>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes.into()),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait::async_trait]
    impl Transport for Scripted {
        async fn execute(&self, _req: BackendRequest) -> Result<ProxyResponse, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.outcomes.lock().unwrap().pop_front() {
                Some(Ok(status)) => Ok(ProxyResponse::buffered(status, HeaderMap::new(), Bytes::new())),
                _ => Err(TransportError::Io(std::io::Error::other("connection refused"))),
            }
        }
    }

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
        }
    }

    fn request() -> BackendRequest {
        BackendRequest {
            method: Method::GET,
            url: Url::parse("http://backend/cas/1").unwrap(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    #[test]
    fn backoff_grows_exponentially_up_to_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_ceiling(0), Duration::from_millis(500));
        assert_eq!(policy.backoff_ceiling(1), Duration::from_secs(1));
        assert_eq!(policy.backoff_ceiling(3), Duration::from_secs(4));
        assert_eq!(policy.backoff_ceiling(5), Duration::from_secs(10));
        assert_eq!(policy.backoff_ceiling(64), Duration::from_secs(10));

        for retry in 0..8 {
            assert!(policy.backoff(retry) <= policy.backoff_ceiling(retry));
        }
    }

    #[tokio::test]
    async fn transport_errors_are_retried_until_success() {
        let inner = Scripted::new(vec![Err(()), Err(()), Ok(StatusCode::OK)]);
        let metrics = MetricsRegistry::new();
        let t = RetryingTransport::new(inner.clone(), fast_policy(3), metrics.clone());

        let resp = t.execute(request()).await.unwrap();
        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
        assert_eq!(metrics.metrics.backend_retries_total.get(), 2);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let inner = Scripted::new(vec![Err(()), Err(()), Err(()), Ok(StatusCode::OK)]);
        let t = RetryingTransport::new(inner.clone(), fast_policy(2), MetricsRegistry::new());

        assert!(t.execute(request()).await.is_err());
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn server_errors_are_retried_and_last_one_surfaced() {
        let inner = Scripted::new(vec![
            Ok(StatusCode::SERVICE_UNAVAILABLE),
            Ok(StatusCode::BAD_GATEWAY),
        ]);
        let t = RetryingTransport::new(inner.clone(), fast_policy(1), MetricsRegistry::new());

        let resp = t.execute(request()).await.unwrap();
        assert_eq!(resp.status, StatusCode::BAD_GATEWAY);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let inner = Scripted::new(vec![Ok(StatusCode::NOT_FOUND), Ok(StatusCode::OK)]);
        let t = RetryingTransport::new(inner.clone(), fast_policy(5), MetricsRegistry::new());

        let resp = t.execute(request()).await.unwrap();
        assert_eq!(resp.status, StatusCode::NOT_FOUND);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn zero_retries_means_single_attempt() {
        let inner = Scripted::new(vec![Err(()), Ok(StatusCode::OK)]);
        let t = RetryingTransport::new(inner.clone(), fast_policy(0), MetricsRegistry::new());

        assert!(t.execute(request()).await.is_err());
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }
}
