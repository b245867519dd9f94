use std::sync::Arc;

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

use crate::transport::CacheDecision;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DecisionLabels {
    pub decision: CacheDecision,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Every Prometheus metric exposed by the proxy.
pub struct Metrics {
    // -- requests --
    pub requests_total: Family<DecisionLabels, Counter>,

    // -- local tier --
    pub cache_commits_total: Counter,
    pub cache_commit_bytes_total: Counter,
    pub cache_read_errors_total: Counter,
    pub cache_size_bytes: Gauge,

    // -- backend --
    pub backend_retries_total: Counter,
}

impl Metrics {
    pub fn new(registry: &mut Registry) -> Self {
        let requests_total = Family::<DecisionLabels, Counter>::default();
        registry.register(
            "tiercache_requests",
            "Requests handled, by cache decision",
            requests_total.clone(),
        );

        let cache_commits_total = Counter::default();
        registry.register(
            "tiercache_cache_commits",
            "Responses committed to the local cache tier",
            cache_commits_total.clone(),
        );

        let cache_commit_bytes_total = Counter::default();
        registry.register(
            "tiercache_cache_commit_bytes",
            "Serialized bytes committed to the local cache tier",
            cache_commit_bytes_total.clone(),
        );

        let cache_read_errors_total = Counter::default();
        registry.register(
            "tiercache_cache_read_errors",
            "Local cache entries that could not be read or parsed",
            cache_read_errors_total.clone(),
        );

        let cache_size_bytes: Gauge = Gauge::default();
        registry.register(
            "tiercache_cache_size_bytes",
            "Bytes currently held by the local cache tier",
            cache_size_bytes.clone(),
        );

        let backend_retries_total = Counter::default();
        registry.register(
            "tiercache_backend_retries",
            "Backend requests retried after a failure",
            backend_retries_total.clone(),
        );

        Self {
            requests_total,
            cache_commits_total,
            cache_commit_bytes_total,
            cache_read_errors_total,
            cache_size_bytes,
            backend_retries_total,
        }
    }

    pub fn record_decision(&self, decision: CacheDecision) {
        self.requests_total
            .get_or_create(&DecisionLabels { decision })
            .inc();
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry, used in `AppState`.
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all proxy metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    /// Render the registry in OpenMetrics text format.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, &self.registry)?;
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decisions_are_exported_per_label() {
        let registry = MetricsRegistry::new();
        registry.metrics.record_decision(CacheDecision::Hit);
        registry.metrics.record_decision(CacheDecision::Hit);
        registry.metrics.record_decision(CacheDecision::Drop);

        let text = registry.encode().unwrap();
        assert!(text.contains("tiercache_requests_total{decision=\"Hit\"} 2"));
        assert!(text.contains("tiercache_requests_total{decision=\"Drop\"} 1"));
        assert!(text.contains("tiercache_cache_size_bytes 0"));
        assert!(text.ends_with("# EOF\n"));
    }
}
