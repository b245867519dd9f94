use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use serde::Deserialize;
use url::Url;

use crate::transport::RetryPolicy;

const DEFAULT_BIND: &str = "127.0.0.1:7643";
const DEFAULT_CACHE_SIZE_GIB: u64 = 5;
const DEFAULT_REFRESH_DELAY_MINS: u64 = 60;
const DEFAULT_PRESIGN_TTL_SECS: u64 = 600;

// ---------------------------------------------------------------------------
// Raw settings (CLI / env / YAML)
// ---------------------------------------------------------------------------

/// One layer of user-supplied settings.  Every field is optional so layers
/// can be merged before defaults are applied.
///
/// The same struct is parsed from the command line (with `TIERCACHE_*`
/// environment fallbacks handled by clap) and from the YAML config file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Args, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Listen address for the proxy.  `:PORT` binds to localhost.
    #[arg(long, env = "TIERCACHE_BIND")]
    pub bind: Option<String>,

    /// Backend URI: `s3://bucket/prefix` or `http(s)://host/base`.
    #[arg(long, env = "TIERCACHE_BACKEND")]
    pub backend: Option<String>,

    /// Local cache directory.  Empty disables the local tier.
    #[arg(long, env = "TIERCACHE_CACHE_DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Local cache budget in GiB.
    #[arg(long, env = "TIERCACHE_CACHE_SIZE")]
    pub cache_size: Option<u64>,

    /// Minutes before a cached non-2xx response is re-checked.
    #[arg(long, env = "TIERCACHE_CACHE_REFRESH_DELAY")]
    pub cache_refresh_delay: Option<u64>,

    /// Forward PUT requests to the backend.
    #[arg(
        long,
        env = "TIERCACHE_ALLOW_WRITES",
        num_args = 0..=1,
        default_missing_value = "true"
    )]
    pub allow_writes: Option<bool>,

    /// Backend retries after the first attempt.
    #[arg(long, env = "TIERCACHE_MAX_RETRIES")]
    pub max_retries: Option<u32>,

    /// Listen address for `/healthz` and `/metrics`.
    #[arg(long, env = "TIERCACHE_METRICS_BIND")]
    pub metrics_bind: Option<String>,

    #[arg(long, env = "TIERCACHE_S3_REGION")]
    pub s3_region: Option<String>,

    /// Custom S3 endpoint, addressed path-style.
    #[arg(long, env = "TIERCACHE_S3_ENDPOINT")]
    pub s3_endpoint: Option<String>,

    /// Presigned URL validity in seconds.
    #[arg(long, env = "TIERCACHE_PRESIGN_TTL")]
    pub presign_ttl: Option<u64>,
}

impl Settings {
    /// Fill every unset field of `self` from `lower`.
    pub fn merge(self, lower: Settings) -> Settings {
        Settings {
            bind: self.bind.or(lower.bind),
            backend: self.backend.or(lower.backend),
            cache_dir: self.cache_dir.or(lower.cache_dir),
            cache_size: self.cache_size.or(lower.cache_size),
            cache_refresh_delay: self.cache_refresh_delay.or(lower.cache_refresh_delay),
            allow_writes: self.allow_writes.or(lower.allow_writes),
            max_retries: self.max_retries.or(lower.max_retries),
            metrics_bind: self.metrics_bind.or(lower.metrics_bind),
            s3_region: self.s3_region.or(lower.s3_region),
            s3_endpoint: self.s3_endpoint.or(lower.s3_endpoint),
            presign_ttl: self.presign_ttl.or(lower.presign_ttl),
        }
    }
}

// ---------------------------------------------------------------------------
// Resolved config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub backend: Url,
    /// `None` when the local tier is disabled.
    pub local_cache: Option<LocalCacheConfig>,
    pub refresh_delay: Duration,
    pub allow_writes: bool,
    pub retry: RetryPolicy,
    pub metrics_bind: Option<String>,
    pub s3: S3Config,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalCacheConfig {
    pub path: PathBuf,
    pub max_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Config {
    pub region: Option<String>,
    pub endpoint_url: Option<String>,
    pub presign_ttl: Duration,
}

/// Merge the CLI/env layer over the optional YAML file and resolve the
/// result into a validated [`Config`].
pub fn load_config(cli: Settings, path: Option<&Path>) -> Result<Config> {
    let file = match path {
        Some(path) => load_settings_file(path)?,
        None => Settings::default(),
    };
    resolve(cli.merge(file))
}

fn load_settings_file(path: &Path) -> Result<Settings> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    serde_yaml::from_str(&contents)
        .with_context(|| format!("failed to parse config file: {}", path.display()))
}

/// Apply defaults and validate.
pub fn resolve(settings: Settings) -> Result<Config> {
    let backend = settings
        .backend
        .filter(|b| !b.is_empty())
        .context("no backend configured (use --backend or TIERCACHE_BACKEND)")?;
    let backend =
        Url::parse(&backend).with_context(|| format!("invalid backend URI: {backend}"))?;
    anyhow::ensure!(
        matches!(backend.scheme(), "s3" | "http" | "https"),
        "unsupported backend scheme: {}",
        backend.scheme()
    );
    anyhow::ensure!(
        backend.host_str().is_some_and(|h| !h.is_empty()),
        "backend URI has no host or bucket: {backend}"
    );

    let local_cache = match settings.cache_dir {
        Some(path) if !path.as_os_str().is_empty() => {
            let gib = settings.cache_size.unwrap_or(DEFAULT_CACHE_SIZE_GIB);
            anyhow::ensure!(gib > 0, "cache_size must be at least 1 GiB");
            Some(LocalCacheConfig {
                path,
                max_bytes: gib.saturating_mul(1 << 30),
            })
        }
        _ => None,
    };

    let presign_ttl = settings.presign_ttl.unwrap_or(DEFAULT_PRESIGN_TTL_SECS);
    anyhow::ensure!(presign_ttl > 0, "presign_ttl must be positive");

    let refresh_mins = settings
        .cache_refresh_delay
        .unwrap_or(DEFAULT_REFRESH_DELAY_MINS);

    Ok(Config {
        bind: normalize_bind(settings.bind.as_deref().unwrap_or(DEFAULT_BIND)),
        backend,
        local_cache,
        refresh_delay: Duration::from_secs(refresh_mins.saturating_mul(60)),
        allow_writes: settings.allow_writes.unwrap_or(false),
        retry: RetryPolicy {
            max_retries: settings.max_retries.unwrap_or(1),
            ..RetryPolicy::default()
        },
        metrics_bind: settings
            .metrics_bind
            .filter(|b| !b.is_empty())
            .map(|b| normalize_bind(&b)),
        s3: S3Config {
            region: settings.s3_region.filter(|r| !r.is_empty()),
            endpoint_url: settings.s3_endpoint.filter(|e| !e.is_empty()),
            presign_ttl: Duration::from_secs(presign_ttl),
        },
    })
}

/// `:PORT` listens on localhost only.
fn normalize_bind(bind: &str) -> String {
    if bind.starts_with(':') {
        format!("127.0.0.1{bind}")
    } else {
        bind.to_string()
    }
}
