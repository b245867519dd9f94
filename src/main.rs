mod cache;
mod config;
mod director;
mod health;
mod http;
mod metrics;
mod transport;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use clap::Parser;
use tokio::signal;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::cache::{CacheStore, DiskStore};
use crate::config::Settings;
use crate::director::Director;
use crate::metrics::MetricsRegistry;
use crate::transport::{CachingTransport, HttpTransport, RetryingTransport, Transport};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "tiercache",
    version,
    about = "Two-tier caching reverse proxy for S3 artifact stores"
)]
struct Cli {
    /// Optional YAML configuration file.  Flags and environment take
    /// precedence over its values.
    #[arg(short, long, env = "TIERCACHE_CONFIG")]
    config: Option<PathBuf>,

    #[command(flatten)]
    settings: Settings,
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// Global state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub transport: Arc<CachingTransport>,
    /// Local tier, when enabled.
    pub store: Option<Arc<DiskStore>>,
    pub metrics: MetricsRegistry,
}

// ---------------------------------------------------------------------------
// HTTP servers (axum)
// ---------------------------------------------------------------------------

async fn serve(name: &'static str, listen: &str, app: Router) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("failed to bind {name} listener on {listen}"))?;

    let local_addr = listener.local_addr().context("listener has no local address")?;
    tracing::info!(%local_addr, "{name} server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .with_context(|| format!("{name} server error"))?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    // ---- Config ----
    let config = config::load_config(cli.settings, cli.config.as_deref())?;

    tracing::info!(
        backend = %config.backend,
        bind = %config.bind,
        allow_writes = config.allow_writes,
        max_retries = config.retry.max_retries,
        refresh_delay_secs = config.refresh_delay.as_secs(),
        "starting tiercache"
    );

    // ---- Metrics ----
    let metrics = MetricsRegistry::new();

    // ---- Local tier ----
    let store = match &config.local_cache {
        Some(local) => {
            let path = local.path.clone();
            let max_bytes = local.max_bytes;
            let store = tokio::task::spawn_blocking(move || DiskStore::open(path, max_bytes))
                .await
                .context("cache open task failed")?
                .with_context(|| {
                    format!("failed to open local cache: {}", local.path.display())
                })?;
            metrics
                .metrics
                .cache_size_bytes
                .set(i64::try_from(store.size_bytes()).unwrap_or(i64::MAX));
            Some(Arc::new(store))
        }
        None => {
            tracing::info!("local cache disabled");
            None
        }
    };

    // ---- Backend ----
    let director = Director::from_config(&config).await?;
    tracing::info!(
        kind = director.kind(),
        host = director.backend_host(),
        "backend director initialised"
    );

    let network: Arc<dyn Transport> = Arc::new(HttpTransport::new()?);
    let retrying: Arc<dyn Transport> =
        Arc::new(RetryingTransport::new(network, config.retry, metrics.clone()));
    let transport = CachingTransport::new(
        &config,
        director,
        retrying,
        store.clone().map(|s| s as Arc<dyn CacheStore>),
        metrics.clone(),
    );

    // ---- App state ----
    let state = Arc::new(AppState {
        transport: Arc::new(transport),
        store,
        metrics,
    });

    // ---- Spawn services ----
    let admin_handle = config.metrics_bind.clone().map(|listen| {
        let app = http::admin::create_router(Arc::clone(&state));
        tokio::spawn(async move {
            if let Err(e) = serve("admin", &listen, app).await {
                tracing::error!(error = %e, "admin server failed");
            }
        })
    });

    // A proxy listener failure is fatal; the admin server is best effort.
    let proxy_app = http::handler::create_router(Arc::clone(&state));
    serve("proxy", &config.bind, proxy_app).await?;

    if let Some(handle) = admin_handle {
        let _ = handle.await;
    }

    tracing::info!("tiercache shut down cleanly");
    Ok(())
}
