//! Warp multi-account gateway
//!
//! Single-binary service that:
//! 1. Loads the account pool from one-JSON-file-per-account storage
//! 2. Serves OpenAI- and Anthropic-compatible chat endpoints
//! 3. Translates each request into Warp's protobuf-over-SSE protocol
//! 4. Fails over across accounts on 403/429/quota faults

mod admin;
mod chat;
mod client;
mod config;
mod dispatch;
mod metrics;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use warp_pool::{AccountStore, Pool, refresh_all_tokens};

use crate::client::UpstreamClient;
use crate::config::Settings;

/// Shared application state accessible from all handlers
#[derive(Clone)]
pub struct AppState {
    pub pool: Arc<Pool>,
    pub settings: Arc<RwLock<Settings>>,
    pub upstream: Arc<UpstreamClient>,
    pub config_path: Arc<PathBuf>,
    pub metrics: PrometheusHandle,
}

#[tokio::main]
async fn main() -> Result<()> {
    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Settings::resolve_path(cli_config_path);
    let settings = Settings::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    init_logging(&settings.logging.level).context("failed to initialize logging")?;
    info!("starting warp-gateway");
    info!(
        path = %config_path.display(),
        strategy = settings.strategy.as_str(),
        accounts_dir = %settings.accounts_dir.display(),
        "configuration loaded"
    );

    let metrics_handle = metrics::install_recorder();

    let upstream = Arc::new(UpstreamClient::from_env().context("failed to build HTTP client")?);

    // An unreadable accounts directory is the one fatal startup error.
    let store = AccountStore::new(&settings.accounts_dir);
    let pool = Arc::new(
        Pool::load(store, settings.policy())
            .await
            .with_context(|| {
                format!(
                    "failed to open accounts directory {}",
                    settings.accounts_dir.display()
                )
            })?,
    );

    // Serial startup refresh; the identity endpoint rate-limits bursts.
    let refresh_delay = Duration::from_secs(settings.refresh_delay_secs);
    refresh_all_tokens(&pool, upstream.identity(), refresh_delay).await;
    if settings.init_sessions_on_startup {
        upstream.initialize_all_sessions(&pool, refresh_delay).await;
    }

    let listen_addr = format!("{}:{}", settings.server.host, settings.server.port);
    let app_state = AppState {
        pool,
        settings: Arc::new(RwLock::new(settings)),
        upstream,
        config_path: Arc::new(config_path),
        metrics: metrics_handle,
    };

    let app = Router::new()
        .route("/v1/chat/completions", post(chat::openai_chat))
        .route("/warp/v1/chat/completions", post(chat::openai_chat))
        .route("/v1/messages", post(chat::anthropic_messages))
        .route("/anthropic/v1/messages", post(chat::anthropic_messages))
        .route("/models", get(admin::models))
        .route("/v1/models", get(admin::models))
        .route("/health", get(admin::health))
        .route("/stats", get(admin::stats))
        .route("/metrics", get(admin::metrics_text))
        .route("/accounts/reload", post(admin::reload_accounts))
        .route("/accounts/add", post(admin::add_account))
        .route("/accounts/refresh", post(admin::refresh_accounts))
        .route("/accounts/delete-blocked", post(admin::delete_blocked))
        .with_state(app_state);

    let listener = TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("shutdown complete");
    Ok(())
}

/// Tracing to stdout and to `logs/warp_api.log`, level from LOG_LEVEL /
/// RUST_LOG / the settings file.
fn init_logging(default_level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_env("LOG_LEVEL")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    let log_dir = std::path::Path::new("logs");
    std::fs::create_dir_all(log_dir)?;
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join("warp_api.log"))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Arc::new(log_file)),
        )
        .init();
    Ok(())
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
