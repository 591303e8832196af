use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::timeout::TimeoutLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use voicegate::api::{metrics::init_metrics, rate_limit::spawn_cleanup_task};
use voicegate::config::Config;
use voicegate::jobs::HttpMatchingJobClient;
use voicegate::AppState;

#[derive(Parser, Debug)]
#[command(name = "voicegate")]
#[command(author, version, about = "Voice-based identity verification service", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "voicegate.toml")]
    config: PathBuf,

    /// Override log level
    #[arg(short, long)]
    log_level: Option<String>,

    /// Session signing secret
    #[arg(long, env = "VOICEGATE_SESSION_SECRET", hide_env_values = true)]
    session_secret: Option<String>,

    /// Base URL of the matching job service
    #[arg(long, env = "VOICEGATE_JOBS_URL")]
    jobs_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(&cli.config)?;
    if let Some(secret) = cli.session_secret {
        config.session.secret = secret;
    }
    if let Some(url) = cli.jobs_url {
        config.jobs.base_url = url;
    }
    config.check()?;

    let log_level = cli
        .log_level
        .as_ref()
        .unwrap_or(&config.logging.level)
        .clone();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting voicegate v{}", env!("CARGO_PKG_VERSION"));

    std::fs::create_dir_all(&config.server.data_dir)?;
    let db = voicegate::db::init(&config.server.data_dir).await?;

    let jobs = Arc::new(HttpMatchingJobClient::new(&config.jobs)?);
    if config.jobs.callback_secret.is_none() {
        tracing::warn!("No jobs.callback_secret configured, job callbacks are disabled");
    }

    let mut state = AppState::new(config.clone(), db, jobs);
    match init_metrics() {
        Ok(handle) => state = state.with_metrics(handle),
        Err(e) => tracing::warn!(error = %e, "Metrics exporter unavailable"),
    }
    let state = Arc::new(state);

    if config.rate_limit.enabled {
        spawn_cleanup_task(state.rate_limiter.clone(), config.rate_limit.cleanup_interval);
    }

    let app = voicegate::api::create_router(state).layer(TimeoutLayer::new(config.request_timeout()));

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("API server listening on http://{}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
