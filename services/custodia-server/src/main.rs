//! Custodia Server
//!
//! Runs the escrow engine behind its REST API.
//!
//! # Usage
//!
//! ```bash
//! # Start with default settings (SQLite file in the working directory)
//! custodia-server
//!
//! # Start with custom config
//! custodia-server --config /path/to/config.toml
//!
//! # Start with environment overrides
//! CUSTODIA__SERVER__PORT=8080 CUSTODIA__DATABASE__BACKEND=memory custodia-server
//! ```

mod config;

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use custodia_api::{create_router, AppState};
use custodia_db::{Database, StorageBackend};
use custodia_escrow::{EscrowRepository, EscrowService, InMemoryEscrowRepository};
use custodia_gateway::{ProcessorRegistry, SandboxProcessor};

use crate::config::ServerConfig;

// =============================================================================
// CLI Arguments
// =============================================================================

/// Custodia - escrow transaction lifecycle server
#[derive(Parser, Debug)]
#[command(name = "custodia-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (TOML, JSON, or YAML)
    #[arg(short, long, env = "CUSTODIA_CONFIG")]
    config: Option<String>,

    /// Host to bind to
    #[arg(long, env = "CUSTODIA_HOST")]
    host: Option<String>,

    /// Port to listen on
    #[arg(short, long, env = "CUSTODIA_PORT")]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "CUSTODIA_LOG_LEVEL")]
    log_level: Option<String>,

    /// Log format (json, pretty)
    #[arg(long, env = "CUSTODIA_LOG_FORMAT")]
    log_format: Option<String>,

    /// SQLite connection URL
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,
}

impl Args {
    /// Flags win over every configuration layer
    fn apply(self, config: &mut ServerConfig) {
        if let Some(host) = self.host {
            config.server.host = host;
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(level) = self.log_level {
            config.logging.level = level;
        }
        if let Some(format) = self.log_format {
            config.logging.format = format;
        }
        if let Some(url) = self.database_url {
            config.database.url = url;
        }
    }
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut server_config = ServerConfig::load(args.config.as_deref())?;
    args.apply(&mut server_config);

    init_logging(&server_config.logging)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting Custodia server"
    );

    if server_config.metrics.enabled {
        start_metrics_server(&server_config.metrics)?;
    }

    let (repository, db) = init_storage(&server_config).await?;
    let registry = init_processors(&server_config)?;

    tracing::info!(
        processors = ?registry.names(),
        timeout_ms = server_config.escrow.processor_timeout_ms,
        "Escrow engine ready"
    );

    let service = EscrowService::new(repository, registry, server_config.escrow.clone());
    let state = Arc::new(AppState::new(Arc::new(service), db));
    let app = create_router(state, server_config.api.clone());

    let addr = server_config.server.socket_addr()?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))?;

    tracing::info!(
        host = %server_config.server.host,
        port = %server_config.server.port,
        "Server listening"
    );

    serve(listener, app, server_config.server.shutdown_timeout()).await?;

    tracing::info!("Server shutdown complete");

    Ok(())
}

// =============================================================================
// Initialization Functions
// =============================================================================

/// Initialize tracing/logging
fn init_logging(config: &config::LoggingConfig) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .context("invalid log level")?;

    let subscriber = tracing_subscriber::registry().with(env_filter);

    match config.format.as_str() {
        "json" => subscriber
            .with(fmt::layer().json().with_target(true))
            .try_init()?,
        _ => subscriber
            .with(fmt::layer().pretty().with_target(true))
            .try_init()?,
    }

    Ok(())
}

/// Open the configured escrow store
async fn init_storage(
    config: &ServerConfig,
) -> anyhow::Result<(Arc<dyn EscrowRepository>, Option<Arc<Database>>)> {
    match config.database.backend {
        StorageBackend::Memory => {
            tracing::warn!("Using the in-memory store; escrows are lost on restart");
            let repository: Arc<dyn EscrowRepository> = Arc::new(InMemoryEscrowRepository::new());
            Ok((repository, None))
        }
        StorageBackend::Sqlite => {
            let db = Database::open(&config.database)
                .await
                .context("opening the escrow database")?;

            let health = db.health_check().await;
            if !health.healthy {
                anyhow::bail!("Database health check failed");
            }
            tracing::info!(sqlite = health.sqlite, "Database health check passed");

            let db = Arc::new(db);
            let repository: Arc<dyn EscrowRepository> = Arc::new(db.escrow_repo());
            Ok((repository, Some(db)))
        }
    }
}

/// Build the processor registry
fn init_processors(config: &ServerConfig) -> anyhow::Result<ProcessorRegistry> {
    let mut registry = ProcessorRegistry::new();

    if config.processors.sandbox {
        let mut sandbox = SandboxProcessor::new("sandbox");
        if config.processors.sandbox_latency_ms > 0 {
            sandbox =
                sandbox.with_latency(Duration::from_millis(config.processors.sandbox_latency_ms));
        }
        registry.register(Arc::new(sandbox))?;
    }

    if registry.is_empty() {
        anyhow::bail!("No escrow processors configured");
    }

    match config.escrow.default_processor.as_deref() {
        Some(name) => registry.set_default(name)?,
        None if config.processors.sandbox => registry.set_default("sandbox")?,
        None => {}
    }

    Ok(registry)
}

/// Start Prometheus metrics server
fn start_metrics_server(config: &config::MetricsConfig) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));

    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("installing the Prometheus exporter")?;

    tracing::info!(port = config.port, "Metrics server started");
    Ok(())
}

// =============================================================================
// Graceful Shutdown
// =============================================================================

/// Serve until a shutdown signal, then drain for at most `drain_timeout`
async fn serve(
    listener: tokio::net::TcpListener,
    app: axum::Router,
    drain_timeout: Duration,
) -> anyhow::Result<()> {
    let (signalled_tx, signalled_rx) = tokio::sync::oneshot::channel::<()>();

    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            let _ = signalled_tx.send(());
        })
        .into_future();

    let drain_deadline = async move {
        if signalled_rx.await.is_ok() {
            tracing::info!(
                timeout_secs = drain_timeout.as_secs(),
                "Waiting for in-flight requests to complete..."
            );
            tokio::time::sleep(drain_timeout).await;
        } else {
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        result = server => result?,
        _ = drain_deadline => {
            tracing::warn!("Drain timeout elapsed, abandoning open connections");
        }
    }

    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
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
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown...");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
