//! ppm-md (Master Data) - aggregation and refresh service
//!
//! Owns the write side: runs the aggregation engine on a schedule, publishes
//! the aggregate through the backing store's strategy chain and keeps the
//! refresh status row current. `--once` runs a single forced cycle and exits
//! non-zero on FAILED.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use ppm_common::config::{resolve_bind_address, resolve_database_path, StoreBackend, TomlConfig};
use ppm_common::store::{AggregateStore, SqliteStore};
use ppm_md::scheduler::RefreshScheduler;
use ppm_md::{build_router, AppState, RefreshController, RefreshStatus, DEFAULT_BIND_ADDRESS};
use sqlx::SqlitePool;
use tokio::signal;
use tracing::{error, info, warn};

/// Command-line arguments for ppm-md
#[derive(Parser, Debug)]
#[command(name = "ppm-md")]
#[command(about = "Master data aggregation and refresh service for PPM")]
#[command(version)]
struct Args {
    /// TOML config file (default: <config_dir>/ppm/ppm.toml)
    #[arg(short, long, env = "PPM_CONFIG")]
    config: Option<PathBuf>,

    /// SQLite database path
    #[arg(short, long)]
    database: Option<PathBuf>,

    /// Listen address, e.g. 127.0.0.1:5811
    #[arg(short, long)]
    bind: Option<String>,

    /// Run one refresh cycle and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = TomlConfig::load_or_default(args.config.as_deref())?;
    config.apply_env_overrides()?;
    config.validate()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(config.logging.level.parse().context("Invalid logging.level")?),
        )
        .init();

    info!(
        "Starting PPM Master Data (ppm-md) v{} [{}] built {} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_PROFILE")
    );

    let db_path = resolve_database_path(args.database.as_deref(), &config);
    info!("Database path: {}", db_path.display());
    let pool = ppm_common::db::init_database(&db_path)
        .await
        .context("Failed to open database")?;

    let store = open_store(&config, &pool).await?;
    info!(backend = store.backend(), capabilities = ?store.capabilities(), "Aggregate store ready");

    let controller = Arc::new(RefreshController::from_config(pool, store, &config)?);

    if args.once {
        let report = controller
            .refresh_with_timeout(config.refresh.timeout())
            .await;
        println!("{}", serde_json::to_string_pretty(&report)?);
        if report.status == RefreshStatus::Failed {
            anyhow::bail!("refresh cycle failed: {}", report.error.unwrap_or_default());
        }
        return Ok(());
    }

    let scheduler = RefreshScheduler::new(Arc::clone(&controller), config.refresh.clone()).spawn();

    let bind_address = resolve_bind_address(args.bind.as_deref(), &config, DEFAULT_BIND_ADDRESS);
    let state = AppState::new(controller, Arc::new(config));
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("Failed to bind to {}", bind_address))?;
    info!("ppm-md listening on http://{}", bind_address);
    info!("Health check: http://{}/health", bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    if let Some(handle) = scheduler {
        handle.abort();
    }
    info!("Server shutdown complete");
    Ok(())
}

async fn open_store(config: &TomlConfig, pool: &SqlitePool) -> Result<Arc<dyn AggregateStore>> {
    match config.store.backend {
        StoreBackend::Sqlite => Ok(Arc::new(SqliteStore::new(pool.clone()))),
        StoreBackend::Postgres => open_postgres(config).await,
    }
}

#[cfg(feature = "postgres")]
async fn open_postgres(config: &TomlConfig) -> Result<Arc<dyn AggregateStore>> {
    let url = config
        .store
        .postgres_url
        .as_deref()
        .context("store.postgres_url is required for the postgres backend")?;
    let store = ppm_common::store::PostgresStore::connect(url)
        .await
        .context("Failed to connect to PostgreSQL")?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "postgres"))]
async fn open_postgres(_config: &TomlConfig) -> Result<Arc<dyn AggregateStore>> {
    anyhow::bail!("ppm-md was built without the `postgres` feature")
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
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
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
