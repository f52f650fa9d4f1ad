//! Contact sync server
//!
//! Runs one side of the user-to-order contact propagation pipeline: the
//! user service that publishes contact changes, or the order service that
//! consumes them and rewrites its copies.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![forbid(unsafe_code)]

mod api;
mod config;
mod roles;
mod server;
mod shutdown;
mod state;

use clap::Parser;
use config::{ConfigLoader, Role, get_database_url};
use csync_core::events::shutdown_channel;
use csync_core::framework::DatabaseProcessor;
use server::{build_router, run_server};
use shutdown::{spawn_signal_listener, wait_for_shutdown};
use sqlx::postgres::PgPoolOptions;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Contact sync - keeps order contact copies consistent with user records
#[derive(Parser, Debug)]
#[command(name = "csync-server")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "./csync-config.toml")]
    config: PathBuf,

    /// Override the listen address (e.g., 0.0.0.0:3000)
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Which service this process runs
    #[arg(short, long, value_enum, env = "CSYNC_ROLE")]
    role: Role,

    /// Run database migrations on startup
    #[arg(long, default_value = "false")]
    migrate: bool,

    /// Emit logs as JSON lines
    #[arg(long, default_value = "false")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_tracing(args.log_json);

    tracing::info!(
        "Starting csync-server v{} as {}",
        env!("CARGO_PKG_VERSION"),
        args.role.as_str()
    );

    // Load configuration
    let config_loader = ConfigLoader::new(&args.config, args.listen, args.role);
    let config = config_loader.load().map_err(|e| {
        tracing::error!("Failed to load configuration: {}", e);
        e
    })?;
    tracing::info!("Configuration loaded from {:?}", args.config);

    // Get database URL from environment
    let database_url = get_database_url().map_err(|e| {
        tracing::error!("DATABASE_URL environment variable not set");
        e
    })?;

    // Create database connection pool
    tracing::info!("Connecting to database...");
    let db_pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&database_url)
        .await
        .map_err(|e| {
            tracing::error!("Failed to connect to database: {}", e);
            e
        })?;
    tracing::info!("Database connection established");

    // Run migrations if requested
    if args.migrate {
        tracing::info!("Running database migrations...");
        sqlx::migrate!("../migrations")
            .run(&db_pool)
            .await
            .map_err(|e| {
                tracing::error!("Failed to run migrations: {}", e);
                e
            })?;
        tracing::info!("Migrations completed successfully");
    }

    // Signals are watched from here on so a broker outage at startup can be interrupted
    let (shutdown_tx, shutdown_rx) = shutdown_channel();
    let shutdown_tx = Arc::new(shutdown_tx);
    let signal_listener = spawn_signal_listener(shutdown_tx.clone());

    let db = DatabaseProcessor::new(db_pool.clone());
    let running = match roles::start(args.role, &config, db, shutdown_rx.clone()).await {
        Ok(Some(running)) => running,
        Ok(None) => {
            tracing::info!("Shutdown requested during startup");
            db_pool.close().await;
            return Ok(());
        }
        Err(e) => {
            tracing::error!("Failed to start {}: {}", args.role.as_str(), e);
            signal_listener.abort();
            db_pool.close().await;
            return Err(e);
        }
    };

    // Build the router
    let router = build_router(running.state.clone());

    // Run the server
    tracing::info!("Starting HTTP server on {}", config.server.listen);
    let result = run_server(router, config.server.listen, wait_for_shutdown(shutdown_rx)).await;

    // Stop background work even if the server failed on its own
    shutdown_tx.send_replace(true);
    running.shutdown(config.shutdown_grace).await;
    signal_listener.abort();

    // Close database connections gracefully
    tracing::info!("Closing database connections...");
    db_pool.close().await;
    tracing::info!("Server shutdown complete");

    result.map_err(Into::into)
}

/// Initialize the tracing subscriber with environment-based filtering.
fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn,lapin=warn"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
