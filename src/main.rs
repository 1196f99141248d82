mod api;
mod config;
mod db;
mod gateway;
mod metrics;
mod networks;
mod reporter;
mod types;
mod watcher;

use std::time::Duration;

use config::Config;
use gateway::GatewayRegistry;
use reporter::Reporter;
use watcher::WatcherManager;

fn main() -> eyre::Result<()> {
    // Install color-eyre for better error reporting
    color_eyre::install()?;

    // Run the async main
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> eyre::Result<()> {
    // Initialize logging
    init_logging();

    tracing::info!("Starting ZOS Bridge Relayer");

    // Load configuration
    let config = Config::load()?;
    tracing::info!(
        networks = ?config.networks_to_watch,
        "Configuration loaded"
    );

    // Connect to database
    let db = db::create_pool(&config.database.url).await?;
    tracing::info!("Database connected");

    // Run migrations
    db::run_migrations(&db).await?;
    tracing::info!("Database migrations complete");

    // Build one gateway per network, shared by watchers and the reporter
    let registry = GatewayRegistry::from_config(&config)?;

    // Create shutdown channels
    let (shutdown_tx, shutdown_rx) = tokio::sync::mpsc::channel::<()>(1);
    let (shutdown_tx2, shutdown_rx2) = tokio::sync::mpsc::channel::<()>(1);

    // Setup signal handlers
    let shutdown_tx_signal = shutdown_tx.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        let _ = shutdown_tx_signal.send(()).await;
        let _ = shutdown_tx2.send(()).await;
    });

    // Create the per-network watchers and the single reporter
    let watcher_manager = WatcherManager::new(&config, registry.clone(), db.clone());
    let poll_interval = Duration::from_millis(config.relayer.poll_interval_ms);
    let reporter = Reporter::new(registry.clone(), db.clone(), poll_interval);

    tracing::info!("Watchers and reporter initialized, starting processing");

    // Start metrics/API server
    let api_addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.relayer.api_port));
    let api_db = db.clone();
    let api_registry = registry.clone();
    let api_networks = config.networks_to_watch.clone();
    tokio::spawn(async move {
        if let Err(e) = api::start_api_server(api_addr, api_db, api_registry, api_networks).await {
            tracing::error!(error = %e, "API server error");
        }
    });

    // Run watchers and reporter concurrently
    tokio::select! {
        result = watcher_manager.run(shutdown_rx) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Watcher manager error");
            }
        }
        result = reporter.run(shutdown_rx2) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Reporter error");
            }
        }
    }

    tracing::info!("ZOS Bridge Relayer stopped");
    Ok(())
}

/// Initialize tracing/logging with structured output
fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,zos_relayer=debug"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .with(filter)
        .init();
}

/// Wait for shutdown signals (SIGINT/SIGTERM)
async fn wait_for_shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}
