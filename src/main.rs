// Auction engine entry point.
//
// Startup sequence:
// 1. Initialize tracing (log to file)
// 2. Load config
// 3. Open database
// 4. Create broadcast hub and auction service
// 5. Spawn WebSocket subscription server task
// 6. Wait for Ctrl+C, then tear down the hub

use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info};

use gavel::auction::service::AuctionService;
use gavel::auth::ManagerAuthorizer;
use gavel::config;
use gavel::db::Database;
use gavel::hub::BroadcastHub;
use gavel::ws_server;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Initialize tracing
    init_tracing()?;
    info!("gavel starting up");

    // 2. Load config
    let config = config::load_config().context("failed to load configuration")?;
    info!(
        "Config loaded: ws_port={}, db={}, min_increment={}",
        config.ws_port, config.db_path, config.min_increment
    );

    // 3. Open database
    let database = Arc::new(Database::open(&config.db_path).context("failed to open database")?);
    info!("Database opened at {}", config.db_path);

    // 4. Broadcast hub and the engine itself
    let hub = Arc::new(BroadcastHub::new());
    let service = Arc::new(AuctionService::new(
        database,
        hub.clone(),
        Arc::new(ManagerAuthorizer),
        config.min_increment,
    ));

    // 5. Spawn the WebSocket subscription server
    let ws_port = config.ws_port;
    let ws_handle = tokio::spawn(async move {
        if let Err(e) = ws_server::run(ws_port, service).await {
            error!("WebSocket server error: {e}");
        }
    });

    info!("Application ready. WebSocket server listening on 127.0.0.1:{ws_port}");

    // 6. Run until interrupted, then close every subscriber channel.
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    hub.shutdown();
    ws_handle.abort();

    info!("gavel shut down cleanly");
    Ok(())
}

/// Initialize tracing to log to a file under logs/.
fn init_tracing() -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let log_dir = std::env::current_dir()?.join("logs");
    std::fs::create_dir_all(&log_dir)?;

    let log_file = std::fs::File::create(log_dir.join("gavel.log"))?;

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("gavel=info,warn")),
        )
        .with_writer(log_file)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    Ok(())
}
