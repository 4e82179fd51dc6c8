use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use wallet_tracker::config::Config;
use wallet_tracker::decoder::BareDecoder;
use wallet_tracker::sol_price::spawn_sol_price_feed;
use wallet_tracker::store::SqliteStore;
use wallet_tracker::Tracker;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_logging();

    info!("🚀 Wallet Tracker Starting...");

    let config = Config::from_env().context("Failed to load configuration")?;
    info!("⚙️  Configuration loaded");

    let store = Arc::new(
        SqliteStore::open(&config.database_path).context("Failed to open database")?,
    );
    info!("✅ Database initialized: {}", config.database_path);

    let _price_feed = spawn_sol_price_feed(store.clone());

    // Swap classification is pluggable; without a venue decoder every
    // transaction is persisted as a bare transfer record.
    let decoder = Arc::new(BareDecoder);
    let tracker = Tracker::new(&config, store, decoder)?;

    if tracker.addresses().is_empty() {
        warn!("TRACKED_WALLETS is empty; set addresses before starting");
    } else {
        let response = tracker.start().await;
        if !response.ok {
            anyhow::bail!("Failed to start tracker: {}", response.msg);
        }
    }

    tokio::signal::ctrl_c().await.context("Failed to listen for ctrl-c")?;
    info!("Received shutdown signal");

    let response = tracker.stop().await;
    info!("Tracker shutdown: {}", response.msg);
    Ok(())
}

fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .init();
}
