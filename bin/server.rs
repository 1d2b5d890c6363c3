// Daily Balance Batch - Web Server
// Read-only daily summary API over the batch database

use anyhow::{Context, Result};
use daily_balance_batch::api::{router, AppState};
use daily_balance_batch::{init_logging, BatchConfig, Store};

const BIND_ADDR: &str = "0.0.0.0:3000";

#[tokio::main]
async fn main() -> Result<()> {
    let config = BatchConfig::load().context("Failed to load configuration")?;
    init_logging(&config.logging);

    let store = Store::open(&config.database)
        .with_context(|| format!("Failed to open database at {}", config.database.path.display()))?;
    let timezone = config.schedule.parse_timezone()?;

    let app = router(AppState::new(store, timezone));

    let listener = tokio::net::TcpListener::bind(BIND_ADDR)
        .await
        .with_context(|| format!("Failed to bind to {BIND_ADDR}"))?;

    tracing::info!(addr = BIND_ADDR, db = %config.database.path.display(), "Server running");
    println!("🚀 Server running on http://localhost:3000");
    println!("   API: http://localhost:3000/api/accounts/daily-summary");

    axum::serve(listener, app).await.context("Server error")?;
    Ok(())
}
