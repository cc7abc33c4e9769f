// =============================================================================
// Aurora Trading Supervisor — Main Entry Point
// =============================================================================
//
// Boots the durable Store, the Event Hub, and the three managers that own
// every long-running task in the process (TraderManager, DebateManager,
// BacktestManager), then serves the thin REST+SSE API surface over them.
// Traders are started explicitly via the API — nothing trades on boot.
// =============================================================================

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use aurora_trading_supervisor::backtest::BacktestManager;
use aurora_trading_supervisor::debate::DebateManager;
use aurora_trading_supervisor::events::EventHub;
use aurora_trading_supervisor::llm::client::LlmClient;
use aurora_trading_supervisor::manager::TraderManager;
use aurora_trading_supervisor::persistence::store::Store;
use aurora_trading_supervisor::{api, types};

/// Process-level bootstrap config, read once at startup. Distinct from a
/// Strategy's `StrategyConfig`, which is hot-reloaded from the Store every
/// cycle.
struct BootConfig {
    bind_addr: String,
    storage_path: String,
    llm_base_url: String,
    llm_api_key: String,
}

impl BootConfig {
    fn from_env() -> Self {
        Self {
            bind_addr: std::env::var("AURORA_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            storage_path: std::env::var("AURORA_DB_PATH").unwrap_or_else(|_| "aurora.db".to_string()),
            llm_base_url: std::env::var("AURORA_LLM_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            llm_api_key: std::env::var("AURORA_LLM_API_KEY").unwrap_or_default(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Aurora Trading Supervisor — Starting Up           ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config = BootConfig::from_env();
    if config.llm_api_key.is_empty() {
        warn!("AURORA_LLM_API_KEY is not set; decision pipeline calls will fail until it is configured");
    }
    if std::env::var("AURORA_ADMIN_TOKEN").is_err() {
        warn!("AURORA_ADMIN_TOKEN is not set; every authenticated API request will be rejected");
    }

    let store = Store::open(&config.storage_path)?;
    let hub = EventHub::spawn();
    let llm = Arc::new(LlmClient::new(config.llm_base_url.clone(), config.llm_api_key.clone()));

    let trader_manager = TraderManager::new(
        store.clone(),
        hub.clone(),
        config.llm_base_url.clone(),
        config.llm_api_key.clone(),
    );
    let debate_manager = DebateManager::new(hub.clone(), llm.clone());
    let backtest_manager = BacktestManager::new(llm.clone());

    // Resume any trader that was left in the `running` state the last time
    // the process shut down (e.g. a crash rather than a graceful stop).
    match store.list_traders().await {
        Ok(traders) => {
            for t in traders.into_iter().filter(|t| t.status == types::TraderStatus::Running) {
                info!(trader_id = %t.id, name = %t.name, "resuming previously-running trader");
                if let Err(err) = trader_manager.start(t.id).await {
                    error!(trader_id = %t.id, error = %err, "failed to resume trader on startup");
                }
            }
        }
        Err(err) => warn!(error = %err, "failed to list traders for startup resume"),
    }

    let state = Arc::new(api::rest::ApiState {
        store,
        hub,
        traders: trader_manager.clone(),
        debates: debate_manager,
        backtests: backtest_manager,
    });

    let app = api::rest::router(state);
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!(addr = %config.bind_addr, "API server listening");

    let server = tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            error!(error = %err, "API server exited with error");
        }
    });

    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping gracefully");

    trader_manager.stop_all().await;
    server.abort();

    info!("Aurora Trading Supervisor shut down complete.");
    Ok(())
}
