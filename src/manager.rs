// =============================================================================
// Trader Manager — an Engine is created when Start(id) succeeds and
// destroyed when Stop(id) completes.
// =============================================================================
//
// The single owner of Engine lifecycle. The registry lock is only ever held
// for the short synchronous section that inserts or removes an `Arc<Engine>`
// — persistence calls and the Engine's own pre-flight always happen outside
// the lock; callers never hold it across an await on the store.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::engine::Engine;
use crate::events::EventHub;
use crate::exchange::adapter::ExchangeAdapter;
use crate::llm::client::LlmClient;
use crate::persistence::store::{Store, TraderRecord};
use crate::position::Position;
use crate::types::TraderStatus;

/// Owns every running Engine for this process. One `TraderManager` per
/// server; `Arc<TraderManager>` is shared into the API layer.
pub struct TraderManager {
    store: Store,
    hub: EventHub,
    llm_base_url: String,
    llm_api_key: String,
    engines: RwLock<HashMap<Uuid, Arc<Engine>>>,
}

impl TraderManager {
    pub fn new(store: Store, hub: EventHub, llm_base_url: impl Into<String>, llm_api_key: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            store,
            hub,
            llm_base_url: llm_base_url.into(),
            llm_api_key: llm_api_key.into(),
            engines: RwLock::new(HashMap::new()),
        })
    }

    /// Start the given trader's Engine, idempotently transitioning a stopped
    /// Engine to running.
    pub async fn start(self: &Arc<Self>, trader_id: Uuid) -> Result<()> {
        if self.is_running(trader_id) {
            return Ok(());
        }

        let trader = self
            .find_trader(trader_id)
            .await?
            .with_context(|| format!("trader {trader_id} not found"))?;
        let strategy = self
            .store
            .get_strategy(trader.strategy_id)
            .await?
            .with_context(|| format!("strategy {} not found for trader {trader_id}", trader.strategy_id))?;

        let adapter = Arc::new(ExchangeAdapter::new(&trader.api_key, &trader.api_secret, trader.exchange_kind));
        let llm = Arc::new(LlmClient::new(self.llm_base_url.clone(), self.llm_api_key.clone()));

        let engine = Engine::new(
            trader.id,
            trader.strategy_id,
            trader.initial_balance,
            adapter,
            llm,
            self.store.clone(),
            self.hub.clone(),
        );

        match engine.start(strategy).await {
            Ok(()) => {
                self.engines.write().insert(trader_id, engine);
                self.persist_status(trader, TraderStatus::Running).await;
                info!(trader_id = %trader_id, "trader started");
                Ok(())
            }
            Err(err) => {
                warn!(trader_id = %trader_id, error = %err, "trader start pre-flight failed");
                self.persist_status(trader, TraderStatus::Error).await;
                Err(err)
            }
        }
    }

    /// Stop the given trader's Engine; signals the loop and lets the
    /// in-flight cycle finish before dropping the registry entry (no hard
    /// kill).
    pub async fn stop(&self, trader_id: Uuid) -> Result<()> {
        let engine = self.engines.write().remove(&trader_id);
        if let Some(engine) = engine {
            engine.stop();
        }
        if let Some(trader) = self.find_trader(trader_id).await? {
            self.persist_status(trader, TraderStatus::Stopped).await;
        }
        Ok(())
    }

    /// Stop every running trader. Used on graceful shutdown.
    pub async fn stop_all(&self) {
        let ids: Vec<Uuid> = self.engines.read().keys().copied().collect();
        for id in ids {
            if let Err(err) = self.stop(id).await {
                warn!(trader_id = %id, error = %err, "failed to stop trader during shutdown");
            }
        }
    }

    pub fn is_running(&self, trader_id: Uuid) -> bool {
        self.engines
            .read()
            .get(&trader_id)
            .map(|e| e.is_running())
            .unwrap_or(false)
    }

    pub fn status(&self, trader_id: Uuid) -> Option<TraderStatus> {
        self.engines.read().get(&trader_id).map(|e| e.status())
    }

    pub fn last_error(&self, trader_id: Uuid) -> Option<String> {
        self.engines.read().get(&trader_id).and_then(|e| e.last_error())
    }

    pub fn positions(&self, trader_id: Uuid) -> Vec<Position> {
        self.engines
            .read()
            .get(&trader_id)
            .map(|e| e.get_positions())
            .unwrap_or_default()
    }

    pub fn running_ids(&self) -> Vec<Uuid> {
        self.engines.read().keys().copied().collect()
    }

    async fn persist_status(&self, mut trader: TraderRecord, status: TraderStatus) {
        trader.status = status;
        if let Err(err) = self.store.save_trader(&trader).await {
            warn!(trader_id = %trader.id, error = %err, "failed to persist trader status");
        }
    }

    async fn find_trader(&self, trader_id: Uuid) -> Result<Option<TraderRecord>> {
        self.store.get_trader(trader_id).await
    }
}
