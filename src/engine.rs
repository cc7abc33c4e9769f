// =============================================================================
// Trader Engine — the per-trader cooperative scheduler (spec §4.1)
// =============================================================================
//
// One Engine owns one driver task running the cycle loop. Phases 1-7 of a
// cycle are totally ordered; per-phase failures are isolated so the cycle
// continues (spec §5, §7). Hot reload re-reads the Strategy from
// persistence at the top of every cycle and swaps the in-memory pointer
// before phase 1 — no shared mutable strategy object survives the cycle
// boundary (spec §9).
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};

use crate::decision::pipeline::make_decision;
use crate::decision::prompt::PromptContext;
use crate::decision::types::Decision;
use crate::events::{EventHub, HubEvent};
use crate::exchange::adapter::ExchangeAdapter;
use crate::llm::client::{LlmClient, LlmMessage, LlmRequest};
use crate::persistence::store::{DecisionRecord, EquityRecord, Store, TradeRecord};
use crate::position::{Position, PositionManager};
use crate::risk::circuit::{GateDecision, RiskEngine};
use crate::risk::overrides::{
    apply_noise_zone, evaluate_position_overrides, resolve_anti_hedge, should_arm_trailing_stop,
    AntiHedgeDecision, OverrideOutcome,
};
use crate::risk::validator::{validate_decision, ValidationConfig};
use crate::strategy_config::{CoinSource, Strategy};
use crate::types::{estimate_liquidation_price, Action, ExchangeKind, Side, TraderStatus};

/// Small fixed backoff between per-symbol LLM calls within one cycle, to
/// respect rate limits (spec §4.1 step 5).
const PER_SYMBOL_BACKOFF: Duration = Duration::from_millis(500);

/// How often the "active risk features" log line may be emitted per trader
/// (spec §4.1 "A log line ... is emitted at most once per minute").
const RISK_LOG_INTERVAL: chrono::Duration = chrono::Duration::seconds(60);

/// Runtime-only state for one running trader (spec §3 Engine).
pub struct Engine {
    pub trader_id: uuid::Uuid,
    strategy_id: uuid::Uuid,
    adapter: Arc<ExchangeAdapter>,
    llm: Arc<LlmClient>,
    store: Store,
    hub: EventHub,
    positions: Arc<PositionManager>,
    risk_engine: Arc<RiskEngine>,
    status: RwLock<TraderStatus>,
    stop_tx: watch::Sender<bool>,
    cycle_index: AtomicU64,
    last_error: RwLock<Option<String>>,
    last_risk_log: RwLock<Option<chrono::DateTime<Utc>>>,
    smart_find_last_refresh: RwLock<Option<chrono::DateTime<Utc>>>,
}

impl Engine {
    pub fn new(
        trader_id: uuid::Uuid,
        strategy_id: uuid::Uuid,
        initial_balance: f64,
        adapter: Arc<ExchangeAdapter>,
        llm: Arc<LlmClient>,
        store: Store,
        hub: EventHub,
    ) -> Arc<Self> {
        let (stop_tx, _stop_rx) = watch::channel(false);
        Arc::new(Self {
            trader_id,
            strategy_id,
            adapter,
            llm,
            store,
            hub,
            positions: Arc::new(PositionManager::new()),
            risk_engine: Arc::new(RiskEngine::new(initial_balance)),
            status: RwLock::new(TraderStatus::Stopped),
            stop_tx,
            cycle_index: AtomicU64::new(0),
            last_error: RwLock::new(None),
            last_risk_log: RwLock::new(None),
            smart_find_last_refresh: RwLock::new(None),
        })
    }

    pub fn is_running(&self) -> bool {
        *self.status.read() == TraderStatus::Running
    }

    pub fn status(&self) -> TraderStatus {
        *self.status.read()
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    pub fn get_positions(&self) -> Vec<Position> {
        self.positions.get_open_positions()
    }

    /// Idempotently transition to running: verify exchange connectivity,
    /// set leverage for each configured pair, spawn the cycle loop.
    #[instrument(skip(self, strategy), fields(trader_id = %self.trader_id))]
    pub async fn start(self: &Arc<Self>, strategy: Strategy) -> anyhow::Result<()> {
        if self.is_running() {
            return Ok(());
        }

        if let Err(err) = self.adapter.sync_server_time().await {
            *self.status.write() = TraderStatus::Error;
            *self.last_error.write() = Some(err.to_string());
            return Err(err);
        }

        for symbol in strategy.config.coin_source.symbols() {
            if let Err(err) = self.adapter.set_leverage(symbol, 5).await {
                warn!(symbol, error = %err, "failed to set initial leverage, continuing");
            }
        }

        match self.store.list_open_positions(self.trader_id).await {
            Ok(positions) => {
                for pos in positions {
                    self.positions.open_position(pos);
                }
            }
            Err(err) => warn!(error = %err, "failed to reload open positions from store"),
        }

        *self.status.write() = TraderStatus::Running;
        *self.last_error.write() = None;

        let engine = self.clone();
        let mut stop_rx = self.stop_tx.subscribe();
        tokio::spawn(async move {
            // First cycle runs immediately on Start (spec §4.1).
            engine.run_one_cycle().await;

            loop {
                let interval_secs = engine.current_interval_secs().await;
                let sleep = tokio::time::sleep(Duration::from_secs(interval_secs));
                tokio::select! {
                    _ = sleep => {
                        engine.run_one_cycle().await;
                    }
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            *engine.status.write() = TraderStatus::Stopped;
            info!(trader_id = %engine.trader_id, "engine loop stopped");
        });

        Ok(())
    }

    /// Signal the loop to stop; the in-flight cycle finishes (no hard kill).
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    async fn current_interval_secs(&self) -> u64 {
        match self.store.get_strategy(self.strategy_id).await {
            Ok(Some(s)) => (s.config.trading_interval_minutes as u64 * 60).max(1),
            _ => 900,
        }
    }

    #[instrument(skip(self), fields(trader_id = %self.trader_id))]
    async fn run_one_cycle(self: &Arc<Self>) {
        let cycle_index = self.cycle_index.fetch_add(1, Ordering::SeqCst);

        // Hot reload: re-read the Strategy before phase 1 (spec §4.1, §9).
        let strategy = match self.store.get_strategy(self.strategy_id).await {
            Ok(Some(s)) => s,
            Ok(None) => {
                error!("strategy not found, skipping cycle");
                return;
            }
            Err(err) => {
                error!(error = %err, "failed to load strategy, skipping cycle");
                return;
            }
        };

        self.log_active_risk_features(&strategy);

        // Phase 1: refresh account + positions, persist an equity snapshot.
        let equity = match self.adapter.get_total_equity().await {
            Ok(e) => e,
            Err(err) => {
                warn!(error = %err, "phase 1: failed to refresh account equity");
                return;
            }
        };
        self.persist_equity_snapshot(equity, cycle_index).await;

        // Phase 2/3: emergency shutdown + daily loss gates.
        let gate = self.risk_engine.evaluate_gates(equity, &strategy.config.risk);
        match gate {
            GateDecision::EmergencyStop => {
                *self.status.write() = TraderStatus::Error;
                *self.last_error.write() = Some("emergency shutdown: equity below floor".to_string());
                return;
            }
            GateDecision::SuppressOpens { close_positions } => {
                if close_positions {
                    self.close_all_positions("daily_loss_gate").await;
                }
            }
            GateDecision::Proceed => {}
        }
        let opens_suppressed = matches!(gate, GateDecision::SuppressOpens { .. });

        // Phase 4: SmartFind auto-refresh (optional).
        let active_symbols = self.maybe_refresh_smart_find(&strategy).await;

        // Phase 6 prep: update peak-PnL and arm trailing stop for every open
        // position before evaluating overrides or honoring LLM closes.
        self.refresh_position_marks(&strategy).await;

        // Phase 5: per-symbol analysis.
        for symbol in &active_symbols {
            if let Err(err) = self.analyze_symbol(&strategy, symbol, equity, cycle_index, opens_suppressed).await {
                warn!(symbol, error = %err, "phase 5: per-symbol analysis failed, continuing");
            }
            tokio::time::sleep(PER_SYMBOL_BACKOFF).await;
        }

        // Phase 6: risk overrides on every still-open position.
        self.apply_risk_overrides(&strategy, cycle_index).await;
    }

    fn log_active_risk_features(&self, strategy: &Strategy) {
        let mut last = self.last_risk_log.write();
        let now = Utc::now();
        if let Some(prev) = *last {
            if now - prev < RISK_LOG_INTERVAL {
                return;
            }
        }
        *last = Some(now);
        let r = &strategy.config.risk;
        info!(
            trailing_stop = r.trailing_stop_enabled,
            drawdown_close = r.drawdown_close_enabled,
            smart_loss_cut = r.smart_loss_cut_enabled,
            emergency_shutdown = r.emergency_shutdown_enabled,
            simple_mode = strategy.config.simple_mode,
            "active risk features"
        );
    }

    async fn persist_equity_snapshot(&self, equity: f64, cycle_index: u64) {
        let state = self.risk_engine.snapshot();
        let drawdown_pct = if state.max_equity > 0.0 {
            (state.max_equity - equity) / state.max_equity * 100.0
        } else {
            0.0
        };
        let pnl = equity - state.day_start_equity;
        let pnl_pct = if state.day_start_equity > 0.0 {
            pnl / state.day_start_equity * 100.0
        } else {
            0.0
        };

        let rec = EquityRecord {
            trader_id: self.trader_id,
            timestamp: Utc::now(),
            equity,
            available: equity,
            pnl,
            pnl_pct,
            drawdown_pct,
            cycle_index,
        };
        if let Err(err) = self.store.append_equity_snapshot(rec).await {
            warn!(error = %err, "failed to persist equity snapshot");
        }
    }

    async fn maybe_refresh_smart_find(&self, strategy: &Strategy) -> Vec<String> {
        let cfg = &strategy.config;
        let static_symbols = cfg.coin_source.symbols().to_vec();

        if !(cfg.turbo_mode && cfg.smart_find.auto_refresh_enabled) {
            return static_symbols;
        }

        let should_refresh = {
            let last = *self.smart_find_last_refresh.read();
            match last {
                Some(t) => Utc::now() - t >= chrono::Duration::minutes(cfg.smart_find.refresh_mins as i64),
                None => true,
            }
        };
        if !should_refresh {
            return static_symbols;
        }

        match self.adapter.get_24hr_tickers().await {
            Ok(tickers) => {
                let limit = (strategy.config.risk.max_positions as usize) * 2;
                // Pre-filter/sort a wider pool than the final limit so the
                // LLM has real choices to make rather than rubber-stamping
                // an already-truncated list.
                let pool = crate::market_data::select_smart_find_candidates(
                    &tickers,
                    cfg.smart_find.aggressive,
                    limit.max(1) * 3,
                );
                *self.smart_find_last_refresh.write() = Some(Utc::now());
                if pool.is_empty() {
                    return static_symbols;
                }

                // Spec §4.1 step 4: call the LLM with a specialized prompt
                // to propose the final 2×MaxPositions symbols from the pool.
                let prompt = crate::market_data::build_smart_find_prompt(&pool, limit);
                let request = LlmRequest {
                    model: strategy.config.ai.decision_model.clone(),
                    messages: vec![
                        LlmMessage::system(
                            "You are a futures-market symbol screener. Propose only symbols \
                             drawn from the candidate list you are given.",
                        ),
                        LlmMessage::user(prompt),
                    ],
                    temperature: 0.2,
                    max_tokens: 256,
                    stream: false,
                };

                match self.llm.complete(&request).await {
                    Ok(response) => crate::market_data::parse_smart_find_response(&response.content, &pool, limit),
                    Err(err) => {
                        warn!(error = %err, "phase 4: smart-find LLM call failed, falling back to sorted pool");
                        pool.into_iter().take(limit).collect()
                    }
                }
            }
            Err(err) => {
                warn!(error = %err, "phase 4: smart-find refresh failed, keeping existing symbols");
                static_symbols
            }
        }
    }

    async fn refresh_position_marks(&self, strategy: &Strategy) {
        for mut pos in self.positions.get_open_positions() {
            let mark = self.adapter.get_price(&pos.symbol).await.unwrap_or(pos.entry_price);
            pos.update_peak(mark);
            pos.trailing_stop_armed = should_arm_trailing_stop(&pos, mark, &strategy.config.risk);
            self.positions.update_position(pos);
        }
    }

    #[instrument(skip(self, strategy), fields(trader_id = %self.trader_id, symbol))]
    async fn analyze_symbol(
        &self,
        strategy: &Strategy,
        symbol: &str,
        equity: f64,
        cycle_index: u64,
        opens_suppressed: bool,
    ) -> anyhow::Result<()> {
        let market_data = crate::market_data::fetch_symbol_market_data(
            &self.adapter,
            symbol,
            &strategy.config.indicators,
        )
        .await?;

        let open_positions = self.positions.get_open_positions();
        let ctx = PromptContext {
            cycle_index,
            account_equity: equity,
            available_balance: equity,
            trading_stats_summary: None,
            open_positions: &open_positions,
            recent_closed_summary: "(see persistence)",
            candidate_symbols: std::slice::from_ref(&symbol.to_string()),
            market_data: std::slice::from_ref(&market_data),
            max_positions: strategy.config.risk.max_positions,
        };

        let full_decision = make_decision(&self.llm, &strategy.config, &ctx).await?;

        for decision in &full_decision.decisions {
            self.handle_decision(strategy, decision, equity, cycle_index, opens_suppressed)
                .await;
        }

        Ok(())
    }

    async fn handle_decision(
        &self,
        strategy: &Strategy,
        decision: &Decision,
        equity: f64,
        cycle_index: u64,
        opens_suppressed: bool,
    ) {
        self.hub.publish(HubEvent::Decision {
            trader_id: self.trader_id,
            payload: serde_json::json!({
                "symbol": decision.symbol,
                "action": decision.action.to_string(),
                "confidence": decision.confidence,
            }),
        });

        let _ = self
            .store
            .append_decision(DecisionRecord {
                trader_id: self.trader_id,
                timestamp: Utc::now(),
                cycle_index,
                symbol: decision.symbol.clone(),
                action: decision.action.to_string(),
                confidence: decision.confidence,
                reasoning: decision.reasoning.clone(),
            })
            .await;

        if !decision.is_symbol_scope_valid() {
            warn!(symbol = %decision.symbol, action = %decision.action, "decision rejected: symbol/action scope invariant violated");
            return;
        }

        let existing = self.positions.get_open_position(&decision.symbol);

        // Noise Zone: rewrite low-confidence closes inside the dead zone.
        let action = if let Some(pos) = &existing {
            let mark = self.adapter.get_price(&pos.symbol).await.unwrap_or(pos.entry_price);
            apply_noise_zone(decision.action, pos.raw_pnl_pct(mark), decision.confidence, &strategy.config.risk)
        } else {
            decision.action
        };

        if action.is_opening() {
            if opens_suppressed {
                return;
            }

            let anti_hedge = resolve_anti_hedge(
                existing.as_ref().map(|p| p.side),
                action,
                strategy.config.simple_mode,
            );
            match anti_hedge {
                AntiHedgeDecision::Reject => return,
                AntiHedgeDecision::ReverseThenOpen => {
                    if let Some(pos) = existing {
                        self.close_position_at_market(&pos, "anti_hedge_reversal").await;
                    }
                }
                AntiHedgeDecision::Allow => {}
            }

            let validation_cfg = ValidationConfig {
                equity,
                min_risk_reward: strategy.config.risk.min_risk_reward,
            };
            if let Err(err) = validate_decision(decision, &validation_cfg) {
                warn!(symbol = %decision.symbol, error = %err, "decision rejected by validator");
                return;
            }

            self.open_position(decision, strategy).await;
        } else if action.is_closing() {
            if let Some(pos) = existing {
                self.close_position_at_market(&pos, "llm_close").await;
            }
        }
    }

    async fn open_position(&self, decision: &Decision, strategy: &Strategy) {
        let side = match decision.action {
            Action::OpenLong => Side::Long,
            Action::OpenShort => Side::Short,
            _ => return,
        };

        let price = self.adapter.get_price(&decision.symbol).await.unwrap_or(0.0);
        if price <= 0.0 {
            warn!(symbol = %decision.symbol, "skipping open: could not read mark price");
            return;
        }
        let quantity = self
            .adapter
            .precision
            .read()
            .round_quantity(&decision.symbol, decision.position_size_usd / price);

        if let Err(err) = self.adapter.set_leverage(&decision.symbol, decision.leverage as u32).await {
            warn!(symbol = %decision.symbol, error = %err, "failed to set leverage before opening");
        }

        let order_side = side.open_order_side();
        match self
            .adapter
            .place_order(&decision.symbol, order_side, "MARKET", quantity, None, false, false)
            .await
        {
            Ok(_) => {
                let margin = decision.position_size_usd / decision.leverage.max(1.0);
                let liquidation_price = estimate_liquidation_price(side, price, decision.leverage);
                let mut position = Position::open(
                    self.trader_id,
                    decision.symbol.clone(),
                    side,
                    price,
                    quantity,
                    decision.leverage,
                    margin,
                    liquidation_price,
                );
                position.trailing_stop_armed = should_arm_trailing_stop(
                    &position,
                    price,
                    &strategy.config.risk,
                );
                let trailing_stop_enabled = strategy.config.risk.trailing_stop_enabled;
                self.place_sl_tp_orders(&decision.symbol, side, quantity, decision, trailing_stop_enabled)
                    .await;
                if let Err(err) = self.store.upsert_position(&position).await {
                    warn!(symbol = %decision.symbol, error = %err, "failed to persist opened position");
                }
                self.positions.open_position(position);
            }
            Err(err) => {
                error!(symbol = %decision.symbol, error = %err, "exchange execution failed for open");
            }
        }
    }

    /// Place reduce-only SL/TP algo orders for a just-opened position (spec
    /// §4.1 step 7). When Trailing Stop is enabled the exchange-side TP is
    /// omitted — the engine owns TP via the trailing-stop override so the
    /// exchange can't close the position before the trailing logic fires
    /// (spec §9 "Ownership of stop-loss/take-profit").
    async fn place_sl_tp_orders(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
        decision: &Decision,
        trailing_stop_enabled: bool,
    ) {
        let closing_side = side.close_order_side();

        if let Err(err) = self
            .adapter
            .place_order(symbol, closing_side, "STOP_MARKET", quantity, Some(decision.stop_loss), true, false)
            .await
        {
            warn!(symbol, error = %err, "failed to place reduce-only stop-loss order");
        }

        if trailing_stop_enabled {
            return;
        }

        if let Err(err) = self
            .adapter
            .place_order(symbol, closing_side, "TAKE_PROFIT_MARKET", quantity, Some(decision.take_profit), true, false)
            .await
        {
            warn!(symbol, error = %err, "failed to place reduce-only take-profit order");
        }
    }

    async fn close_position_at_market(&self, pos: &Position, reason: &str) {
        match self.adapter.close_position(&pos.symbol, signed_quantity(pos)).await {
            Ok(_) => {
                if let Err(err) = self.adapter.cancel_all_open_orders(&pos.symbol).await {
                    warn!(symbol = %pos.symbol, error = %err, "failed to cancel residual SL/TP orders after close");
                }
                let mark = self.adapter.get_price(&pos.symbol).await.unwrap_or(pos.entry_price);
                let realized_pnl = realized_pnl(pos, mark);
                self.risk_engine.record_trade_outcome(realized_pnl);
                if let Some(closed) = self.positions.close_position(pos.id) {
                    if let Err(err) = self.store.upsert_position(&closed).await {
                        warn!(symbol = %pos.symbol, error = %err, "failed to persist closed position");
                    }
                }

                let _ = self
                    .store
                    .append_trade(TradeRecord {
                        trader_id: self.trader_id,
                        timestamp: Utc::now(),
                        symbol: pos.symbol.clone(),
                        action: "close".to_string(),
                        side: pos.side.to_string(),
                        quantity: pos.quantity,
                        price: mark,
                        fee: 0.0,
                        realized_pnl,
                        leverage: pos.leverage,
                        cycle_index: self.cycle_index.load(Ordering::SeqCst),
                        liquidation: false,
                        note: reason.to_string(),
                    })
                    .await;

                self.hub.publish(HubEvent::Trade {
                    trader_id: self.trader_id,
                    payload: serde_json::json!({
                        "symbol": pos.symbol,
                        "reason": reason,
                        "realized_pnl": realized_pnl,
                    }),
                });
            }
            Err(err) => {
                error!(symbol = %pos.symbol, error = %err, "exchange execution failed for close");
            }
        }
    }

    async fn close_all_positions(&self, reason: &str) {
        for pos in self.positions.get_open_positions() {
            self.close_position_at_market(&pos, reason).await;
        }
    }

    async fn apply_risk_overrides(&self, strategy: &Strategy, _cycle_index: u64) {
        for pos in self.positions.get_open_positions() {
            let mark = self.adapter.get_price(&pos.symbol).await.unwrap_or(pos.entry_price);
            let outcome = evaluate_position_overrides(&pos, mark, &strategy.config.risk);
            if let OverrideOutcome::Close(reason) = outcome {
                self.close_position_at_market(&pos, &reason.to_string()).await;
            }
        }
    }
}

fn signed_quantity(pos: &Position) -> f64 {
    match pos.side {
        Side::Long => pos.quantity,
        Side::Short => -pos.quantity,
    }
}

/// realizedPnL(longClose) = (exit-entry)*qty; for short, (entry-exit)*qty
/// (spec §8 testable property 2).
fn realized_pnl(pos: &Position, exit_price: f64) -> f64 {
    match pos.side {
        Side::Long => (exit_price - pos.entry_price) * pos.quantity,
        Side::Short => (pos.entry_price - exit_price) * pos.quantity,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn realized_pnl_matches_scenario_s4() {
        let pos = Position::open(uuid::Uuid::new_v4(), "BTCUSDT", Side::Short, 50000.0, 0.5, 10.0, 2500.0, 55000.0);
        let pnl = realized_pnl(&pos, 49000.0);
        assert!((pnl - 500.0).abs() < 1e-9);
    }

    #[test]
    fn signed_quantity_flips_for_short() {
        let long = Position::open(uuid::Uuid::new_v4(), "BTCUSDT", Side::Long, 50000.0, 1.0, 10.0, 5000.0, 45000.0);
        let short = Position::open(uuid::Uuid::new_v4(), "BTCUSDT", Side::Short, 50000.0, 1.0, 10.0, 5000.0, 55000.0);
        assert_eq!(signed_quantity(&long), 1.0);
        assert_eq!(signed_quantity(&short), -1.0);
    }
}
