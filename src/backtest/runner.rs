// =============================================================================
// Backtest Runner — deterministic replay of the Decision Pipeline over
// pre-loaded historical candles against a simulated account.
// =============================================================================
//
// The loop below is the one place in the codebase allowed to diverge from
// the live Engine's cycle: it replaces step A (live market data) with
// stored candles and step D (the real Exchange Adapter) with
// `SimulatedAccount`, but calls `make_decision` — step C — exactly as the
// Engine does, so a strategy behaves identically whether it is live or being
// replayed. Reusing step C verbatim is the key invariant that keeps a
// backtest's win-rate meaningful.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock as SyncRwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::backtest::account::SimulatedAccount;
use crate::backtest::metrics::{calculate_metrics, Metrics, PerSymbolStats, TradeOutcome};
use crate::decision::pipeline::make_decision;
use crate::decision::prompt::PromptContext;
use crate::decision::types::{Decision, FullDecision};
use crate::llm::client::LlmClient;
use crate::market_data::{compute_indicators, Candle, SymbolMarketData};
use crate::position::Position;
use crate::strategy_config::StrategyConfig;
use crate::types::{Action, Side};

/// How a bar's fill price is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FillPolicy {
    NextOpen,
    BarVwap,
    Mid,
    Close,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestConfig {
    pub symbols: Vec<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub initial_balance: f64,
    pub fee_bps: f64,
    pub slippage_bps: f64,
    pub fill_policy: FillPolicy,
    pub decision_cadence_bars: u64,
    pub max_leverage: f64,
    pub max_position_fraction: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BacktestStatus {
    Pending,
    Running,
    Completed,
    Liquidated,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EquityPoint {
    pub timestamp: DateTime<Utc>,
    pub equity: f64,
    pub drawdown_pct: f64,
}

/// One cycle's decision log entry: prompts, raw response, reasoning,
/// duration, and any error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionLogEntry {
    pub bar_index: u64,
    pub timestamp: DateTime<Utc>,
    pub decision: Option<FullDecision>,
    pub error: Option<String>,
}

/// A backtest-side rendering of the spec §3 TradeEvent entity: append-only,
/// one per executed open/close/liquidation against the simulated account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestTradeEvent {
    pub timestamp: DateTime<Utc>,
    pub bar_index: u64,
    pub symbol: String,
    pub action: String,
    pub side: String,
    pub quantity: f64,
    pub price: f64,
    pub fee: f64,
    pub realized_pnl: f64,
    pub leverage: f64,
    pub liquidation: bool,
    pub note: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestReport {
    pub id: Uuid,
    pub status: BacktestStatus,
    pub equity_curve: Vec<EquityPoint>,
    pub decision_log: Vec<DecisionLogEntry>,
    pub trade_events: Vec<BacktestTradeEvent>,
    pub metrics: Option<Metrics>,
    pub per_symbol: HashMap<String, PerSymbolStats>,
    pub error: Option<String>,
}

struct TradedSymbol {
    realized: Vec<TradeOutcome>,
    index_of: HashMap<String, usize>,
    names: Vec<String>,
}

impl TradedSymbol {
    fn new() -> Self {
        Self { realized: Vec::new(), index_of: HashMap::new(), names: Vec::new() }
    }

    fn record(&mut self, symbol: &str, realized_pnl: f64, fee: f64) {
        let index = *self.index_of.entry(symbol.to_string()).or_insert_with(|| {
            self.names.push(symbol.to_string());
            self.names.len() - 1
        });
        self.realized.push(TradeOutcome { symbol_index: index, realized_pnl, fee });
    }
}

fn fill_price(candle: &Candle, next_open: Option<f64>, policy: FillPolicy) -> f64 {
    match policy {
        FillPolicy::NextOpen => next_open.unwrap_or(candle.close),
        FillPolicy::BarVwap if candle.volume > 0.0 && candle.quote_volume > 0.0 => {
            candle.quote_volume / candle.volume
        }
        FillPolicy::BarVwap => candle.close,
        FillPolicy::Mid => (candle.high + candle.low) / 2.0,
        FillPolicy::Close => candle.close,
    }
}

/// Handle to a running (or finished) backtest.
pub struct BacktestHandle {
    pub id: Uuid,
    cancel_tx: watch::Sender<bool>,
    state: Arc<SyncRwLock<BacktestReport>>,
}

impl BacktestHandle {
    pub fn snapshot(&self) -> BacktestReport {
        self.state.read().clone()
    }

    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }
}

/// Owns every in-flight and completed backtest run for this process.
pub struct BacktestManager {
    llm: Arc<LlmClient>,
    runs: SyncRwLock<HashMap<Uuid, Arc<BacktestHandle>>>,
}

impl BacktestManager {
    pub fn new(llm: Arc<LlmClient>) -> Arc<Self> {
        Arc::new(Self { llm, runs: SyncRwLock::new(HashMap::new()) })
    }

    pub fn start(
        self: &Arc<Self>,
        config: BacktestConfig,
        strategy: StrategyConfig,
        candles: HashMap<String, Vec<Candle>>,
    ) -> Uuid {
        let id = Uuid::new_v4();
        let report = BacktestReport {
            id,
            status: BacktestStatus::Pending,
            equity_curve: Vec::new(),
            decision_log: Vec::new(),
            trade_events: Vec::new(),
            metrics: None,
            per_symbol: HashMap::new(),
            error: None,
        };
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let state = Arc::new(SyncRwLock::new(report));
        let handle = Arc::new(BacktestHandle { id, cancel_tx, state: state.clone() });
        self.runs.write().insert(id, handle);

        let llm = self.llm.clone();
        tokio::spawn(run_backtest(llm, state, cancel_rx, id, config, strategy, candles));

        id
    }

    pub fn get(&self, id: Uuid) -> Option<BacktestReport> {
        self.runs.read().get(&id).map(|h| h.snapshot())
    }

    pub fn cancel(&self, id: Uuid) {
        if let Some(handle) = self.runs.read().get(&id) {
            handle.cancel();
        }
    }

    pub fn list(&self) -> Vec<BacktestReport> {
        self.runs.read().values().map(|h| h.snapshot()).collect()
    }
}

#[instrument(skip(llm, state, cancel_rx, strategy, candles), fields(run_id = %run_id))]
async fn run_backtest(
    llm: Arc<LlmClient>,
    state: Arc<SyncRwLock<BacktestReport>>,
    mut cancel_rx: watch::Receiver<bool>,
    run_id: Uuid,
    config: BacktestConfig,
    strategy: StrategyConfig,
    candles: HashMap<String, Vec<Candle>>,
) {
    state.write().status = BacktestStatus::Running;

    let Some(primary_symbol) = config
        .symbols
        .iter()
        .max_by_key(|s| candles.get(*s).map(|c| in_range_count(c, &config)).unwrap_or(0))
        .cloned()
    else {
        fail(&state, "no symbols configured");
        return;
    };
    let Some(primary_candles) = candles.get(&primary_symbol) else {
        fail(&state, "no candles for primary symbol");
        return;
    };

    let mut account = SimulatedAccount::new(config.initial_balance, config.fee_bps, config.slippage_bps);
    let mut traded = TradedSymbol::new();
    let mut cursors: HashMap<String, usize> = config.symbols.iter().map(|s| (s.clone(), 0)).collect();

    for (bar_index, primary_candle) in primary_candles.iter().enumerate() {
        if primary_candle.close_time < config.start.timestamp_millis()
            || primary_candle.close_time > config.end.timestamp_millis()
        {
            continue;
        }
        if *cancel_rx.borrow() {
            state.write().status = BacktestStatus::Cancelled;
            return;
        }

        let bar_timestamp = DateTime::from_timestamp_millis(primary_candle.close_time).unwrap_or_else(Utc::now);

        // Step 1: build the price map (latest close <= this bar's timestamp, per symbol).
        let mut marks: HashMap<String, f64> = HashMap::new();
        for symbol in &config.symbols {
            if let Some(series) = candles.get(symbol) {
                let cursor = cursors.entry(symbol.clone()).or_insert(0);
                while *cursor + 1 < series.len() && series[*cursor + 1].close_time <= primary_candle.close_time {
                    *cursor += 1;
                }
                if series[*cursor].close_time <= primary_candle.close_time {
                    marks.insert(symbol.clone(), series[*cursor].close);
                }
            }
        }

        // Step 2: liquidation check. Capture the position details (symbol
        // order fixed by `positions` being a `BTreeMap`) before they are
        // removed, so each liquidated position emits exactly one TradeEvent
        // with the liquidation flag set (spec §3, §8 scenario S5).
        let liquidation_events: Vec<BacktestTradeEvent> = account
            .positions
            .values()
            .filter(|p| marks.get(&p.symbol).is_some_and(|&mark| p.is_liquidated(mark)))
            .map(|p| {
                let mark = marks.get(&p.symbol).copied().unwrap_or(p.entry_price);
                BacktestTradeEvent {
                    timestamp: bar_timestamp,
                    bar_index: bar_index as u64,
                    symbol: p.symbol.clone(),
                    action: "liquidation".to_string(),
                    side: p.side.to_string(),
                    quantity: p.quantity,
                    price: mark,
                    fee: 0.0,
                    realized_pnl: -p.margin,
                    leverage: p.leverage,
                    liquidation: true,
                    note: "liquidated".to_string(),
                }
            })
            .collect();

        let liquidated = account.check_liquidations(&marks);
        if !liquidated.is_empty() {
            warn!(?liquidated, "backtest account liquidated");
            let equity = account.equity(&marks);
            account.update_high_water_mark(equity);
            let mut guard = state.write();
            guard.trade_events.extend(liquidation_events);
            guard.equity_curve.push(EquityPoint {
                timestamp: bar_timestamp,
                equity,
                drawdown_pct: account.drawdown_pct(equity),
            });
            guard.status = BacktestStatus::Liquidated;
            drop(guard);
            finalize(&state, &traded);
            return;
        }

        // Step 3: every N bars, invoke the shared Decision Pipeline.
        if config.decision_cadence_bars > 0 && bar_index as u64 % config.decision_cadence_bars == 0 {
            let open_positions: Vec<Position> = account
                .positions
                .values()
                .map(|p| {
                    Position::open(
                        run_id,
                        p.symbol.clone(),
                        p.side,
                        p.entry_price,
                        p.quantity,
                        p.leverage,
                        p.margin,
                        p.liquidation_price,
                    )
                })
                .collect();

            let market_data: Vec<SymbolMarketData> = config
                .symbols
                .iter()
                .filter_map(|symbol| {
                    let series = candles.get(symbol)?;
                    let cursor = *cursors.get(symbol)?;
                    let history = &series[..=cursor.min(series.len().saturating_sub(1))];
                    if history.is_empty() {
                        return None;
                    }
                    Some(SymbolMarketData {
                        symbol: symbol.clone(),
                        last_price: history.last()?.close,
                        indicators: compute_indicators(history, &strategy.indicators),
                        htf_indicators: None,
                    })
                })
                .collect();

            let equity_now = account.equity(&marks);
            let ctx = PromptContext {
                cycle_index: bar_index as u64,
                account_equity: equity_now,
                available_balance: account.cash,
                trading_stats_summary: None,
                open_positions: &open_positions,
                recent_closed_summary: "",
                candidate_symbols: &config.symbols,
                market_data: &market_data,
                max_positions: config.symbols.len() as u32,
            };

            match make_decision(&llm, &strategy, &ctx).await {
                Ok(full_decision) => {
                    // Step 4: execute closes before opens.
                    let mut decisions = full_decision.decisions.clone();
                    decisions.sort_by_key(|d| !d.action.is_closing());

                    let fills = build_fill_prices(&config, &candles, &cursors, config.fill_policy);
                    let mut new_events = Vec::new();
                    for decision in &decisions {
                        if let Some(event) =
                            apply_decision(&mut account, &mut traded, &config, decision, &fills, bar_timestamp, bar_index as u64)
                        {
                            new_events.push(event);
                        }
                    }

                    let mut guard = state.write();
                    guard.trade_events.extend(new_events);
                    guard.decision_log.push(DecisionLogEntry {
                        bar_index: bar_index as u64,
                        timestamp: bar_timestamp,
                        decision: Some(full_decision),
                        error: None,
                    });
                }
                Err(err) => {
                    state.write().decision_log.push(DecisionLogEntry {
                        bar_index: bar_index as u64,
                        timestamp: bar_timestamp,
                        decision: None,
                        error: Some(err.to_string()),
                    });
                }
            }
        }

        // Step 5: recompute equity, high-water mark, drawdown.
        let equity = account.equity(&marks);
        account.update_high_water_mark(equity);
        let drawdown_pct = account.drawdown_pct(equity);
        state.write().equity_curve.push(EquityPoint { timestamp: bar_timestamp, equity, drawdown_pct });
    }

    state.write().status = BacktestStatus::Completed;
    finalize(&state, &traded);
    info!("backtest run completed");
}

/// Build the per-symbol execution fill price for this bar under the
/// configured fill policy. Distinct from the
/// liquidation/equity mark price (always latest close): `next_open` peeks at
/// the following candle, `bar_vwap`/`mid` read the current candle's full
/// OHLCV, `close` matches the mark price exactly.
fn build_fill_prices(
    config: &BacktestConfig,
    candles: &HashMap<String, Vec<Candle>>,
    cursors: &HashMap<String, usize>,
    policy: FillPolicy,
) -> HashMap<String, f64> {
    let mut fills = HashMap::new();
    for symbol in &config.symbols {
        let Some(series) = candles.get(symbol) else { continue };
        let Some(&cursor) = cursors.get(symbol) else { continue };
        let Some(candle) = series.get(cursor) else { continue };
        let next_open = series.get(cursor + 1).map(|c| c.open);
        fills.insert(symbol.clone(), fill_price(candle, next_open, policy));
    }
    fills
}

fn in_range_count(candles: &[Candle], config: &BacktestConfig) -> usize {
    candles
        .iter()
        .filter(|c| c.close_time >= config.start.timestamp_millis() && c.close_time <= config.end.timestamp_millis())
        .count()
}

fn apply_decision(
    account: &mut SimulatedAccount,
    traded: &mut TradedSymbol,
    config: &BacktestConfig,
    decision: &Decision,
    fills: &HashMap<String, f64>,
    now: DateTime<Utc>,
    bar_index: u64,
) -> Option<BacktestTradeEvent> {
    if !decision.is_symbol_scope_valid() {
        return None;
    }
    let &price = fills.get(&decision.symbol)?;

    match decision.action {
        Action::OpenLong | Action::OpenShort => {
            if account.positions.contains_key(&decision.symbol) {
                return None;
            }
            let leverage = decision.leverage.min(config.max_leverage).max(1.0);
            let cap = account.cash * config.max_position_fraction;
            let notional = decision.position_size_usd.min(cap.max(0.0));
            if notional <= 0.0 || price <= 0.0 {
                return None;
            }
            let quantity = notional / price;
            let side = if decision.action == Action::OpenLong { Side::Long } else { Side::Short };
            let (fill_price, fee) = account.open_position(&decision.symbol, side, price, quantity, leverage, now);
            Some(BacktestTradeEvent {
                timestamp: now,
                bar_index,
                symbol: decision.symbol.clone(),
                action: decision.action.to_string(),
                side: side.to_string(),
                quantity,
                price: fill_price,
                fee,
                realized_pnl: 0.0,
                leverage,
                liquidation: false,
                note: String::new(),
            })
        }
        Action::CloseLong | Action::CloseShort => {
            let closing = account.positions.get(&decision.symbol).cloned()?;
            let (realized_pnl, fee) = account.close_position(&decision.symbol, price)?;
            traded.record(&decision.symbol, realized_pnl, fee);
            Some(BacktestTradeEvent {
                timestamp: now,
                bar_index,
                symbol: decision.symbol.clone(),
                action: decision.action.to_string(),
                side: closing.side.to_string(),
                quantity: closing.quantity,
                price,
                fee,
                realized_pnl,
                leverage: closing.leverage,
                liquidation: false,
                note: String::new(),
            })
        }
        Action::Hold | Action::Wait => None,
    }
}

fn finalize(state: &Arc<SyncRwLock<BacktestReport>>, traded: &TradedSymbol) {
    let equity_curve: Vec<f64> = state.read().equity_curve.iter().map(|p| p.equity).collect();
    let (metrics, per_symbol) = calculate_metrics(&traded.realized, &equity_curve, &traded.names);
    let mut guard = state.write();
    guard.metrics = Some(metrics);
    guard.per_symbol = per_symbol;
}

fn fail(state: &Arc<SyncRwLock<BacktestReport>>, message: &str) {
    let mut guard = state.write();
    guard.status = BacktestStatus::Failed;
    guard.error = Some(message.to_string());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BacktestConfig {
        BacktestConfig {
            symbols: vec!["BTCUSDT".to_string()],
            start: Utc::now(),
            end: Utc::now(),
            initial_balance: 10_000.0,
            fee_bps: 4.0,
            slippage_bps: 2.0,
            fill_policy: FillPolicy::Close,
            decision_cadence_bars: 1,
            max_leverage: 20.0,
            max_position_fraction: 0.5,
        }
    }

    fn decision(action: Action) -> Decision {
        Decision {
            symbol: "BTCUSDT".to_string(),
            action,
            confidence: 80,
            leverage: 10.0,
            position_size_usd: 1000.0,
            stop_loss: 49000.0,
            take_profit: 52000.0,
            reasoning: String::new(),
        }
    }

    #[test]
    fn opening_a_position_emits_a_non_liquidation_trade_event() {
        let mut account = SimulatedAccount::new(10_000.0, 4.0, 2.0);
        let mut traded = TradedSymbol::new();
        let fills = HashMap::from([("BTCUSDT".to_string(), 50_000.0)]);

        let event = apply_decision(&mut account, &mut traded, &config(), &decision(Action::OpenLong), &fills, Utc::now(), 0)
            .expect("open should emit a trade event");

        assert_eq!(event.action, "open_long");
        assert!(!event.liquidation);
        assert!(account.positions.contains_key("BTCUSDT"));
    }

    #[test]
    fn closing_a_position_emits_trade_event_with_realized_pnl() {
        let mut account = SimulatedAccount::new(10_000.0, 4.0, 2.0);
        let mut traded = TradedSymbol::new();
        account.open_position("BTCUSDT", Side::Long, 50_000.0, 0.02, 10.0, Utc::now());

        let fills = HashMap::from([("BTCUSDT".to_string(), 55_000.0)]);
        let event = apply_decision(&mut account, &mut traded, &config(), &decision(Action::CloseLong), &fills, Utc::now(), 1)
            .expect("close should emit a trade event");

        assert_eq!(event.action, "close_long");
        assert!(!event.liquidation);
        assert!(event.realized_pnl > 0.0);
        assert!(!account.positions.contains_key("BTCUSDT"));
    }

    #[test]
    fn liquidated_positions_are_iterated_in_deterministic_symbol_order() {
        let mut account = SimulatedAccount::new(10_000.0, 4.0, 2.0);
        account.open_position("ETHUSDT", Side::Long, 2_000.0, 1.0, 20.0, Utc::now());
        account.open_position("BTCUSDT", Side::Long, 50_000.0, 0.1, 20.0, Utc::now());

        let symbols: Vec<&String> = account.positions.keys().collect();
        assert_eq!(symbols, vec!["BTCUSDT", "ETHUSDT"], "BTreeMap iterates symbols in sorted order");
    }
}
