// =============================================================================
// Account-level circuit breaker (spec §4.1 steps 2-3)
// =============================================================================
//
// Distinct from the per-position overrides in `overrides.rs`: this layer
// looks at the whole account (equity, consecutive losses, drawdown, daily
// trade count) and can suppress *all* opens for a trader, independent of
// what any individual position's rawPnL% is doing.
// =============================================================================

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::strategy_config::RiskControlConfig;

/// Snapshot of one circuit breaker's armed/tripped state, for the API/UI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerInfo {
    pub name: String,
    pub tripped: bool,
    pub detail: String,
}

/// Point-in-time readout of the account risk state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskState {
    pub day_start_equity: f64,
    pub current_equity: f64,
    pub max_equity: f64,
    pub consecutive_losses: u32,
    pub daily_trade_count: u32,
    pub trading_suspended_until: Option<DateTime<Utc>>,
    pub emergency_stopped: bool,
}

struct Inner {
    day_start_equity: f64,
    day_started_at: DateTime<Utc>,
    current_equity: f64,
    max_equity: f64,
    consecutive_losses: u32,
    daily_trade_count: u32,
    trading_suspended_until: Option<DateTime<Utc>>,
    emergency_stopped: bool,
}

/// The account-level circuit breaker for one trader. One instance lives
/// inside the trader's Engine for its whole running lifetime.
pub struct RiskEngine {
    inner: RwLock<Inner>,
}

/// What phase 2/3 of the cycle should do this tick, decided by the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    /// Normal trading; no gate is active.
    Proceed,
    /// Emergency shutdown: skip all trading this cycle, mark status=error.
    EmergencyStop,
    /// Daily loss gate: suppress opens, optionally close all positions.
    SuppressOpens { close_positions: bool },
}

impl RiskEngine {
    pub fn new(initial_balance: f64) -> Self {
        Self {
            inner: RwLock::new(Inner {
                day_start_equity: initial_balance,
                day_started_at: now(),
                current_equity: initial_balance,
                max_equity: initial_balance,
                consecutive_losses: 0,
                daily_trade_count: 0,
                trading_suspended_until: None,
                emergency_stopped: false,
            }),
        }
    }

    /// Roll the day-start equity baseline forward if 24h have elapsed since
    /// it was last set (the daily loss gate compares against "today").
    fn maybe_roll_day(&self, inner: &mut Inner, current_equity: f64) {
        if now() - inner.day_started_at >= chrono::Duration::hours(24) {
            inner.day_start_equity = current_equity;
            inner.day_started_at = now();
            inner.daily_trade_count = 0;
        }
    }

    /// Phase 1/2/3 of the cycle: feed in the freshly-refreshed equity and
    /// get back what phase 2/3 should do this cycle.
    pub fn evaluate_gates(&self, equity: f64, cfg: &RiskControlConfig) -> GateDecision {
        let mut inner = self.inner.write();
        self.maybe_roll_day(&mut inner, equity);
        inner.current_equity = equity;

        if equity > inner.max_equity {
            inner.max_equity = equity;
        }

        if cfg.emergency_shutdown_enabled && equity < cfg.emergency_min_balance {
            inner.emergency_stopped = true;
            warn!(equity, floor = cfg.emergency_min_balance, "emergency shutdown gate tripped");
            return GateDecision::EmergencyStop;
        }

        if let Some(until) = inner.trading_suspended_until {
            if now() < until {
                return GateDecision::SuppressOpens {
                    close_positions: cfg.close_positions_on_daily_loss,
                };
            }
            inner.trading_suspended_until = None;
        }

        if inner.day_start_equity > 0.0 {
            let loss_pct = (inner.day_start_equity - equity) / inner.day_start_equity * 100.0;
            if loss_pct >= cfg.max_daily_loss_pct {
                let until = now() + chrono::Duration::minutes(cfg.stop_trading_mins as i64);
                inner.trading_suspended_until = Some(until);
                warn!(loss_pct, limit = cfg.max_daily_loss_pct, "daily loss gate tripped");
                return GateDecision::SuppressOpens {
                    close_positions: cfg.close_positions_on_daily_loss,
                };
            }
        }

        if inner.consecutive_losses >= cfg.max_consecutive_losses {
            return GateDecision::SuppressOpens { close_positions: false };
        }

        let drawdown_pct = if inner.max_equity > 0.0 {
            (inner.max_equity - equity) / inner.max_equity * 100.0
        } else {
            0.0
        };
        if drawdown_pct >= cfg.max_drawdown_pct {
            return GateDecision::SuppressOpens { close_positions: false };
        }

        if inner.daily_trade_count >= cfg.max_daily_trades {
            return GateDecision::SuppressOpens { close_positions: false };
        }

        GateDecision::Proceed
    }

    /// Record the realized outcome of a closed trade (win resets the streak,
    /// loss extends it) and bump the daily trade counter.
    pub fn record_trade_outcome(&self, realized_pnl: f64) {
        let mut inner = self.inner.write();
        inner.daily_trade_count += 1;
        if realized_pnl < 0.0 {
            inner.consecutive_losses += 1;
        } else {
            inner.consecutive_losses = 0;
        }
    }

    pub fn snapshot(&self) -> RiskState {
        let inner = self.inner.read();
        RiskState {
            day_start_equity: inner.day_start_equity,
            current_equity: inner.current_equity,
            max_equity: inner.max_equity,
            consecutive_losses: inner.consecutive_losses,
            daily_trade_count: inner.daily_trade_count,
            trading_suspended_until: inner.trading_suspended_until,
            emergency_stopped: inner.emergency_stopped,
        }
    }

    pub fn breakers(&self, cfg: &RiskControlConfig) -> Vec<CircuitBreakerInfo> {
        let inner = self.inner.read();
        vec![
            CircuitBreakerInfo {
                name: "emergency_shutdown".to_string(),
                tripped: inner.emergency_stopped,
                detail: format!("floor={}", cfg.emergency_min_balance),
            },
            CircuitBreakerInfo {
                name: "daily_loss".to_string(),
                tripped: inner.trading_suspended_until.is_some(),
                detail: format!("limit_pct={}", cfg.max_daily_loss_pct),
            },
            CircuitBreakerInfo {
                name: "consecutive_losses".to_string(),
                tripped: inner.consecutive_losses >= cfg.max_consecutive_losses,
                detail: format!("{}/{}", inner.consecutive_losses, cfg.max_consecutive_losses),
            },
        ]
    }
}

fn now() -> DateTime<Utc> {
    Utc::now()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> RiskControlConfig {
        crate::strategy_config::StrategyConfig::default().risk
    }

    #[test]
    fn proceeds_when_healthy() {
        let engine = RiskEngine::new(1000.0);
        assert_eq!(engine.evaluate_gates(1000.0, &cfg()), GateDecision::Proceed);
    }

    #[test]
    fn emergency_stop_below_floor() {
        let engine = RiskEngine::new(1000.0);
        let mut c = cfg();
        c.emergency_min_balance = 500.0;
        assert_eq!(engine.evaluate_gates(400.0, &c), GateDecision::EmergencyStop);
    }

    #[test]
    fn daily_loss_gate_suppresses_opens() {
        let engine = RiskEngine::new(1000.0);
        let mut c = cfg();
        c.max_daily_loss_pct = 5.0;
        c.close_positions_on_daily_loss = true;
        let decision = engine.evaluate_gates(940.0, &c);
        assert_eq!(
            decision,
            GateDecision::SuppressOpens { close_positions: true }
        );
    }

    #[test]
    fn consecutive_losses_trip_breaker() {
        let engine = RiskEngine::new(1000.0);
        let mut c = cfg();
        c.max_consecutive_losses = 2;
        engine.record_trade_outcome(-10.0);
        engine.record_trade_outcome(-10.0);
        assert_eq!(
            engine.evaluate_gates(1000.0, &c),
            GateDecision::SuppressOpens { close_positions: false }
        );
    }

    #[test]
    fn winning_trade_resets_loss_streak() {
        let engine = RiskEngine::new(1000.0);
        engine.record_trade_outcome(-10.0);
        engine.record_trade_outcome(5.0);
        assert_eq!(engine.snapshot().consecutive_losses, 0);
    }
}
