// =============================================================================
// Live trading statistics (spec §2 row E, §11) — CalculateMetrics reused
// =============================================================================
//
// Reuses `backtest::metrics::calculate_metrics` so a trader's live win-rate
// and Sharpe are computed the same way a backtest's are; this module only
// adapts stored `TradeRecord`/`EquityRecord` rows into that function's
// input shape and adds the streak counters a live dashboard wants.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::backtest::metrics::{calculate_metrics, Metrics, TradeOutcome};
use crate::persistence::store::{EquityRecord, TradeRecord};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingStats {
    pub metrics: Metrics,
    pub current_win_streak: u32,
    pub current_loss_streak: u32,
}

/// Aggregate a trader's full trade/equity history into `TradingStats`.
/// `trades` and `equity` should both be ordered ascending by timestamp.
pub fn aggregate_trading_stats(trades: &[TradeRecord], equity: &[EquityRecord]) -> TradingStats {
    let mut symbols: Vec<String> = Vec::new();
    let mut outcomes = Vec::with_capacity(trades.len());

    for t in trades {
        let symbol_index = match symbols.iter().position(|s| s == &t.symbol) {
            Some(i) => i,
            None => {
                symbols.push(t.symbol.clone());
                symbols.len() - 1
            }
        };
        outcomes.push(TradeOutcome {
            symbol_index,
            realized_pnl: t.realized_pnl,
            fee: t.fee,
        });
    }

    let equity_curve: Vec<f64> = equity.iter().map(|e| e.equity).collect();
    let (metrics, _per_symbol) = calculate_metrics(&outcomes, &equity_curve, &symbols);

    let (current_win_streak, current_loss_streak) = trailing_streaks(trades);

    TradingStats {
        metrics,
        current_win_streak,
        current_loss_streak,
    }
}

/// Walk the trade history backwards from the most recent trade and count
/// the current unbroken win or loss streak.
fn trailing_streaks(trades: &[TradeRecord]) -> (u32, u32) {
    let mut win_streak = 0;
    let mut loss_streak = 0;

    for t in trades.iter().rev() {
        if t.realized_pnl > 0.0 {
            if loss_streak > 0 {
                break;
            }
            win_streak += 1;
        } else if t.realized_pnl < 0.0 {
            if win_streak > 0 {
                break;
            }
            loss_streak += 1;
        } else {
            break;
        }
    }

    (win_streak, loss_streak)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn trade(pnl: f64) -> TradeRecord {
        TradeRecord {
            trader_id: uuid::Uuid::new_v4(),
            timestamp: Utc::now(),
            symbol: "BTCUSDT".to_string(),
            action: "close_long".to_string(),
            side: "long".to_string(),
            quantity: 0.1,
            price: 50000.0,
            fee: 0.5,
            realized_pnl: pnl,
            leverage: 10.0,
            cycle_index: 0,
            liquidation: false,
            note: String::new(),
        }
    }

    #[test]
    fn trailing_win_streak_counts_only_most_recent_run() {
        let trades = vec![trade(-10.0), trade(5.0), trade(5.0), trade(5.0)];
        let (win, loss) = trailing_streaks(&trades);
        assert_eq!(win, 3);
        assert_eq!(loss, 0);
    }

    #[test]
    fn trailing_loss_streak_counts_only_most_recent_run() {
        let trades = vec![trade(5.0), trade(-5.0), trade(-5.0)];
        let (win, loss) = trailing_streaks(&trades);
        assert_eq!(win, 0);
        assert_eq!(loss, 2);
    }

    #[test]
    fn aggregate_stats_reuses_shared_metrics_function() {
        let trades = vec![trade(100.0), trade(-50.0)];
        let equity = vec![];
        let stats = aggregate_trading_stats(&trades, &equity);
        assert_eq!(stats.metrics.total_trades, 2);
        assert!((stats.metrics.win_rate_pct - 50.0).abs() < 1e-9);
    }
}
