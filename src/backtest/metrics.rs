// =============================================================================
// CalculateMetrics — shared by Backtest Runner and live stats
// =============================================================================
//
// The same metrics function backs both the Backtest Runner's end-of-run
// report and the Persistence layer's live trading-statistics aggregate,
// so a trader's live win-rate and a backtest's win-rate are
// computed identically.
// =============================================================================

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One realized trade outcome, the minimal shape `calculate_metrics` needs.
#[derive(Debug, Clone, Copy)]
pub struct TradeOutcome {
    pub symbol_index: usize,
    pub realized_pnl: f64,
    pub fee: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PerSymbolStats {
    pub trade_count: u32,
    pub win_count: u32,
    pub total_pnl: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metrics {
    pub total_return_pct: f64,
    pub max_drawdown_pct: f64,
    pub sharpe: f64,
    pub sortino: f64,
    pub win_rate_pct: f64,
    pub profit_factor: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
    pub total_fees: f64,
    pub total_trades: u32,
}

/// Compute aggregate statistics over a realized trade-PnL sequence and an
/// equity curve. `symbols` names each `TradeOutcome::symbol_index` for the
/// per-symbol breakdown.
pub fn calculate_metrics(
    trades: &[TradeOutcome],
    equity_curve: &[f64],
    symbols: &[String],
) -> (Metrics, HashMap<String, PerSymbolStats>) {
    let total_fees: f64 = trades.iter().map(|t| t.fee).sum();
    let total_trades = trades.len() as u32;

    let wins: Vec<f64> = trades.iter().map(|t| t.realized_pnl).filter(|&p| p > 0.0).collect();
    let losses: Vec<f64> = trades.iter().map(|t| t.realized_pnl).filter(|&p| p < 0.0).collect();

    let win_rate_pct = if total_trades > 0 {
        wins.len() as f64 / total_trades as f64 * 100.0
    } else {
        0.0
    };

    let gross_profit: f64 = wins.iter().sum();
    let gross_loss: f64 = losses.iter().sum::<f64>().abs();
    let profit_factor = if gross_loss > 0.0 { gross_profit / gross_loss } else { 0.0 };

    let avg_win = if !wins.is_empty() { gross_profit / wins.len() as f64 } else { 0.0 };
    let avg_loss = if !losses.is_empty() { gross_loss / losses.len() as f64 } else { 0.0 };

    let pnls: Vec<f64> = trades.iter().map(|t| t.realized_pnl).collect();
    let sharpe = sharpe_ratio(&pnls);
    let sortino = sortino_ratio(&pnls);

    let total_return_pct = match (equity_curve.first(), equity_curve.last()) {
        (Some(&first), Some(&last)) if first > 0.0 => (last - first) / first * 100.0,
        _ => 0.0,
    };
    let max_drawdown_pct = max_drawdown(equity_curve);

    let mut per_symbol: HashMap<String, PerSymbolStats> = HashMap::new();
    for t in trades {
        let Some(symbol) = symbols.get(t.symbol_index) else {
            continue;
        };
        let entry = per_symbol.entry(symbol.clone()).or_default();
        entry.trade_count += 1;
        entry.total_pnl += t.realized_pnl;
        if t.realized_pnl > 0.0 {
            entry.win_count += 1;
        }
    }

    let metrics = Metrics {
        total_return_pct,
        max_drawdown_pct,
        sharpe,
        sortino,
        win_rate_pct,
        profit_factor,
        avg_win,
        avg_loss,
        total_fees,
        total_trades,
    };

    (metrics, per_symbol)
}

/// Sharpe ratio over per-trade PnL: mean/stddev. Zero when σ=0 or n<2.
fn sharpe_ratio(pnls: &[f64]) -> f64 {
    if pnls.len() < 2 {
        return 0.0;
    }
    let mean = pnls.iter().sum::<f64>() / pnls.len() as f64;
    let variance = pnls.iter().map(|p| (p - mean).powi(2)).sum::<f64>() / pnls.len() as f64;
    let std_dev = variance.sqrt();
    if std_dev == 0.0 {
        0.0
    } else {
        mean / std_dev
    }
}

/// Sortino ratio: mean over downside-only standard deviation.
fn sortino_ratio(pnls: &[f64]) -> f64 {
    if pnls.len() < 2 {
        return 0.0;
    }
    let mean = pnls.iter().sum::<f64>() / pnls.len() as f64;
    let downside: Vec<f64> = pnls.iter().filter(|&&p| p < 0.0).copied().collect();
    if downside.is_empty() {
        return 0.0;
    }
    let downside_variance = downside.iter().map(|p| p.powi(2)).sum::<f64>() / downside.len() as f64;
    let downside_dev = downside_variance.sqrt();
    if downside_dev == 0.0 {
        0.0
    } else {
        mean / downside_dev
    }
}

fn max_drawdown(equity_curve: &[f64]) -> f64 {
    let mut peak = f64::MIN;
    let mut max_dd = 0.0;
    for &equity in equity_curve {
        if equity > peak {
            peak = equity;
        }
        if peak > 0.0 {
            let dd = (peak - equity) / peak * 100.0;
            if dd > max_dd {
                max_dd = dd;
            }
        }
    }
    max_dd
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sharpe_is_zero_with_fewer_than_two_trades() {
        assert_eq!(sharpe_ratio(&[10.0]), 0.0);
        assert_eq!(sharpe_ratio(&[]), 0.0);
    }

    #[test]
    fn sharpe_is_zero_with_zero_variance() {
        assert_eq!(sharpe_ratio(&[5.0, 5.0, 5.0]), 0.0);
    }

    #[test]
    fn win_rate_and_profit_factor_match_simple_sequence() {
        let trades = vec![
            TradeOutcome { symbol_index: 0, realized_pnl: 100.0, fee: 1.0 },
            TradeOutcome { symbol_index: 0, realized_pnl: -50.0, fee: 1.0 },
            TradeOutcome { symbol_index: 0, realized_pnl: 50.0, fee: 1.0 },
        ];
        let (metrics, per_symbol) = calculate_metrics(&trades, &[1000.0, 1100.0, 1050.0, 1100.0], &["BTCUSDT".to_string()]);
        assert!((metrics.win_rate_pct - (2.0 / 3.0 * 100.0)).abs() < 1e-9);
        assert!((metrics.profit_factor - 3.0).abs() < 1e-9);
        assert_eq!(per_symbol["BTCUSDT"].trade_count, 3);
        assert_eq!(per_symbol["BTCUSDT"].win_count, 2);
    }

    #[test]
    fn max_drawdown_tracks_peak_to_trough() {
        let curve = vec![1000.0, 1200.0, 900.0, 1100.0];
        let dd = max_drawdown(&curve);
        assert!((dd - 25.0).abs() < 1e-9); // (1200-900)/1200 = 25%
    }

    #[test]
    fn total_return_uses_first_and_last_equity_points() {
        let trades: Vec<TradeOutcome> = vec![];
        let (metrics, _) = calculate_metrics(&trades, &[1000.0, 1100.0, 1210.0], &[]);
        assert!((metrics.total_return_pct - 21.0).abs() < 1e-9);
    }
}
