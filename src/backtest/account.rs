// =============================================================================
// Simulated margin account for the Backtest Runner
// =============================================================================
//
// Stands in for the live Exchange Adapter + Position Manager pair: it holds
// cash and open positions, applies fees/slippage on fills, and answers the
// same liquidation and PnL questions a live cycle would ask. Liquidation
// price math is shared verbatim with the live Engine via
// `crate::types::estimate_liquidation_price` — simulated and real accounts
// must never disagree about where a position blows up.
// =============================================================================

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{estimate_liquidation_price, raw_pnl_pct, Side};

/// One open position inside a simulated account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimPosition {
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub quantity: f64,
    pub leverage: f64,
    pub margin: f64,
    pub liquidation_price: f64,
    pub open_time: DateTime<Utc>,
}

impl SimPosition {
    pub fn raw_pnl_pct(&self, mark: f64) -> f64 {
        raw_pnl_pct(self.side, self.entry_price, mark)
    }

    pub fn unrealized_pnl(&self, mark: f64) -> f64 {
        self.raw_pnl_pct(mark) / 100.0 * self.entry_price * self.quantity
    }

    pub fn is_liquidated(&self, mark: f64) -> bool {
        match self.side {
            Side::Long => mark <= self.liquidation_price,
            Side::Short => mark >= self.liquidation_price,
        }
    }
}

/// A margin account driven entirely by historical marks rather than a live
/// exchange. One per backtest run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatedAccount {
    pub cash: f64,
    /// `BTreeMap`, not `HashMap`: equity sums unrealized PnL across all open
    /// positions, and float addition is not associative, so the reduction
    /// order must be fixed by symbol rather than left to `HashMap`'s
    /// per-process random iteration order (spec §8 property 8 — the equity
    /// curve must be byte-identical across runs of the same inputs).
    pub positions: BTreeMap<String, SimPosition>,
    pub fee_bps: f64,
    pub slippage_bps: f64,
    pub max_equity: f64,
}

impl SimulatedAccount {
    pub fn new(initial_balance: f64, fee_bps: f64, slippage_bps: f64) -> Self {
        Self {
            cash: initial_balance,
            positions: BTreeMap::new(),
            fee_bps,
            slippage_bps,
            max_equity: initial_balance,
        }
    }

    /// Equity = cash + sum of unrealized PnL across open positions, marked
    /// at the given per-symbol prices. Iterates `positions` in symbol order
    /// (via `BTreeMap`) so the sum is deterministic across runs.
    pub fn equity(&self, marks: &HashMap<String, f64>) -> f64 {
        let unrealized: f64 = self
            .positions
            .values()
            .filter_map(|p| marks.get(&p.symbol).map(|&mark| p.unrealized_pnl(mark)))
            .sum();
        self.cash + unrealized
    }

    /// Slippage-adjusted fill price: buys (opening long / closing short) pay
    /// a premium, sells receive a discount, proportional to `slippage_bps`.
    fn slipped_price(&self, buy_side: bool, price: f64) -> f64 {
        let factor = self.slippage_bps / 10_000.0;
        if buy_side {
            price * (1.0 + factor)
        } else {
            price * (1.0 - factor)
        }
    }

    fn fee_for(&self, notional: f64) -> f64 {
        notional * (self.fee_bps / 10_000.0)
    }

    /// Open (or replace) a position, applying slippage and fees and debiting
    /// margin from cash. Returns `(fill_price, fee)` so callers can record a
    /// TradeEvent without duplicating the slippage/fee math.
    pub fn open_position(
        &mut self,
        symbol: &str,
        side: Side,
        price: f64,
        quantity: f64,
        leverage: f64,
        now: DateTime<Utc>,
    ) -> (f64, f64) {
        let buy_side = side == Side::Long;
        let fill_price = self.slipped_price(buy_side, price);
        let notional = fill_price * quantity;
        let fee = self.fee_for(notional);
        let margin = notional / leverage.max(1.0);
        let liquidation_price = estimate_liquidation_price(side, fill_price, leverage);

        self.cash -= margin + fee;
        self.positions.insert(
            symbol.to_string(),
            SimPosition {
                symbol: symbol.to_string(),
                side,
                entry_price: fill_price,
                quantity,
                leverage,
                margin,
                liquidation_price,
                open_time: now,
            },
        );
        (fill_price, fee)
    }

    /// Close a position at `price`, applying slippage and fees, crediting
    /// margin plus realized PnL back into cash. Returns `(realized_pnl,
    /// fee)` or `None` if there was no open position for the symbol.
    pub fn close_position(&mut self, symbol: &str, price: f64) -> Option<(f64, f64)> {
        let position = self.positions.remove(symbol)?;
        let buy_side = position.side == Side::Short; // closing a short buys back
        let fill_price = self.slipped_price(buy_side, price);
        let realized_pnl = position.unrealized_pnl(fill_price);
        let notional = fill_price * position.quantity;
        let fee = self.fee_for(notional);

        self.cash += position.margin + realized_pnl - fee;
        Some((realized_pnl, fee))
    }

    /// Remove any position whose mark has crossed its liquidation price,
    /// wiping the lost margin from cash, and return the liquidated symbols.
    pub fn check_liquidations(&mut self, marks: &HashMap<String, f64>) -> Vec<String> {
        let liquidated: Vec<String> = self
            .positions
            .values()
            .filter(|p| marks.get(&p.symbol).is_some_and(|&mark| p.is_liquidated(mark)))
            .map(|p| p.symbol.clone())
            .collect();

        for symbol in &liquidated {
            if let Some(position) = self.positions.remove(symbol) {
                self.cash -= position.margin;
            }
        }
        liquidated
    }

    pub fn update_high_water_mark(&mut self, equity: f64) {
        if equity > self.max_equity {
            self.max_equity = equity;
        }
    }

    pub fn drawdown_pct(&self, equity: f64) -> f64 {
        if self.max_equity <= 0.0 {
            return 0.0;
        }
        ((self.max_equity - equity) / self.max_equity * 100.0).max(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn marks(symbol: &str, price: f64) -> HashMap<String, f64> {
        let mut m = HashMap::new();
        m.insert(symbol.to_string(), price);
        m
    }

    #[test]
    fn opening_and_closing_a_long_realizes_profit() {
        let mut acc = SimulatedAccount::new(10_000.0, 4.0, 2.0);
        acc.open_position("BTCUSDT", Side::Long, 50_000.0, 0.1, 10.0, Utc::now());
        assert!(acc.positions.contains_key("BTCUSDT"));

        let (pnl, fee) = acc.close_position("BTCUSDT", 55_000.0).expect("position existed");
        assert!(pnl > 0.0);
        assert!(fee > 0.0);
        assert!(!acc.positions.contains_key("BTCUSDT"));
    }

    #[test]
    fn liquidation_check_removes_underwater_position() {
        let mut acc = SimulatedAccount::new(10_000.0, 4.0, 2.0);
        acc.open_position("BTCUSDT", Side::Long, 50_000.0, 0.1, 20.0, Utc::now());
        let liquidated = acc.check_liquidations(&marks("BTCUSDT", 40_000.0));
        assert_eq!(liquidated, vec!["BTCUSDT".to_string()]);
        assert!(!acc.positions.contains_key("BTCUSDT"));
    }

    #[test]
    fn equity_sums_positions_in_fixed_symbol_order() {
        let mut acc = SimulatedAccount::new(10_000.0, 4.0, 2.0);
        acc.open_position("ETHUSDT", Side::Long, 2_000.0, 1.0, 10.0, Utc::now());
        acc.open_position("BTCUSDT", Side::Short, 50_000.0, 0.1, 10.0, Utc::now());

        let mut all_marks = HashMap::new();
        all_marks.insert("BTCUSDT".to_string(), 49_500.0);
        all_marks.insert("ETHUSDT".to_string(), 2_050.0);

        // Computed twice; `positions` is a BTreeMap so the summation order
        // (and therefore the float rounding) is identical both times.
        let first = acc.equity(&all_marks);
        let second = acc.equity(&all_marks);
        assert_eq!(first.to_bits(), second.to_bits());
    }

    #[test]
    fn drawdown_is_zero_at_new_high() {
        let mut acc = SimulatedAccount::new(10_000.0, 4.0, 2.0);
        acc.update_high_water_mark(12_000.0);
        assert_eq!(acc.drawdown_pct(12_000.0), 0.0);
        assert!(acc.drawdown_pct(9_000.0) > 0.0);
    }
}
