// =============================================================================
// Position entity + PositionManager
// =============================================================================

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::types::{raw_pnl_pct, Side};

/// A position's lifecycle: OPEN transitions exactly once to CLOSED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionState {
    Open,
    Closed,
}

/// A futures position held by a trader.
///
/// Invariant: `quantity >= 0`; a closed position never reopens under the
/// same id — `PositionManager::open_position` always mints a new one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: uuid::Uuid,
    pub trader_id: uuid::Uuid,
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub quantity: f64,
    pub leverage: f64,
    pub margin: f64,
    pub liquidation_price: f64,
    pub accumulated_fee: f64,
    pub open_time: DateTime<Utc>,
    pub close_time: Option<DateTime<Utc>>,
    pub state: PositionState,
    /// High-water mark of raw (non-leveraged) PnL%, used by Trailing Stop
    /// and Drawdown Close (§4.1 step 6). Monotonically non-decreasing while
    /// the position is open.
    pub peak_raw_pnl_pct: f64,
    /// Whether Trailing Stop has armed for this position (rawPnL% crossed
    /// `TrailingStopActivatePct` at least once).
    pub trailing_stop_armed: bool,
}

impl Position {
    pub fn open(
        trader_id: uuid::Uuid,
        symbol: impl Into<String>,
        side: Side,
        entry_price: f64,
        quantity: f64,
        leverage: f64,
        margin: f64,
        liquidation_price: f64,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            trader_id,
            symbol: symbol.into(),
            side,
            entry_price,
            quantity,
            leverage,
            margin,
            liquidation_price,
            accumulated_fee: 0.0,
            open_time: Utc::now(),
            close_time: None,
            state: PositionState::Open,
            peak_raw_pnl_pct: 0.0,
            trailing_stop_armed: false,
        }
    }

    pub fn raw_pnl_pct(&self, mark_price: f64) -> f64 {
        raw_pnl_pct(self.side, self.entry_price, mark_price)
    }

    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.open_time
    }

    /// Update the peak rawPnL% high-water mark; called once per cycle per
    /// open position before risk overrides are evaluated.
    pub fn update_peak(&mut self, mark_price: f64) {
        let current = self.raw_pnl_pct(mark_price);
        if current > self.peak_raw_pnl_pct {
            self.peak_raw_pnl_pct = current;
        }
    }

    pub fn close(&mut self) {
        self.state = PositionState::Closed;
        self.close_time = Some(Utc::now());
    }

    pub fn is_open(&self) -> bool {
        self.state == PositionState::Open
    }
}

/// In-memory registry of a trader's open and closed positions.
///
/// Mirrors the teacher's position-tracking shape: two `RwLock<Vec<_>>`
/// buckets rather than a single list filtered by state, so "give me all
/// open positions" never scans closed history.
#[derive(Default)]
pub struct PositionManager {
    open: RwLock<Vec<Position>>,
    closed: RwLock<Vec<Position>>,
}

impl PositionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open_position(&self, position: Position) {
        self.open.write().push(position);
    }

    pub fn get_open_positions(&self) -> Vec<Position> {
        self.open.read().clone()
    }

    pub fn get_open_position(&self, symbol: &str) -> Option<Position> {
        self.open.read().iter().find(|p| p.symbol == symbol).cloned()
    }

    pub fn get_closed_positions(&self) -> Vec<Position> {
        self.closed.read().clone()
    }

    /// Move a position from open to closed by id. No-op if not found or
    /// already closed (closing is idempotent at the manager boundary).
    pub fn close_position(&self, id: uuid::Uuid) -> Option<Position> {
        let mut open = self.open.write();
        if let Some(idx) = open.iter().position(|p| p.id == id) {
            let mut pos = open.remove(idx);
            pos.close();
            self.closed.write().push(pos.clone());
            return Some(pos);
        }
        None
    }

    /// Replace the stored open position in place (used after updating its
    /// peak-PnL high-water mark each cycle).
    pub fn update_position(&self, updated: Position) {
        let mut open = self.open.write();
        if let Some(slot) = open.iter_mut().find(|p| p.id == updated.id) {
            *slot = updated;
        }
    }

    pub fn has_open_position(&self, symbol: &str) -> bool {
        self.open.read().iter().any(|p| p.symbol == symbol)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peak_tracks_high_water_mark_only() {
        let mut pos = Position::open(
            uuid::Uuid::new_v4(),
            "BTCUSDT",
            Side::Long,
            100.0,
            1.0,
            5.0,
            20.0,
            80.0,
        );
        pos.update_peak(103.0); // +3%
        assert!((pos.peak_raw_pnl_pct - 3.0).abs() < 1e-9);
        pos.update_peak(101.0); // +1%, below peak
        assert!((pos.peak_raw_pnl_pct - 3.0).abs() < 1e-9, "peak must not decrease");
    }

    #[test]
    fn manager_moves_position_from_open_to_closed() {
        let manager = PositionManager::new();
        let pos = Position::open(
            uuid::Uuid::new_v4(),
            "ETHUSDT",
            Side::Short,
            2000.0,
            1.0,
            5.0,
            400.0,
            2200.0,
        );
        let id = pos.id;
        manager.open_position(pos);
        assert!(manager.has_open_position("ETHUSDT"));

        let closed = manager.close_position(id).expect("position should close");
        assert_eq!(closed.state, PositionState::Closed);
        assert!(!manager.has_open_position("ETHUSDT"));
        assert_eq!(manager.get_closed_positions().len(), 1);
    }
}
