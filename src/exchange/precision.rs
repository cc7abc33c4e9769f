// =============================================================================
// Quantity / price precision rounding (spec §4.6)
// =============================================================================
//
// The exchange reports a per-symbol decimal precision for quantity and price
// via `exchangeInfo`; when a symbol is not in the table, fall back to a
// conservative default (3 decimals for quantity, 2 for price).
// =============================================================================

use std::collections::HashMap;

/// Precision (decimal places) for a symbol's quantity and price fields.
#[derive(Debug, Clone, Copy)]
pub struct SymbolPrecision {
    pub quantity_decimals: u32,
    pub price_decimals: u32,
}

const DEFAULT_PRECISION: SymbolPrecision = SymbolPrecision {
    quantity_decimals: 3,
    price_decimals: 2,
};

/// Lookup table of known symbol precisions, refreshed from `exchangeInfo`.
#[derive(Debug, Clone, Default)]
pub struct PrecisionTable {
    table: HashMap<String, SymbolPrecision>,
}

impl PrecisionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, symbol: &str, precision: SymbolPrecision) {
        self.table.insert(symbol.to_string(), precision);
    }

    pub fn get(&self, symbol: &str) -> SymbolPrecision {
        self.table.get(symbol).copied().unwrap_or(DEFAULT_PRECISION)
    }

    pub fn round_quantity(&self, symbol: &str, quantity: f64) -> f64 {
        round_to(quantity, self.get(symbol).quantity_decimals)
    }

    pub fn round_price(&self, symbol: &str, price: f64) -> f64 {
        round_to(price, self.get(symbol).price_decimals)
    }
}

fn round_to(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_symbol_uses_fallback_precision() {
        let table = PrecisionTable::new();
        assert_eq!(table.round_quantity("UNKNOWNUSDT", 1.23456), 1.235);
        assert_eq!(table.round_price("UNKNOWNUSDT", 123.4567), 123.46);
    }

    #[test]
    fn known_symbol_uses_registered_precision() {
        let mut table = PrecisionTable::new();
        table.insert(
            "BTCUSDT",
            SymbolPrecision {
                quantity_decimals: 3,
                price_decimals: 1,
            },
        );
        assert_eq!(table.round_price("BTCUSDT", 50123.46), 50123.5);
    }
}
