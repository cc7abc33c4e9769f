// =============================================================================
// Aurora Trading Supervisor — library root
// =============================================================================
//
// Thin re-export of every module so `tests/` can exercise cross-module
// invariants (validator+risk, consensus, backtest determinism) against the
// same code the `aurora-trading-supervisor` binary runs, rather than
// against a second copy compiled only for the binary target.
// =============================================================================

pub mod api;
pub mod backtest;
pub mod debate;
pub mod decision;
pub mod engine;
pub mod events;
pub mod exchange;
pub mod indicators;
pub mod llm;
pub mod manager;
pub mod market_data;
pub mod persistence;
pub mod position;
pub mod risk;
pub mod strategy_config;
pub mod types;
