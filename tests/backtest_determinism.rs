// Cross-run invariant: two independently constructed SimulatedAccounts, fed
// the exact same sequence of opens/marks/closes, must produce byte-identical
// equity curves (spec §8 property 8). `positions` is a BTreeMap specifically
// so the unrealized-PnL summation order — and therefore float rounding — is
// fixed by symbol rather than left to per-process hash iteration order.

use std::collections::HashMap;

use aurora_trading_supervisor::backtest::SimulatedAccount;
use aurora_trading_supervisor::types::Side;
use chrono::{TimeZone, Utc};

fn marks(btc: f64, eth: f64, sol: f64) -> HashMap<String, f64> {
    let mut m = HashMap::new();
    m.insert("BTCUSDT".to_string(), btc);
    m.insert("ETHUSDT".to_string(), eth);
    m.insert("SOLUSDT".to_string(), sol);
    m
}

/// Replay a fixed scenario against a fresh account, returning the equity
/// value sampled after each step.
fn run_scenario() -> Vec<f64> {
    let open_time = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
    let mut acc = SimulatedAccount::new(10_000.0, 4.0, 2.0);
    let mut curve = Vec::new();

    acc.open_position("ETHUSDT", Side::Long, 2_000.0, 1.0, 10.0, open_time);
    curve.push(acc.equity(&marks(50_000.0, 2_000.0, 100.0)));

    acc.open_position("BTCUSDT", Side::Short, 50_000.0, 0.1, 10.0, open_time);
    curve.push(acc.equity(&marks(49_500.0, 2_050.0, 100.0)));

    acc.open_position("SOLUSDT", Side::Long, 100.0, 20.0, 5.0, open_time);
    curve.push(acc.equity(&marks(48_800.0, 2_120.0, 104.0)));

    acc.check_liquidations(&marks(48_800.0, 2_120.0, 104.0));
    curve.push(acc.equity(&marks(48_800.0, 2_120.0, 104.0)));

    acc.close_position("ETHUSDT", 2_150.0);
    curve.push(acc.equity(&marks(48_500.0, 2_150.0, 101.0)));

    acc.close_position("SOLUSDT", 98.0);
    curve.push(acc.equity(&marks(48_500.0, 2_150.0, 98.0)));

    curve
}

#[test]
fn equity_curve_is_byte_identical_across_independent_runs() {
    let first_run = run_scenario();
    let second_run = run_scenario();

    assert_eq!(first_run.len(), second_run.len());
    for (i, (a, b)) in first_run.iter().zip(second_run.iter()).enumerate() {
        assert_eq!(a.to_bits(), b.to_bits(), "equity at step {i} diverged between independent runs");
    }
}

#[test]
fn liquidation_and_close_ordering_is_stable_across_runs() {
    // A second pair of independent runs with a liquidating mark thrown in,
    // to confirm the BTreeMap-ordered liquidation sweep is reproducible too.
    fn run() -> (Vec<String>, f64) {
        let open_time = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let mut acc = SimulatedAccount::new(5_000.0, 4.0, 2.0);
        acc.open_position("BTCUSDT", Side::Long, 50_000.0, 0.05, 20.0, open_time);
        acc.open_position("ETHUSDT", Side::Short, 2_000.0, 1.0, 20.0, open_time);
        let liquidated = acc.check_liquidations(&marks(40_000.0, 2_300.0, 0.0));
        let equity = acc.equity(&marks(40_000.0, 2_300.0, 0.0));
        (liquidated, equity)
    }

    let (liq_a, equity_a) = run();
    let (liq_b, equity_b) = run();
    assert_eq!(liq_a, liq_b);
    assert_eq!(equity_a.to_bits(), equity_b.to_bits());
}
