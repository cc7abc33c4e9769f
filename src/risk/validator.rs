// =============================================================================
// Decision Validator (spec §4.3)
// =============================================================================
//
// Pure function: (Decision, ValidationConfig) -> Ok(()) | Err(ValidationError).
// Violations are rejected, never silently adjusted — auto-lowering leverage
// to make an oversized request "fit" was an actual past incident, so this
// function must never mutate the decision it is handed.
// =============================================================================

use thiserror::Error;

use crate::decision::types::Decision;
use crate::strategy_config::Strategy;
use crate::types::Action;

/// Context the validator needs beyond the decision itself — the account
/// equity and the strategy's configured minimum risk-reward ratio.
#[derive(Debug, Clone, Copy)]
pub struct ValidationConfig {
    pub equity: f64,
    pub min_risk_reward: f64,
}

#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("symbol must not be empty or \"ALL\" for an opening action")]
    InvalidSymbol,
    #[error("leverage {got} exceeds max {max} for {symbol}")]
    LeverageTooHigh { symbol: String, got: f64, max: f64 },
    #[error("leverage must be greater than zero, got {0}")]
    LeverageNotPositive(f64),
    #[error("position size {got} below minimum {min} for {symbol}")]
    PositionSizeTooSmall { symbol: String, got: f64, min: f64 },
    #[error("position size {got} exceeds {max_pct}% of equity ({limit}) for {symbol}")]
    PositionSizeTooLarge {
        symbol: String,
        got: f64,
        max_pct: f64,
        limit: f64,
    },
    #[error("stop-loss must be greater than zero")]
    StopLossNotPositive,
    #[error("take-profit must be greater than zero")]
    TakeProfitNotPositive,
    #[error("for open_long, stop-loss must be below take-profit")]
    LongStopLossNotBelowTakeProfit,
    #[error("for open_short, stop-loss must be above take-profit")]
    ShortStopLossNotAboveTakeProfit,
    #[error("estimated risk-reward {got:.2} below minimum {min:.2}")]
    RiskRewardTooLow { got: f64, min: f64 },
}

/// Tolerance applied to the position-size ceiling (§4.3: "with 1% tolerance").
const POSITION_SIZE_TOLERANCE: f64 = 1.01;

/// Validate a single decision. Returns `Ok(())` for `hold`/`wait` without
/// further checks — only opening actions carry leverage/size/SL-TP risk.
pub fn validate_decision(decision: &Decision, cfg: &ValidationConfig) -> Result<(), ValidationError> {
    if !decision.action.is_opening() {
        return Ok(());
    }

    if decision.symbol.is_empty() || decision.symbol == "ALL" {
        return Err(ValidationError::InvalidSymbol);
    }

    if decision.leverage <= 0.0 {
        return Err(ValidationError::LeverageNotPositive(decision.leverage));
    }
    let max_leverage = Strategy::max_leverage_for(&decision.symbol);
    if decision.leverage > max_leverage {
        return Err(ValidationError::LeverageTooHigh {
            symbol: decision.symbol.clone(),
            got: decision.leverage,
            max: max_leverage,
        });
    }

    let min_size = Strategy::min_position_size_for(&decision.symbol);
    if decision.position_size_usd <= 0.0 || decision.position_size_usd < min_size {
        return Err(ValidationError::PositionSizeTooSmall {
            symbol: decision.symbol.clone(),
            got: decision.position_size_usd,
            min: min_size,
        });
    }

    let max_size_fraction = Strategy::max_position_size_fraction_for(&decision.symbol);
    let max_size = cfg.equity * max_size_fraction * POSITION_SIZE_TOLERANCE;
    if decision.position_size_usd > max_size {
        return Err(ValidationError::PositionSizeTooLarge {
            symbol: decision.symbol.clone(),
            got: decision.position_size_usd,
            max_pct: max_size_fraction * 100.0,
            limit: max_size,
        });
    }

    if decision.stop_loss <= 0.0 {
        return Err(ValidationError::StopLossNotPositive);
    }
    if decision.take_profit <= 0.0 {
        return Err(ValidationError::TakeProfitNotPositive);
    }

    match decision.action {
        Action::OpenLong if decision.stop_loss >= decision.take_profit => {
            return Err(ValidationError::LongStopLossNotBelowTakeProfit)
        }
        Action::OpenShort if decision.stop_loss <= decision.take_profit => {
            return Err(ValidationError::ShortStopLossNotAboveTakeProfit)
        }
        _ => {}
    }

    // Estimated risk-reward using the SL/TP midpoint as an entry estimate.
    let entry_estimate = (decision.stop_loss + decision.take_profit) / 2.0;
    let (risk, reward) = match decision.action {
        Action::OpenLong => (
            (entry_estimate - decision.stop_loss).abs(),
            (decision.take_profit - entry_estimate).abs(),
        ),
        Action::OpenShort => (
            (decision.stop_loss - entry_estimate).abs(),
            (entry_estimate - decision.take_profit).abs(),
        ),
        _ => unreachable!("non-opening actions returned early above"),
    };
    if risk > 0.0 {
        let rr = reward / risk;
        if rr < cfg.min_risk_reward {
            return Err(ValidationError::RiskRewardTooLow {
                got: rr,
                min: cfg.min_risk_reward,
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_decision() -> Decision {
        Decision {
            symbol: "BTCUSDT".to_string(),
            action: Action::OpenLong,
            confidence: 80,
            leverage: 10.0,
            position_size_usd: 100.0,
            stop_loss: 49000.0,
            take_profit: 52000.0,
            reasoning: String::new(),
        }
    }

    fn cfg() -> ValidationConfig {
        ValidationConfig {
            equity: 10_000.0,
            min_risk_reward: 1.5,
        }
    }

    #[test]
    fn hold_and_wait_skip_all_checks() {
        let mut d = base_decision();
        d.action = Action::Hold;
        d.symbol = "ALL".to_string();
        d.leverage = 0.0;
        assert!(validate_decision(&d, &cfg()).is_ok());
    }

    #[test]
    fn rejects_symbol_all_for_opening_action() {
        let mut d = base_decision();
        d.symbol = "ALL".to_string();
        assert_eq!(validate_decision(&d, &cfg()), Err(ValidationError::InvalidSymbol));
    }

    #[test]
    fn rejects_leverage_above_symbol_cap() {
        let mut d = base_decision();
        d.leverage = 25.0; // BTC cap is 20
        assert!(matches!(
            validate_decision(&d, &cfg()),
            Err(ValidationError::LeverageTooHigh { .. })
        ));
    }

    #[test]
    fn altcoin_has_tighter_leverage_cap() {
        let mut d = base_decision();
        d.symbol = "DOGEUSDT".to_string();
        d.leverage = 15.0; // altcoin cap is 10
        d.position_size_usd = 20.0;
        assert!(matches!(
            validate_decision(&d, &cfg()),
            Err(ValidationError::LeverageTooHigh { .. })
        ));
    }

    #[test]
    fn rejects_position_size_below_minimum() {
        let mut d = base_decision();
        d.position_size_usd = 10.0; // BTC floor is 60
        assert!(matches!(
            validate_decision(&d, &cfg()),
            Err(ValidationError::PositionSizeTooSmall { .. })
        ));
    }

    #[test]
    fn rejects_position_size_above_equity_fraction() {
        let mut d = base_decision();
        d.position_size_usd = 5000.0; // way above 30% of 10k equity
        assert!(matches!(
            validate_decision(&d, &cfg()),
            Err(ValidationError::PositionSizeTooLarge { .. })
        ));
    }

    #[test]
    fn one_percent_tolerance_allows_boundary_size() {
        let mut d = base_decision();
        d.position_size_usd = 10_000.0 * 0.3 * 1.005; // within 1% tolerance
        assert!(validate_decision(&d, &cfg()).is_ok());
    }

    #[test]
    fn rejects_long_with_sl_above_tp() {
        let mut d = base_decision();
        d.stop_loss = 53000.0;
        d.take_profit = 52000.0;
        assert_eq!(
            validate_decision(&d, &cfg()),
            Err(ValidationError::LongStopLossNotBelowTakeProfit)
        );
    }

    #[test]
    fn rejects_short_with_sl_below_tp() {
        let mut d = base_decision();
        d.action = Action::OpenShort;
        d.stop_loss = 49000.0;
        d.take_profit = 48000.0; // TP above SL for a short is backwards
        assert_eq!(
            validate_decision(&d, &cfg()),
            Err(ValidationError::ShortStopLossNotAboveTakeProfit)
        );
    }

    #[test]
    fn rejects_risk_reward_below_minimum() {
        let mut d = base_decision();
        d.stop_loss = 49900.0;
        d.take_profit = 50100.0; // tight TP relative to SL distance
        assert!(matches!(
            validate_decision(&d, &cfg()),
            Err(ValidationError::RiskRewardTooLow { .. })
        ));
    }

    #[test]
    fn never_mutates_the_decision_on_rejection() {
        let mut d = base_decision();
        d.leverage = 999.0;
        let before = d.clone();
        let _ = validate_decision(&d, &cfg());
        assert_eq!(d.leverage, before.leverage, "validator must never adjust fields");
    }
}
