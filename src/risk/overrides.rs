// =============================================================================
// Per-position risk overrides (spec §4.1 step 6)
// =============================================================================
//
// Applied to every open position *before* honoring the LLM's close
// recommendation for that symbol. All comparisons use raw (non-leveraged)
// price percent, never ROE — multiplying by leverage here is the exact bug
// class this layer exists to prevent (see `raw_pnl_pct`, types.rs).
// =============================================================================

use crate::position::Position;
use crate::strategy_config::RiskControlConfig;
use crate::types::Action;

/// What a risk override decided to do with a position this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverrideOutcome {
    /// Leave the position open; no override fired.
    NoAction,
    /// Close at market. Carries which override fired, for logging/audit.
    Close(OverrideReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverrideReason {
    TrailingStop,
    DrawdownClose,
    SmartLossCut,
    MaxHold,
}

impl std::fmt::Display for OverrideReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::TrailingStop => "trailing_stop",
            Self::DrawdownClose => "drawdown_close",
            Self::SmartLossCut => "smart_loss_cut",
            Self::MaxHold => "max_hold",
        };
        write!(f, "{s}")
    }
}

/// Evaluate all per-position overrides for one open position at the given
/// mark price, in the order the spec lists them: Trailing Stop, Drawdown
/// Close, Smart Loss Cut, Max Hold. The first override to fire wins — they
/// are not expected to disagree, but evaluation order is a documented open
/// question resolution (trailing stop runs before smart-loss-cut).
pub fn evaluate_position_overrides(
    position: &Position,
    mark_price: f64,
    cfg: &RiskControlConfig,
) -> OverrideOutcome {
    let raw_pnl = position.raw_pnl_pct(mark_price);
    let peak = position.peak_raw_pnl_pct.max(raw_pnl);
    let age_mins = position.age().num_minutes().max(0) as u32;

    if cfg.trailing_stop_enabled
        && position.trailing_stop_armed
        && raw_pnl <= peak - cfg.trailing_stop_distance_pct
    {
        return OverrideOutcome::Close(OverrideReason::TrailingStop);
    }

    if cfg.drawdown_close_enabled && peak >= cfg.min_profit_for_drawdown {
        let floor = peak * (1.0 - cfg.drawdown_close_threshold_pct / 100.0);
        if raw_pnl <= floor {
            return OverrideOutcome::Close(OverrideReason::DrawdownClose);
        }
    }

    if cfg.smart_loss_cut_enabled
        && age_mins >= cfg.smart_loss_cut_mins
        && raw_pnl <= cfg.smart_loss_cut_pct
    {
        return OverrideOutcome::Close(OverrideReason::SmartLossCut);
    }

    if age_mins >= cfg.max_hold_duration_mins {
        return OverrideOutcome::Close(OverrideReason::MaxHold);
    }

    OverrideOutcome::NoAction
}

/// Whether Trailing Stop should arm this cycle (rawPnL% crossed the
/// activation threshold). Call once per cycle before evaluating overrides;
/// arming is sticky (never disarms while the position stays open).
pub fn should_arm_trailing_stop(position: &Position, mark_price: f64, cfg: &RiskControlConfig) -> bool {
    position.trailing_stop_armed
        || (cfg.trailing_stop_enabled && position.raw_pnl_pct(mark_price) >= cfg.trailing_stop_activate_pct)
}

/// Noise Zone: suppress an LLM-requested close (rewrite to hold) when the
/// position's rawPnL% sits inside the configured dead zone and confidence
/// doesn't clear the high-confidence override threshold.
pub fn apply_noise_zone(
    requested_action: Action,
    raw_pnl_pct: f64,
    confidence: u8,
    cfg: &RiskControlConfig,
) -> Action {
    if !requested_action.is_closing() {
        return requested_action;
    }
    let in_noise_zone =
        cfg.noise_zone_lower_bound < raw_pnl_pct && raw_pnl_pct < cfg.noise_zone_upper_bound;
    if in_noise_zone && (confidence as f64) < cfg.high_confidence_close_threshold {
        Action::Hold
    } else {
        requested_action
    }
}

/// Anti-hedge: resolve an opposing-direction open request against an
/// existing position. `simple_mode` suppresses the reversal nuance — an
/// opposing open becomes a hard rejection rather than close-then-open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AntiHedgeDecision {
    /// No conflicting position; proceed as requested.
    Allow,
    /// Reject the opposing open outright (Simple Mode).
    Reject,
    /// Close the existing position first, then open the new one.
    ReverseThenOpen,
}

pub fn resolve_anti_hedge(
    existing_side: Option<crate::types::Side>,
    requested_action: Action,
    simple_mode: bool,
) -> AntiHedgeDecision {
    let Some(existing) = existing_side else {
        return AntiHedgeDecision::Allow;
    };

    let opposing = match requested_action {
        Action::OpenLong => existing == crate::types::Side::Short,
        Action::OpenShort => existing == crate::types::Side::Long,
        _ => false,
    };

    if !opposing {
        AntiHedgeDecision::Allow
    } else if simple_mode {
        AntiHedgeDecision::Reject
    } else {
        AntiHedgeDecision::ReverseThenOpen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Side;

    fn position_with(peak: f64, armed: bool) -> Position {
        let mut p = Position::open(uuid::Uuid::new_v4(), "BTCUSDT", Side::Long, 100.0, 1.0, 5.0, 20.0, 80.0);
        p.peak_raw_pnl_pct = peak;
        p.trailing_stop_armed = armed;
        p
    }

    fn cfg() -> RiskControlConfig {
        crate::strategy_config::StrategyConfig::default().risk
    }

    #[test]
    fn trailing_stop_fires_after_pullback_from_peak() {
        let pos = position_with(3.0, true);
        let c = cfg();
        // mark such that rawPnL% = 3.0 - distance - epsilon
        let mark = 100.0 * (1.0 + (3.0 - c.trailing_stop_distance_pct - 0.1) / 100.0);
        let outcome = evaluate_position_overrides(&pos, mark, &c);
        assert_eq!(outcome, OverrideOutcome::Close(OverrideReason::TrailingStop));
    }

    #[test]
    fn trailing_stop_does_not_fire_before_arming() {
        let pos = position_with(3.0, false);
        let c = cfg();
        let mark = 100.0 * (1.0 + (3.0 - c.trailing_stop_distance_pct - 0.1) / 100.0);
        let outcome = evaluate_position_overrides(&pos, mark, &c);
        assert_eq!(outcome, OverrideOutcome::NoAction);
    }

    #[test]
    fn max_hold_fires_when_age_exceeds_duration() {
        let mut pos = position_with(0.0, false);
        pos.open_time = chrono::Utc::now() - chrono::Duration::minutes(1000);
        let mut c = cfg();
        c.max_hold_duration_mins = 720;
        c.drawdown_close_enabled = false;
        c.smart_loss_cut_enabled = false;
        let outcome = evaluate_position_overrides(&pos, 100.0, &c);
        assert_eq!(outcome, OverrideOutcome::Close(OverrideReason::MaxHold));
    }

    #[test]
    fn noise_zone_suppresses_low_confidence_close() {
        let c = cfg();
        let action = apply_noise_zone(Action::CloseLong, 0.1, 50, &c);
        assert_eq!(action, Action::Hold);
    }

    #[test]
    fn noise_zone_allows_high_confidence_close() {
        let c = cfg();
        let action = apply_noise_zone(Action::CloseLong, 0.1, 95, &c);
        assert_eq!(action, Action::CloseLong);
    }

    #[test]
    fn anti_hedge_simple_mode_rejects_opposing_open() {
        let decision = resolve_anti_hedge(Some(Side::Long), Action::OpenShort, true);
        assert_eq!(decision, AntiHedgeDecision::Reject);
    }

    #[test]
    fn anti_hedge_full_mode_reverses_opposing_open() {
        let decision = resolve_anti_hedge(Some(Side::Long), Action::OpenShort, false);
        assert_eq!(decision, AntiHedgeDecision::ReverseThenOpen);
    }

    #[test]
    fn anti_hedge_allows_same_direction_open() {
        let decision = resolve_anti_hedge(Some(Side::Long), Action::OpenLong, true);
        assert_eq!(decision, AntiHedgeDecision::Allow);
    }
}
