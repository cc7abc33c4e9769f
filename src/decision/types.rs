// =============================================================================
// Decision Pipeline types
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::Action;

/// One trade proposal parsed out of an LLM response.
///
/// Invariants (enforced by the validator, `risk::validator`, never here):
/// for `open_long` SL<TP; for `open_short` SL>TP; leverage in (0, max];
/// symbol != "ALL" for any opening action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub symbol: String,
    pub action: Action,
    pub confidence: u8,
    pub leverage: f64,
    pub position_size_usd: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub reasoning: String,
}

impl Decision {
    /// The canonical safe-fallback decision emitted when response extraction
    /// fails entirely.
    pub fn safe_fallback(reason: impl std::fmt::Display) -> Self {
        Self {
            symbol: "ALL".to_string(),
            action: Action::Wait,
            confidence: 50,
            leverage: 0.0,
            position_size_usd: 0.0,
            stop_loss: 0.0,
            take_profit: 0.0,
            reasoning: format!("JSON parse failed: {reason}"),
        }
    }

    /// A symbol="ALL" decision is only legal for hold/wait (spec §3
    /// lifecycle invariant).
    pub fn is_symbol_scope_valid(&self) -> bool {
        self.symbol != "ALL" || matches!(self.action, Action::Hold | Action::Wait)
    }
}

/// The full output of one `MakeDecision` call (spec §4.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FullDecision {
    pub system_prompt: String,
    pub user_prompt: String,
    pub raw_response: String,
    pub reasoning_trace: String,
    pub decisions: Vec<Decision>,
    pub request_duration_ms: u64,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_fallback_matches_scenario_s6() {
        let d = Decision::safe_fallback("no JSON array found");
        assert_eq!(d.symbol, "ALL");
        assert_eq!(d.action, Action::Wait);
        assert_eq!(d.confidence, 50);
        assert!(d.is_symbol_scope_valid());
    }

    #[test]
    fn symbol_all_invalid_for_opening_action() {
        let mut d = Decision::safe_fallback("test");
        d.action = Action::OpenLong;
        assert!(!d.is_symbol_scope_valid());
    }
}
