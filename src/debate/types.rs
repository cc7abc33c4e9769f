// =============================================================================
// Debate Orchestrator types
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::decision::types::Decision;

/// One voice in a debate session. Each personality gets its own system
/// prompt slant so the panel disagrees for real reasons rather than
/// stylistic noise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Personality {
    Bull,
    Bear,
    Analyst,
    Contrarian,
    RiskManager,
}

impl Personality {
    pub fn description(self) -> &'static str {
        match self {
            Personality::Bull => {
                "You are the Bull. You look for reasons price will go up and argue for long \
                 exposure, but you still must justify every number you propose."
            }
            Personality::Bear => {
                "You are the Bear. You look for reasons price will go down and argue for short \
                 exposure, but you still must justify every number you propose."
            }
            Personality::Analyst => {
                "You are the Analyst. You weigh indicators and market structure dispassionately, \
                 without a directional bias, and call out where the data is ambiguous."
            }
            Personality::Contrarian => {
                "You are the Contrarian. You actively argue against whatever position the rest \
                 of the panel is converging on, looking for the crowded-trade risk."
            }
            Personality::RiskManager => {
                "You are the Risk Manager. You focus on position sizing, leverage, and downside \
                 protection; you argue to shrink or reject trades the rest of the panel proposes \
                 too aggressively."
            }
        }
    }
}

impl std::fmt::Display for Personality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Personality::Bull => "bull",
            Personality::Bear => "bear",
            Personality::Analyst => "analyst",
            Personality::Contrarian => "contrarian",
            Personality::RiskManager => "risk_manager",
        };
        write!(f, "{s}")
    }
}

/// One member of the panel for a single debate session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub id: Uuid,
    pub personality: Personality,
    pub model: String,
}

/// One turn spoken by one participant in one round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebateMessage {
    pub round: u32,
    pub participant_id: Uuid,
    pub personality: Personality,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Running,
    Voting,
    Completed,
    Cancelled,
}

/// A participant's final decisions, cast during the voting phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vote {
    pub participant_id: Uuid,
    pub decisions: Vec<Decision>,
}

/// Full state of one debate, as exposed to the API and stored in memory for
/// the session's lifetime. Debates are deliberately ephemeral and are never
/// persisted to SQLite, unlike Decisions/Trades.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebateSession {
    pub id: Uuid,
    pub symbols: Vec<String>,
    pub max_rounds: u32,
    pub participants: Vec<Participant>,
    pub messages: Vec<DebateMessage>,
    pub votes: Vec<Vote>,
    pub final_decisions: Vec<Decision>,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
}
