// =============================================================================
// Debate Orchestrator — multi-persona deliberation over a set of
// symbols, ending in a voted consensus decision set.
// =============================================================================
//
// Mirrors the Engine's own cooperative-cancellation shape (a per-session
// `watch` channel checked between rounds) and reuses the same
// response-extraction pipeline the live Engine uses for its single-model
// decisions (`extract_full_decision`) so a vote is parsed
// identically to a normal cycle's decision. Every participant's system
// prompt is the same base trading prompt the Engine builds
// (`decision::prompt::build_system_prompt`), plus a round banner and the
// participant's personality description (spec §4.4).
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock as SyncRwLock;
use serde_json::json;
use tokio::sync::watch;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::decision::extractor::extract_full_decision;
use crate::decision::prompt::build_system_prompt;
use crate::decision::types::Decision;
use crate::events::{EventHub, HubEvent};
use crate::llm::client::{LlmClient, LlmMessage, LlmRequest};
use crate::strategy_config::StrategyConfig;
use crate::types::Action;

use super::types::{DebateMessage, DebateSession, Participant, SessionStatus, Vote};

/// Max characters of each prior message carried into a later round's prompt;
/// later rounds see only a truncated summary of what has been said.
const PRIOR_MESSAGE_TRUNCATE: usize = 500;
const DEFAULT_LEVERAGE: f64 = 5.0;
const DEFAULT_POSITION_FRACTION: f64 = 0.2;
/// A winning action group must average at least this confidence to be kept;
/// otherwise the symbol is dropped from the consensus entirely.
const MIN_CONSENSUS_CONFIDENCE: f64 = 50.0;

/// The round banner named in spec.md's system-prompt layout ("base trading
/// prompt + personality description + round banner").
fn round_banner(round: u32, max_rounds: u32) -> String {
    format!("=== Round {round} of {max_rounds} ===")
}

/// Truncate to at most `max` bytes without splitting a UTF-8 character.
fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &s[..end])
}

/// Group votes by (symbol, action), score each group, and keep the
/// highest-scoring action per symbol whose average confidence clears the
/// floor. Numeric fields are averaged across the winning group; leverage and
/// position size fall back to panel defaults only when no vote in the group
/// supplied a usable value.
pub fn compute_consensus(votes: &[Vote], account_equity: f64) -> Vec<Decision> {
    struct Group {
        score: f64,
        decisions: Vec<Decision>,
    }

    let mut groups: HashMap<(String, Action), Group> = HashMap::new();
    for vote in votes {
        for decision in &vote.decisions {
            if !decision.is_symbol_scope_valid() {
                continue;
            }
            let key = (decision.symbol.clone(), decision.action);
            let weight = (decision.confidence as f64 / 100.0).max(0.5);
            let entry = groups.entry(key).or_insert_with(|| Group {
                score: 0.0,
                decisions: Vec::new(),
            });
            entry.score += weight;
            entry.decisions.push(decision.clone());
        }
    }

    let mut by_symbol: HashMap<String, Vec<((String, Action), Group)>> = HashMap::new();
    for (key, group) in groups {
        by_symbol.entry(key.0.clone()).or_default().push((key, group));
    }

    let mut out = Vec::new();
    for (_symbol, mut candidates) in by_symbol {
        candidates.sort_by(|a, b| b.1.score.partial_cmp(&a.1.score).unwrap_or(std::cmp::Ordering::Equal));
        let Some(((symbol, action), winner)) = candidates.into_iter().next() else {
            continue;
        };
        let n = winner.decisions.len() as f64;
        let avg_confidence = winner.decisions.iter().map(|d| d.confidence as f64).sum::<f64>() / n;
        if avg_confidence < MIN_CONSENSUS_CONFIDENCE {
            continue;
        }

        let avg_nonzero = |pick: fn(&Decision) -> f64| -> Option<f64> {
            let (sum, count) = winner
                .decisions
                .iter()
                .map(pick)
                .filter(|v| *v > 0.0)
                .fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
            if count == 0 {
                None
            } else {
                Some(sum / count as f64)
            }
        };

        let leverage = avg_nonzero(|d| d.leverage).unwrap_or(DEFAULT_LEVERAGE);
        let position_size_usd =
            avg_nonzero(|d| d.position_size_usd).unwrap_or(DEFAULT_POSITION_FRACTION * account_equity);
        let stop_loss = avg_nonzero(|d| d.stop_loss).unwrap_or(0.0);
        let take_profit = avg_nonzero(|d| d.take_profit).unwrap_or(0.0);

        let reasoning = winner
            .decisions
            .iter()
            .map(|d| d.reasoning.as_str())
            .collect::<Vec<_>>()
            .join(" | ");

        out.push(Decision {
            symbol,
            action,
            confidence: avg_confidence.round().clamp(0.0, 100.0) as u8,
            leverage,
            position_size_usd,
            stop_loss,
            take_profit,
            reasoning,
        });
    }

    out
}

/// Handle to a running (or finished) debate session.
pub struct DebateSessionHandle {
    pub id: Uuid,
    cancel_tx: watch::Sender<bool>,
    state: Arc<SyncRwLock<DebateSession>>,
}

impl DebateSessionHandle {
    pub fn snapshot(&self) -> DebateSession {
        self.state.read().clone()
    }

    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }
}

/// Owns every in-flight and completed debate session for this process.
/// Sessions are held in memory only and pruned by the API layer
/// on request rather than expiring automatically.
pub struct DebateManager {
    hub: EventHub,
    llm: Arc<LlmClient>,
    sessions: SyncRwLock<HashMap<Uuid, Arc<DebateSessionHandle>>>,
}

impl DebateManager {
    pub fn new(hub: EventHub, llm: Arc<LlmClient>) -> Arc<Self> {
        Arc::new(Self {
            hub,
            llm,
            sessions: SyncRwLock::new(HashMap::new()),
        })
    }

    pub fn start_session(
        self: &Arc<Self>,
        symbols: Vec<String>,
        max_rounds: u32,
        participants: Vec<Participant>,
        account_equity: f64,
        strategy: StrategyConfig,
    ) -> Uuid {
        let id = Uuid::new_v4();
        let session = DebateSession {
            id,
            symbols: symbols.clone(),
            max_rounds,
            participants: participants.clone(),
            messages: Vec::new(),
            votes: Vec::new(),
            final_decisions: Vec::new(),
            status: SessionStatus::Pending,
            created_at: Utc::now(),
        };
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let state = Arc::new(SyncRwLock::new(session));
        let handle = Arc::new(DebateSessionHandle {
            id,
            cancel_tx,
            state: state.clone(),
        });
        self.sessions.write().insert(id, handle);

        let llm = self.llm.clone();
        let hub = self.hub.clone();
        tokio::spawn(run_session(
            llm,
            hub,
            state,
            cancel_rx,
            id,
            symbols,
            max_rounds,
            participants,
            account_equity,
            strategy,
        ));

        id
    }

    pub fn get(&self, id: Uuid) -> Option<DebateSession> {
        self.sessions.read().get(&id).map(|h| h.snapshot())
    }

    pub fn cancel(&self, id: Uuid) {
        if let Some(handle) = self.sessions.read().get(&id) {
            handle.cancel();
        }
    }

    pub fn list(&self) -> Vec<DebateSession> {
        self.sessions.read().values().map(|h| h.snapshot()).collect()
    }
}

#[instrument(skip(llm, hub, state, cancel_rx, participants), fields(session_id = %session_id))]
async fn run_session(
    llm: Arc<LlmClient>,
    hub: EventHub,
    state: Arc<SyncRwLock<DebateSession>>,
    mut cancel_rx: watch::Receiver<bool>,
    session_id: Uuid,
    symbols: Vec<String>,
    max_rounds: u32,
    participants: Vec<Participant>,
    account_equity: f64,
    strategy: StrategyConfig,
) {
    state.write().status = SessionStatus::Running;
    let symbol_list = symbols.join(", ");
    let base_prompt = build_system_prompt(&strategy);
    let mut cancelled = false;

    'rounds: for round in 1..=max_rounds {
        for participant in &participants {
            if *cancel_rx.borrow() {
                cancelled = true;
                break 'rounds;
            }

            let prior = if round == 1 {
                String::new()
            } else {
                let messages = state.read().messages.clone();
                summarize_prior(&messages, PRIOR_MESSAGE_TRUNCATE)
            };

            let user_prompt = if round == 1 {
                format!(
                    "Symbols under debate: {symbol_list}. Share your opening view on whether \
                     and how to trade them this round."
                )
            } else {
                format!(
                    "Symbols under debate: {symbol_list}. Prior discussion so far:\n{prior}\n\n\
                     Respond to the panel and refine your view."
                )
            };

            let system_prompt = format!(
                "{base_prompt}\n\n{}\n\n{}",
                round_banner(round, max_rounds),
                participant.personality.description()
            );
            let request = LlmRequest {
                model: participant.model.clone(),
                messages: vec![LlmMessage::system(system_prompt), LlmMessage::user(user_prompt)],
                temperature: 0.7,
                max_tokens: 800,
                stream: false,
            };

            let content = match llm.complete(&request).await {
                Ok(response) => response.content,
                Err(err) => {
                    warn!(participant = %participant.id, error = %err, "debate participant call failed");
                    format!("(no response: {err})")
                }
            };

            let message = DebateMessage {
                round,
                participant_id: participant.id,
                personality: participant.personality,
                content,
                timestamp: Utc::now(),
            };
            state.write().messages.push(message.clone());
            hub.publish(HubEvent::DebateMessage {
                session_id,
                payload: json!(message),
            });
        }

        if *cancel_rx.borrow() {
            cancelled = true;
            break 'rounds;
        }
    }

    if cancelled {
        state.write().status = SessionStatus::Cancelled;
        info!("debate session cancelled before voting");
        return;
    }

    state.write().status = SessionStatus::Voting;

    let mut votes = Vec::with_capacity(participants.len());
    for participant in &participants {
        if *cancel_rx.borrow() {
            state.write().status = SessionStatus::Cancelled;
            return;
        }

        let prior = summarize_prior(&state.read().messages, PRIOR_MESSAGE_TRUNCATE);
        let vote_prompt = format!(
            "Symbols under debate: {symbol_list}. Full discussion:\n{prior}\n\n\
             Cast your final vote now. Respond only with a <decision> JSON array, one \
             object per symbol you want to act on, using the same schema as a normal trading \
             decision."
        );
        let system_prompt = format!(
            "{base_prompt}\n\n{}\n\n{}",
            round_banner(max_rounds, max_rounds),
            participant.personality.description()
        );
        let request = LlmRequest {
            model: participant.model.clone(),
            messages: vec![LlmMessage::system(system_prompt), LlmMessage::user(vote_prompt)],
            temperature: 0.3,
            max_tokens: 600,
            stream: false,
        };

        let decisions = match llm.complete(&request).await {
            Ok(response) => extract_full_decision(&response.content).0,
            Err(err) => {
                warn!(participant = %participant.id, error = %err, "debate vote call failed");
                Vec::new()
            }
        };

        votes.push(Vote {
            participant_id: participant.id,
            decisions,
        });
    }

    let final_decisions = compute_consensus(&votes, account_equity);

    let mut guard = state.write();
    guard.votes = votes;
    guard.final_decisions = final_decisions.clone();
    guard.status = SessionStatus::Completed;
    drop(guard);

    hub.publish(HubEvent::DebateConsensus {
        session_id,
        payload: json!(final_decisions),
    });
    info!(decisions = final_decisions.len(), "debate session completed");
}

fn summarize_prior(messages: &[DebateMessage], truncate_to: usize) -> String {
    messages
        .iter()
        .map(|m| format!("[round {} · {}]: {}", m.round, m.personality, truncate(&m.content, truncate_to)))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Action;

    fn decision(symbol: &str, action: Action, confidence: u8) -> Decision {
        Decision {
            symbol: symbol.to_string(),
            action,
            confidence,
            leverage: 0.0,
            position_size_usd: 0.0,
            stop_loss: 0.0,
            take_profit: 0.0,
            reasoning: "because".to_string(),
        }
    }

    #[test]
    fn consensus_picks_majority_action_and_applies_defaults() {
        let votes = vec![
            Vote { participant_id: Uuid::new_v4(), decisions: vec![decision("BTCUSDT", Action::OpenLong, 80)] },
            Vote { participant_id: Uuid::new_v4(), decisions: vec![decision("BTCUSDT", Action::OpenLong, 70)] },
            Vote { participant_id: Uuid::new_v4(), decisions: vec![decision("BTCUSDT", Action::OpenShort, 60)] },
        ];
        let decisions = compute_consensus(&votes, 10_000.0);
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].symbol, "BTCUSDT");
        assert_eq!(decisions[0].action, Action::OpenLong);
        assert_eq!(decisions[0].leverage, DEFAULT_LEVERAGE);
        assert_eq!(decisions[0].position_size_usd, DEFAULT_POSITION_FRACTION * 10_000.0);
    }

    #[test]
    fn consensus_drops_symbol_below_confidence_floor() {
        let votes = vec![Vote {
            participant_id: Uuid::new_v4(),
            decisions: vec![decision("ETHUSDT", Action::OpenShort, 10)],
        }];
        let decisions = compute_consensus(&votes, 10_000.0);
        assert!(decisions.is_empty());
    }

    #[test]
    fn truncate_is_char_boundary_safe() {
        let s = "é".repeat(400);
        let out = truncate(&s, PRIOR_MESSAGE_TRUNCATE);
        assert!(out.len() <= PRIOR_MESSAGE_TRUNCATE + "…".len() + 1);
    }
}
