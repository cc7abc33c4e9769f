pub mod orchestrator;
pub mod types;

pub use orchestrator::{compute_consensus, DebateManager, DebateSessionHandle};
pub use types::{DebateMessage, DebateSession, Participant, Personality, SessionStatus, Vote};
