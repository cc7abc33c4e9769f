//! Risk management: account-level circuit breakers, per-position overrides,
//! and the pure decision validator (spec §4.1 step 6, §4.3).

pub mod circuit;
pub mod overrides;
pub mod validator;

pub use circuit::{GateDecision, RiskEngine, RiskState};
pub use validator::{validate_decision, ValidationConfig, ValidationError};
