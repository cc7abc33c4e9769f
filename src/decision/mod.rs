//! Decision Pipeline: prompt assembly, LLM call, response extraction, and
//! validation.

pub mod extractor;
pub mod pipeline;
pub mod prompt;
pub mod types;

pub use pipeline::make_decision;
pub use types::{Decision, FullDecision};
