//! Uniform LLM client abstraction (spec §2 row B, §4.2, §6).

pub mod client;

pub use client::{LlmClient, LlmMessage, LlmRequest, LlmResponse};
