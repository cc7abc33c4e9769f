// =============================================================================
// Decision Pipeline orchestration
// =============================================================================
//
// `make_decision` is the one call site shared verbatim between live trading
// (Engine) and the Backtest Runner — any divergence between how the two
// callers build prompts or parse responses is a bug.
// =============================================================================

use std::time::Instant;

use chrono::Utc;
use tracing::instrument;

use crate::decision::extractor::extract_full_decision;
use crate::decision::prompt::{build_system_prompt, build_user_prompt, PromptContext};
use crate::decision::types::FullDecision;
use crate::llm::client::{LlmClient, LlmMessage, LlmRequest};
use crate::strategy_config::{PromptLanguage, StrategyConfig};

/// Build prompts, call the LLM, and run response extraction. Never returns
/// an `Err` for model malformation — that degrades to the safe-fallback
/// decision inside the extractor. An `Err` here means the LLM call itself
/// failed (after the client's internal retries are exhausted).
#[instrument(skip(client, strategy, ctx))]
pub async fn make_decision(
    client: &LlmClient,
    strategy: &StrategyConfig,
    ctx: &PromptContext<'_>,
) -> anyhow::Result<FullDecision> {
    let system_prompt = build_system_prompt(strategy);
    let user_prompt = build_user_prompt(ctx, strategy.ai.language);

    let request = LlmRequest {
        model: strategy.ai.decision_model.clone(),
        messages: vec![
            LlmMessage::system(system_prompt.clone()),
            LlmMessage::user(user_prompt.clone()),
        ],
        temperature: 0.2,
        max_tokens: 2048,
        stream: false,
    };

    let started = Instant::now();
    let response = client.complete(&request).await?;
    let request_duration_ms = started.elapsed().as_millis() as u64;

    let (decisions, extracted_reasoning) = extract_full_decision(&response.content);
    let reasoning_trace = response.reasoning.unwrap_or(extracted_reasoning);

    Ok(FullDecision {
        system_prompt,
        user_prompt,
        raw_response: response.content,
        reasoning_trace,
        decisions,
        request_duration_ms,
        timestamp: Utc::now(),
    })
}

/// Convenience accessor used by call sites that only care about language,
/// not the rest of the strategy config (e.g. the SmartFind refresh prompt).
pub fn language_of(strategy: &StrategyConfig) -> PromptLanguage {
    strategy.ai.language
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn language_of_reads_ai_config() {
        let cfg = StrategyConfig::default();
        assert_eq!(language_of(&cfg), PromptLanguage::English);
    }
}
