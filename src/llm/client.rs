// =============================================================================
// LLM Client — uniform request interface over multiple providers (spec §4.2)
// =============================================================================
//
// Retries are encapsulated here so callers (the Decision Pipeline, the
// Debate Orchestrator) never observe transient failures directly (spec §9
// "Retries and backoff are encapsulated in the LLM client").
// =============================================================================

use anyhow::{Context, Result};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{instrument, warn};

/// Per-call timeout: the spec's default of three minutes.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(180);
/// Exponential backoff schedule applied between retries: 2s, 4s, 8s.
const BACKOFF_SCHEDULE_SECS: [u64; 3] = [2, 4, 8];
const MAX_RETRIES: usize = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmMessage {
    pub role: String,
    pub content: String,
}

impl LlmMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LlmRequest {
    pub model: String,
    pub messages: Vec<LlmMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub stream: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmResponse {
    pub content: String,
    #[serde(default)]
    pub reasoning: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
    #[serde(default)]
    reasoning: Option<String>,
}

/// One `data: {...}` frame of a `stream: true` chat-completions response.
#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    choices: Vec<ChatChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChunkChoice {
    delta: ChatDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ChatDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning: Option<String>,
}

/// Uniform client over a `/chat/completions`-style endpoint (spec §6).
pub struct LlmClient {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl LlmClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .expect("failed to build reqwest client");
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            client,
        }
    }

    /// Send a completion request, retrying transient failures with
    /// exponential backoff (2s, 4s, 8s) up to three times.
    #[instrument(skip(self, request), fields(model = %request.model))]
    pub async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse> {
        let mut last_err = None;

        for attempt in 0..=MAX_RETRIES {
            match self.try_complete(request).await {
                Ok(resp) => return Ok(resp),
                Err(err) => {
                    let retryable = is_retryable(&err);
                    if !retryable || attempt == MAX_RETRIES {
                        return Err(err);
                    }
                    let delay = BACKOFF_SCHEDULE_SECS[attempt.min(BACKOFF_SCHEDULE_SECS.len() - 1)];
                    warn!(attempt, delay_secs = delay, error = %err, "LLM call failed, retrying");
                    tokio::time::sleep(Duration::from_secs(delay)).await;
                    last_err = Some(err);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("LLM call failed with no recorded error")))
    }

    async fn try_complete(&self, request: &LlmRequest) -> Result<LlmResponse> {
        if request.stream {
            self.try_complete_streamed(request).await
        } else {
            self.try_complete_buffered(request).await
        }
    }

    async fn try_complete_buffered(&self, request: &LlmRequest) -> Result<LlmResponse> {
        let resp = self.post(request).await?;
        let body: ChatCompletionResponse = resp.json().await.context("failed to parse LLM response")?;
        let choice = body
            .choices
            .into_iter()
            .next()
            .context("LLM response contained no choices")?;

        Ok(LlmResponse {
            content: choice.message.content,
            reasoning: choice.message.reasoning,
        })
    }

    /// Consume a `stream: true` chat-completions response as successive
    /// `data: {...}` SSE frames, accumulating each delta's `content`/
    /// `reasoning` into the final `LlmResponse` (spec §2 row B "uniform
    /// request/stream interface", §4.1/§4.2).
    async fn try_complete_streamed(&self, request: &LlmRequest) -> Result<LlmResponse> {
        let resp = self.post(request).await?;

        let mut content = String::new();
        let mut reasoning = String::new();
        let mut buf = String::new();
        let mut bytes = resp.bytes_stream();

        while let Some(chunk) = bytes.next().await {
            let chunk = chunk.context("LLM stream read failed")?;
            buf.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(event_end) = buf.find("\n\n") {
                let event: String = buf.drain(..event_end + 2).collect();
                for line in event.lines() {
                    let Some(data) = line.strip_prefix("data: ") else { continue };
                    if data == "[DONE]" {
                        continue;
                    }
                    match serde_json::from_str::<ChatCompletionChunk>(data) {
                        Ok(parsed) => {
                            if let Some(choice) = parsed.choices.into_iter().next() {
                                if let Some(c) = choice.delta.content {
                                    content.push_str(&c);
                                }
                                if let Some(r) = choice.delta.reasoning {
                                    reasoning.push_str(&r);
                                }
                            }
                        }
                        Err(err) => warn!(error = %err, "skipping malformed LLM stream chunk"),
                    }
                }
            }
        }

        Ok(LlmResponse {
            content,
            reasoning: if reasoning.is_empty() { None } else { Some(reasoning) },
        })
    }

    async fn post(&self, request: &LlmRequest) -> Result<reqwest::Response> {
        let url = format!("{}/chat/completions", self.base_url);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await
            .context("LLM request failed")?;

        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!(LlmError::Http(status.as_u16()));
        }
        Ok(resp)
    }
}

#[derive(Debug, thiserror::Error)]
enum LlmError {
    #[error("LLM endpoint returned HTTP {0}")]
    Http(u16),
}

/// Transient network errors and HTTP {429, 502, 503, 504} are retryable;
/// everything else (4xx other than 429, malformed response body) is not.
fn is_retryable(err: &anyhow::Error) -> bool {
    if let Some(LlmError::Http(status)) = err.downcast_ref::<LlmError>() {
        return matches!(status, 429 | 502 | 503 | 504);
    }
    if let Some(reqwest_err) = err.downcast_ref::<reqwest::Error>() {
        return reqwest_err.is_timeout() || reqwest_err.is_connect();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_429_and_5xx_are_retryable() {
        assert!(is_retryable(&anyhow::anyhow!(LlmError::Http(429))));
        assert!(is_retryable(&anyhow::anyhow!(LlmError::Http(502))));
        assert!(is_retryable(&anyhow::anyhow!(LlmError::Http(503))));
        assert!(is_retryable(&anyhow::anyhow!(LlmError::Http(504))));
        assert!(!is_retryable(&anyhow::anyhow!(LlmError::Http(400))));
        assert!(!is_retryable(&anyhow::anyhow!(LlmError::Http(401))));
    }

    #[test]
    fn message_constructors_set_roles() {
        let sys = LlmMessage::system("be terse");
        assert_eq!(sys.role, "system");
        let user = LlmMessage::user("hello");
        assert_eq!(user.role, "user");
    }

    #[test]
    fn stream_chunk_deltas_parse_content_and_reasoning() {
        let chunk: ChatCompletionChunk =
            serde_json::from_str(r#"{"choices":[{"delta":{"content":"hel","reasoning":"because"}}]}"#).unwrap();
        let delta = &chunk.choices[0].delta;
        assert_eq!(delta.content.as_deref(), Some("hel"));
        assert_eq!(delta.reasoning.as_deref(), Some("because"));
    }

    #[test]
    fn stream_chunk_with_no_fields_defaults_to_none() {
        let chunk: ChatCompletionChunk = serde_json::from_str(r#"{"choices":[{"delta":{}}]}"#).unwrap();
        assert!(chunk.choices[0].delta.content.is_none());
        assert!(chunk.choices[0].delta.reasoning.is_none());
    }
}
