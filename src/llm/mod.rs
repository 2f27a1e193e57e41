pub mod ollama;
pub(crate) mod parsing;
pub mod prompts;

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Error variants for LLM traffic.
///
/// Retry and fallback policies dispatch on these values instead of catching
/// generic errors: rate limits back off, timeouts and transport errors
/// retry, invalid JSON falls back to a safe default decision.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("rate limited by LLM service")]
    RateLimited,

    #[error("LLM call timed out after {0:?}")]
    Timeout(Duration),

    #[error("LLM returned unparseable JSON: {0}")]
    InvalidJson(String),

    #[error("LLM service error ({status}): {body}")]
    Http { status: u16, body: String },

    #[error("LLM transport error: {0}")]
    Transport(String),
}

impl LlmError {
    /// Transient errors are worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LlmError::RateLimited | LlmError::Timeout(_) | LlmError::Transport(_)
        )
    }
}

/// The seam between the pipeline and the local LLM service.
///
/// One client instance is configured per model role (extractor, doctrine,
/// embedding, glyph repair); consumers program against this trait so tests
/// can substitute deterministic stubs.
#[async_trait]
pub trait LlmService: Send + Sync {
    /// Plain text completion.
    async fn generate(
        &self,
        system: Option<&str>,
        prompt: &str,
        timeout: Duration,
    ) -> Result<String, LlmError>;

    /// Embed a single text.
    async fn embed(&self, text: &str, timeout: Duration) -> Result<Vec<f32>, LlmError>;

    /// Embed a batch of texts in one request. Must return one vector per
    /// input, in input order.
    async fn embed_batch(
        &self,
        texts: &[String],
        timeout: Duration,
    ) -> Result<Vec<Vec<f32>>, LlmError>;

    fn name(&self) -> &'static str;
}

/// Call the LLM and parse a single JSON object from its output.
///
/// Markdown fences and surrounding prose are tolerated; anything that still
/// fails to parse is an `InvalidJson` error carrying the raw output.
pub async fn generate_json(
    client: &dyn LlmService,
    system: &str,
    prompt: &str,
    timeout: Duration,
) -> Result<Value, LlmError> {
    let raw = client.generate(Some(system), prompt, timeout).await?;
    parsing::parse_json_object(&raw).ok_or_else(|| LlmError::InvalidJson(truncate(&raw, 400)))
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(LlmError::RateLimited.is_transient());
        assert!(LlmError::Timeout(Duration::from_secs(60)).is_transient());
        assert!(LlmError::Transport("connection reset".into()).is_transient());
        assert!(!LlmError::InvalidJson("{".into()).is_transient());
        assert!(
            !LlmError::Http {
                status: 500,
                body: "oops".into()
            }
            .is_transient()
        );
    }

    #[test]
    fn test_truncate_short_passthrough() {
        assert_eq!(truncate("abc", 10), "abc");
        assert_eq!(truncate("abcdef", 3), "abc");
    }
}
