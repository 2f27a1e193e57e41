use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use super::{LlmError, LlmService};

/// Client for the local Ollama HTTP API.
///
/// One instance is configured per model role; the pipeline builds four of
/// these (extractor, doctrine, embedding, glyph repair).
pub struct OllamaClient {
    client: Client,
    base_url: String,
    model: String,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Serialize)]
struct GenerateOptions {
    temperature: f32,
    num_predict: i32,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: EmbedInput<'a>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum EmbedInput<'a> {
    Single(&'a str),
    Batch(&'a [String]),
}

/// Ollama has returned both shapes across versions; accept either.
#[derive(Deserialize)]
struct EmbedResponse {
    #[serde(default)]
    embeddings: Option<Vec<Vec<f32>>>,
    #[serde(default)]
    embedding: Option<Vec<f32>>,
}

impl OllamaClient {
    pub fn new(base_url: &str, model: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
        }
    }

    #[allow(dead_code)]
    pub fn model(&self) -> &str {
        &self.model
    }

    fn classify_send_error(e: reqwest::Error, timeout: Duration) -> LlmError {
        if e.is_timeout() {
            LlmError::Timeout(timeout)
        } else {
            LlmError::Transport(e.to_string())
        }
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, LlmError> {
        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::SERVICE_UNAVAILABLE {
            return Err(LlmError::RateLimited);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Http {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn embed_request(
        &self,
        input: EmbedInput<'_>,
        timeout: Duration,
    ) -> Result<EmbedResponse, LlmError> {
        let request = EmbedRequest {
            model: &self.model,
            input,
        };

        let response = self
            .client
            .post(format!("{}/api/embed", self.base_url))
            .timeout(timeout)
            .json(&request)
            .send()
            .await
            .map_err(|e| Self::classify_send_error(e, timeout))?;

        let response = Self::check_status(response).await?;
        response
            .json::<EmbedResponse>()
            .await
            .map_err(|e| LlmError::Transport(e.to_string()))
    }
}

#[async_trait]
impl LlmService for OllamaClient {
    async fn generate(
        &self,
        system: Option<&str>,
        prompt: &str,
        timeout: Duration,
    ) -> Result<String, LlmError> {
        let request = GenerateRequest {
            model: &self.model,
            prompt,
            system,
            stream: false,
            options: GenerateOptions {
                temperature: 0.0,
                num_predict: 4096,
            },
        };

        let response = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .timeout(timeout)
            .json(&request)
            .send()
            .await
            .map_err(|e| Self::classify_send_error(e, timeout))?;

        let response = Self::check_status(response).await?;
        let body: GenerateResponse = response
            .json()
            .await
            .map_err(|e| LlmError::Transport(e.to_string()))?;

        Ok(body.response)
    }

    async fn embed(&self, text: &str, timeout: Duration) -> Result<Vec<f32>, LlmError> {
        let body = self.embed_request(EmbedInput::Single(text), timeout).await?;
        if let Some(single) = body.embedding {
            return Ok(single);
        }
        body.embeddings
            .and_then(|mut v| if v.is_empty() { None } else { Some(v.remove(0)) })
            .ok_or_else(|| LlmError::InvalidJson("embed response had no vector".into()))
    }

    async fn embed_batch(
        &self,
        texts: &[String],
        timeout: Duration,
    ) -> Result<Vec<Vec<f32>>, LlmError> {
        if texts.is_empty() {
            return Ok(vec![]);
        }
        let body = self.embed_request(EmbedInput::Batch(texts), timeout).await?;
        let vectors = match (body.embeddings, body.embedding) {
            (Some(batch), _) => batch,
            (None, Some(single)) => vec![single],
            (None, None) => {
                return Err(LlmError::InvalidJson("embed response had no vectors".into()));
            }
        };
        if vectors.len() != texts.len() {
            return Err(LlmError::InvalidJson(format!(
                "embed batch size mismatch: sent {}, got {}",
                texts.len(),
                vectors.len()
            )));
        }
        Ok(vectors)
    }

    fn name(&self) -> &'static str {
        "ollama"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let client = OllamaClient::new("http://localhost:11434/", "nomic-embed-text");
        assert_eq!(client.base_url, "http://localhost:11434");
        assert_eq!(client.model(), "nomic-embed-text");
    }

    #[test]
    fn test_embed_response_both_shapes() {
        let batched: EmbedResponse =
            serde_json::from_str(r#"{"embeddings":[[0.1,0.2],[0.3,0.4]]}"#).unwrap();
        assert_eq!(batched.embeddings.unwrap().len(), 2);

        let single: EmbedResponse = serde_json::from_str(r#"{"embedding":[0.5,0.6]}"#).unwrap();
        assert_eq!(single.embedding.unwrap(), vec![0.5, 0.6]);
    }

    #[test]
    fn test_embed_input_serialization() {
        let single = serde_json::to_value(EmbedInput::Single("hello")).unwrap();
        assert_eq!(single, serde_json::json!("hello"));

        let texts = vec!["a".to_string(), "b".to_string()];
        let batch = serde_json::to_value(EmbedInput::Batch(&texts)).unwrap();
        assert_eq!(batch, serde_json::json!(["a", "b"]));
    }
}
