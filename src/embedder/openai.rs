//! OpenAI-compatible embedding provider
//!
//! Covers every server speaking the `/embeddings` wire shape: OpenAI itself,
//! Azure deployments, Ollama's `/v1` endpoint, vLLM, and OpenRouter (which
//! reuses this client with its own defaults).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{classify_status, EmbedError, EmbeddingProvider, InputKind};
use crate::error::SemanticError;

pub const DEFAULT_OPENAI_URL: &str = "http://localhost:11434/v1";
pub const DEFAULT_OPENAI_MODEL: &str = "nomic-embed-text";
pub const DEFAULT_OPENROUTER_URL: &str = "https://openrouter.ai/api/v1";
pub const DEFAULT_OPENROUTER_MODEL: &str = "openai/text-embedding-3-small";

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    #[serde(default)]
    index: usize,
}

pub struct OpenAiCompatibleProvider {
    name: &'static str,
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

impl OpenAiCompatibleProvider {
    pub fn new(
        name: &'static str,
        base_url: &str,
        model: &str,
        api_key: Option<String>,
        timeout: std::time::Duration,
    ) -> Result<Self, SemanticError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| {
                SemanticError::new(crate::error::ErrorKind::Provider, e.to_string())
            })?;
        Ok(Self {
            name,
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiCompatibleProvider {
    fn name(&self) -> &'static str {
        self.name
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn embed_batch(
        &self,
        texts: &[String],
        _kind: InputKind,
    ) -> Result<Vec<Vec<f32>>, EmbedError> {
        let request = EmbeddingRequest {
            model: &self.model,
            input: texts,
        };

        let mut req = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .json(&request);
        if let Some(ref key) = self.api_key {
            req = req.header("Authorization", format!("Bearer {}", key));
        }

        let response = req
            .send()
            .await
            .map_err(|e| EmbedError::Provider(format!("{} request failed: {}", self.name, e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| EmbedError::Provider(format!("failed to read response body: {}", e)))?;

        if !status.is_success() {
            return Err(classify_status(status, &body));
        }

        let parsed: EmbeddingResponse = serde_json::from_str(&body)
            .map_err(|e| EmbedError::InvalidResponse(format!("{}: {}", self.name, e)))?;

        if parsed.data.len() != texts.len() {
            return Err(EmbedError::InvalidResponse(format!(
                "{} returned {} embeddings for {} inputs",
                self.name,
                parsed.data.len(),
                texts.len()
            )));
        }

        // The API documents index-annotated results; re-sort to input order
        let mut data = parsed.data;
        data.sort_by_key(|d| d.index);
        Ok(data.into_iter().map(|d| d.embedding).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    fn provider(server: &MockServer) -> OpenAiCompatibleProvider {
        OpenAiCompatibleProvider::new(
            "openai",
            &server.base_url(),
            "m",
            Some("key".into()),
            std::time::Duration::from_secs(5),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_bearer_header_and_body_shape() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/embeddings")
                    .header("Authorization", "Bearer key")
                    .json_body_partial("{\"model\": \"m\", \"input\": [\"hello\"]}");
                then.status(200).json_body(serde_json::json!({
                    "data": [{"embedding": [0.1, 0.2], "index": 0}]
                }));
            })
            .await;

        let out = provider(&server)
            .embed_batch(&["hello".to_string()], InputKind::Document)
            .await
            .unwrap();
        assert_eq!(out, vec![vec![0.1, 0.2]]);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_count_mismatch_is_invalid_response() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/embeddings");
                then.status(200).json_body(serde_json::json!({"data": []}));
            })
            .await;
        let err = provider(&server)
            .embed_batch(&["a".to_string()], InputKind::Document)
            .await
            .unwrap_err();
        assert!(matches!(err, EmbedError::InvalidResponse(_)));
    }
}
