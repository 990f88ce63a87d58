//! Cohere embedding provider

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{classify_status, EmbedError, EmbeddingProvider, InputKind};
use crate::error::SemanticError;

const DEFAULT_URL: &str = "https://api.cohere.com/v1";
const DEFAULT_MODEL: &str = "embed-english-v3.0";
/// Cohere's documented per-request text limit.
const BATCH_LIMIT: usize = 96;

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    texts: &'a [String],
    input_type: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

pub struct CohereProvider {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

impl CohereProvider {
    pub fn new(
        base_url: Option<&str>,
        model: Option<&str>,
        api_key: Option<String>,
        timeout: std::time::Duration,
    ) -> Result<Self, SemanticError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SemanticError::new(crate::error::ErrorKind::Provider, e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.unwrap_or(DEFAULT_URL).trim_end_matches('/').to_string(),
            model: model.unwrap_or(DEFAULT_MODEL).to_string(),
            api_key,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for CohereProvider {
    fn name(&self) -> &'static str {
        "cohere"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn batch_limit(&self) -> usize {
        BATCH_LIMIT
    }

    async fn embed_batch(
        &self,
        texts: &[String],
        kind: InputKind,
    ) -> Result<Vec<Vec<f32>>, EmbedError> {
        // Cohere v3 models require the input type to match the use
        let input_type = match kind {
            InputKind::Document => "search_document",
            InputKind::Query => "search_query",
        };
        let request = EmbedRequest {
            model: &self.model,
            texts,
            input_type,
        };

        let mut req = self
            .client
            .post(format!("{}/embed", self.base_url))
            .json(&request);
        if let Some(ref key) = self.api_key {
            req = req.header("Authorization", format!("Bearer {}", key));
        }

        let response = req
            .send()
            .await
            .map_err(|e| EmbedError::Provider(format!("cohere request failed: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| EmbedError::Provider(format!("failed to read response body: {}", e)))?;

        if !status.is_success() {
            return Err(classify_status(status, &body));
        }

        let parsed: EmbedResponse = serde_json::from_str(&body)
            .map_err(|e| EmbedError::InvalidResponse(format!("cohere: {}", e)))?;

        if parsed.embeddings.len() != texts.len() {
            return Err(EmbedError::InvalidResponse(format!(
                "cohere returned {} embeddings for {} inputs",
                parsed.embeddings.len(),
                texts.len()
            )));
        }
        Ok(parsed.embeddings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    #[tokio::test]
    async fn test_input_type_varies_by_kind() {
        let server = MockServer::start_async().await;
        let doc_mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/embed")
                    .json_body_partial("{\"input_type\": \"search_document\"}");
                then.status(200)
                    .json_body(serde_json::json!({"embeddings": [[0.1]]}));
            })
            .await;
        let query_mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/embed")
                    .json_body_partial("{\"input_type\": \"search_query\"}");
                then.status(200)
                    .json_body(serde_json::json!({"embeddings": [[0.2]]}));
            })
            .await;

        let provider = CohereProvider::new(
            Some(&server.base_url()),
            None,
            Some("k".into()),
            std::time::Duration::from_secs(5),
        )
        .unwrap();

        provider
            .embed_batch(&["a".to_string()], InputKind::Document)
            .await
            .unwrap();
        provider
            .embed_batch(&["a".to_string()], InputKind::Query)
            .await
            .unwrap();
        doc_mock.assert_async().await;
        query_mock.assert_async().await;
    }

    #[test]
    fn test_defaults() {
        let provider =
            CohereProvider::new(None, None, None, std::time::Duration::from_secs(5)).unwrap();
        assert_eq!(provider.model(), DEFAULT_MODEL);
        assert_eq!(provider.batch_limit(), 96);
    }
}
