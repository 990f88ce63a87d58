//! HuggingFace Inference API embedding provider
//!
//! Serverless inference endpoints return 503 with an `estimated_time` while
//! a cold model loads. With `wait_for_model` enabled the client polls on
//! that documented response until the model is ready.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{classify_status, EmbedError, EmbeddingProvider, InputKind};
use crate::error::SemanticError;

const DEFAULT_URL: &str = "https://api-inference.huggingface.co/models";
const DEFAULT_MODEL: &str = "sentence-transformers/all-MiniLM-L6-v2";
const BATCH_LIMIT: usize = 32;
/// Maximum loading polls before giving up.
const MAX_LOAD_POLLS: u32 = 5;
/// Cap on the server-suggested wait between polls.
const MAX_POLL_WAIT_SECS: f64 = 30.0;

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    inputs: &'a [String],
    options: EmbedOptions,
}

#[derive(Debug, Serialize)]
struct EmbedOptions {
    wait_for_model: bool,
}

#[derive(Debug, Deserialize)]
struct LoadingResponse {
    #[allow(dead_code)]
    error: String,
    #[serde(default)]
    estimated_time: f64,
}

pub struct HuggingFaceProvider {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    wait_for_model: bool,
}

impl HuggingFaceProvider {
    pub fn new(
        base_url: Option<&str>,
        model: Option<&str>,
        api_key: Option<String>,
        wait_for_model: bool,
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
            wait_for_model,
        })
    }

    async fn request_once(&self, texts: &[String]) -> Result<reqwest::Response, EmbedError> {
        let request = EmbedRequest {
            inputs: texts,
            options: EmbedOptions {
                wait_for_model: self.wait_for_model,
            },
        };
        let mut req = self
            .client
            .post(format!("{}/{}", self.base_url, self.model))
            .json(&request);
        if let Some(ref key) = self.api_key {
            req = req.header("Authorization", format!("Bearer {}", key));
        }
        req.send()
            .await
            .map_err(|e| EmbedError::Provider(format!("huggingface request failed: {}", e)))
    }
}

#[async_trait]
impl EmbeddingProvider for HuggingFaceProvider {
    fn name(&self) -> &'static str {
        "huggingface"
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
        _kind: InputKind,
    ) -> Result<Vec<Vec<f32>>, EmbedError> {
        let mut polls = 0u32;
        loop {
            let response = self.request_once(texts).await?;
            let status = response.status();
            let body = response
                .text()
                .await
                .map_err(|e| EmbedError::Provider(format!("failed to read response body: {}", e)))?;

            if status == reqwest::StatusCode::SERVICE_UNAVAILABLE {
                // Model still loading; the body carries the suggested wait
                if let Ok(loading) = serde_json::from_str::<LoadingResponse>(&body) {
                    if self.wait_for_model && polls < MAX_LOAD_POLLS {
                        let wait = loading.estimated_time.clamp(0.1, MAX_POLL_WAIT_SECS);
                        tracing::info!(
                            model = %self.model,
                            wait_secs = wait,
                            poll = polls + 1,
                            "Model loading, waiting"
                        );
                        tokio::time::sleep(std::time::Duration::from_secs_f64(wait)).await;
                        polls += 1;
                        continue;
                    }
                }
                return Err(EmbedError::Provider(format!(
                    "model not ready: {}",
                    body.trim()
                )));
            }

            if !status.is_success() {
                return Err(classify_status(status, &body));
            }

            // Feature-extraction on sentence-transformers returns one vector
            // per input
            let vectors: Vec<Vec<f32>> = serde_json::from_str(&body)
                .map_err(|e| EmbedError::InvalidResponse(format!("huggingface: {}", e)))?;
            if vectors.len() != texts.len() {
                return Err(EmbedError::InvalidResponse(format!(
                    "huggingface returned {} embeddings for {} inputs",
                    vectors.len(),
                    texts.len()
                )));
            }
            return Ok(vectors);
        }
    }
}
