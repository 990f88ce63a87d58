//! Remote embedding providers
//!
//! Embedding is always an HTTP call to a remote model server. Each provider
//! implements the async [`EmbeddingProvider`] trait over `reqwest`; the
//! [`Embedder`] facade owns a tokio runtime and exposes the synchronous API
//! the rest of the crate uses, adding retries with exponential backoff, an
//! order-preserving batch pipeline with bounded fan-out, a dimension probe,
//! and an LRU cache for query embeddings.
//!
//! Vectors are L2-normalised before they leave this module, so cosine
//! similarity downstream is a plain dot product.

mod cohere;
mod huggingface;
mod openai;

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, OnceLock};

use async_trait::async_trait;
use lru::LruCache;
use thiserror::Error;
use tokio::runtime::Runtime;

use crate::error::{ErrorKind, SemanticError};
use crate::storage::normalize_l2;

pub use cohere::CohereProvider;
pub use huggingface::HuggingFaceProvider;
pub use openai::OpenAiCompatibleProvider;

/// Default request timeout per embedding call.
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;
/// Default retry attempts for retryable provider failures.
pub const DEFAULT_RETRIES: u32 = 3;
/// Base delay for exponential backoff.
const BACKOFF_BASE_MS: u64 = 500;
/// Concurrent batch requests in flight per embed call.
const BATCH_FANOUT: usize = 4;
/// Query-embedding cache entries.
const QUERY_CACHE_SIZE: usize = 128;

#[derive(Error, Debug)]
pub enum EmbedError {
    #[error("Provider authentication failed: {0}")]
    Auth(String),
    #[error("Provider request failed: {0}")]
    Provider(String),
    #[error("Unexpected provider response: {0}")]
    InvalidResponse(String),
    #[error("Embedding dimension changed mid-run: expected {expected}, got {actual}")]
    DimensionDrift { expected: usize, actual: usize },
    #[error("Query cannot be empty")]
    EmptyQuery,
    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl EmbedError {
    fn is_retryable(&self) -> bool {
        matches!(self, EmbedError::Provider(_))
    }
}

impl From<EmbedError> for SemanticError {
    fn from(e: EmbedError) -> Self {
        let kind = match e {
            EmbedError::Auth(_) => ErrorKind::Auth,
            _ => ErrorKind::Provider,
        };
        let mut err = SemanticError::new(kind, e.to_string());
        if kind == ErrorKind::Auth {
            err = err.with_hint(
                "Check the provider API key (--api-key or the provider's environment variable)",
            );
        }
        err
    }
}

/// Whether the text is indexed content or a search query (providers such as
/// Cohere embed the two differently).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    Document,
    Query,
}

/// One remote embedding provider.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn name(&self) -> &'static str;
    fn model(&self) -> &str;
    /// Documented batch size limit for one request.
    fn batch_limit(&self) -> usize {
        64
    }
    /// Embed a batch. The returned vectors MUST be in input order.
    async fn embed_batch(
        &self,
        texts: &[String],
        kind: InputKind,
    ) -> Result<Vec<Vec<f32>>, EmbedError>;
}

/// Provider selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbedderKind {
    OpenAi,
    Cohere,
    HuggingFace,
    OpenRouter,
}

impl std::str::FromStr for EmbedderKind {
    type Err = SemanticError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "openai" | "openai-compatible" | "ollama" | "vllm" | "azure" => Ok(EmbedderKind::OpenAi),
            "cohere" => Ok(EmbedderKind::Cohere),
            "huggingface" | "hf" => Ok(EmbedderKind::HuggingFace),
            "openrouter" => Ok(EmbedderKind::OpenRouter),
            other => Err(SemanticError::invalid_input(format!(
                "unknown embedder: '{}'",
                other
            ))
            .with_hint("Available embedders: openai, cohere, huggingface, openrouter")),
        }
    }
}

/// Construction options, already merged from flags and config by the caller.
/// Unset fields fall back to env vars and then provider defaults.
#[derive(Debug, Clone, Default)]
pub struct EmbedderOptions {
    pub api_url: Option<String>,
    pub model: Option<String>,
    pub api_key: Option<String>,
    /// HuggingFace: poll while the model is loading instead of failing
    pub wait_for_model: bool,
    pub timeout_secs: Option<u64>,
    pub retries: Option<u32>,
}

/// Resolve an API key: explicit flag > provider-specific env > generic env.
fn resolve_api_key(explicit: Option<&str>, provider_envs: &[&str]) -> Option<String> {
    if let Some(key) = explicit.filter(|k| !k.is_empty()) {
        return Some(key.to_string());
    }
    for env in provider_envs {
        if let Ok(key) = std::env::var(env) {
            if !key.is_empty() {
                return Some(key);
            }
        }
    }
    std::env::var("LLM_SEMANTIC_API_KEY").ok().filter(|k| !k.is_empty())
}

fn env_or(explicit: Option<String>, env: &str) -> Option<String> {
    explicit
        .filter(|v| !v.is_empty())
        .or_else(|| std::env::var(env).ok().filter(|v| !v.is_empty()))
}

/// The synchronous embedding capability the indexer, searcher, and memory
/// store consume. [`Embedder`] is the production implementation; tests use
/// deterministic in-process doubles.
pub trait TextEmbedder: Send + Sync {
    /// Determine (and cache) the output dimension by embedding `test`.
    fn probe(&self) -> Result<usize, EmbedError>;
    fn model(&self) -> String;
    fn provider_name(&self) -> &'static str;
    fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbedError>;
    fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError>;
}

/// Synchronous facade over a remote embedding provider.
pub struct Embedder {
    provider: Arc<dyn EmbeddingProvider>,
    rt: Runtime,
    dim: OnceLock<usize>,
    retries: u32,
    query_cache: Mutex<LruCache<String, Vec<f32>>>,
}

impl Embedder {
    pub fn new(kind: EmbedderKind, opts: EmbedderOptions) -> Result<Self, SemanticError> {
        let timeout = std::time::Duration::from_secs(
            opts.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS),
        );
        let api_url = env_or(opts.api_url.clone(), "LLM_SEMANTIC_API_URL");
        let model = env_or(opts.model.clone(), "LLM_SEMANTIC_MODEL");

        let provider: Arc<dyn EmbeddingProvider> = match kind {
            EmbedderKind::OpenAi => Arc::new(OpenAiCompatibleProvider::new(
                "openai",
                api_url.as_deref().unwrap_or(openai::DEFAULT_OPENAI_URL),
                model.as_deref().unwrap_or(openai::DEFAULT_OPENAI_MODEL),
                resolve_api_key(opts.api_key.as_deref(), &["OPENAI_API_KEY"]),
                timeout,
            )?),
            EmbedderKind::OpenRouter => Arc::new(OpenAiCompatibleProvider::new(
                "openrouter",
                api_url.as_deref().unwrap_or(openai::DEFAULT_OPENROUTER_URL),
                model.as_deref().unwrap_or(openai::DEFAULT_OPENROUTER_MODEL),
                resolve_api_key(opts.api_key.as_deref(), &["OPENROUTER_API_KEY"]),
                timeout,
            )?),
            EmbedderKind::Cohere => Arc::new(CohereProvider::new(
                api_url.as_deref(),
                model.as_deref(),
                resolve_api_key(opts.api_key.as_deref(), &["COHERE_API_KEY"]),
                timeout,
            )?),
            EmbedderKind::HuggingFace => Arc::new(HuggingFaceProvider::new(
                api_url.as_deref(),
                model.as_deref(),
                resolve_api_key(
                    opts.api_key.as_deref(),
                    &["HUGGING_FACE_API_KEY", "HUGGINGFACE_API_KEY", "HF_TOKEN"],
                ),
                opts.wait_for_model,
                timeout,
            )?),
        };

        let rt = Runtime::new()
            .map_err(|e| SemanticError::new(ErrorKind::Provider, e.to_string()))?;

        Ok(Self {
            provider,
            rt,
            dim: OnceLock::new(),
            retries: opts.retries.unwrap_or(DEFAULT_RETRIES),
            query_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(QUERY_CACHE_SIZE).expect("cache size is non-zero"),
            )),
        })
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.name()
    }

    pub fn model(&self) -> String {
        self.provider.model().to_string()
    }

    /// The vector dimension, once probed.
    pub fn dimension(&self) -> Option<usize> {
        self.dim.get().copied()
    }

    /// Probe the provider by embedding the literal string `test`.
    ///
    /// Determines the collection dimension; a probe failure is fatal for
    /// indexing and search.
    pub fn probe(&self) -> Result<usize, EmbedError> {
        if let Some(&dim) = self.dim.get() {
            return Ok(dim);
        }
        let vectors = self.embed_with_retry(&["test".to_string()], InputKind::Query)?;
        let dim = vectors
            .first()
            .map(|v| v.len())
            .filter(|&d| d > 0)
            .ok_or_else(|| {
                EmbedError::InvalidResponse("probe returned no embedding".to_string())
            })?;
        let _ = self.dim.set(dim);
        tracing::debug!(provider = self.provider.name(), model = %self.provider.model(), dim, "Embedder probed");
        Ok(dim)
    }

    /// Embed a search query (LRU-cached, normalised).
    pub fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(EmbedError::EmptyQuery);
        }

        {
            let mut cache = self
                .query_cache
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(cached) = cache.get(text) {
                return Ok(cached.clone());
            }
        }

        let mut vectors = self.embed_with_retry(&[text.to_string()], InputKind::Query)?;
        let vector = vectors
            .pop()
            .ok_or_else(|| EmbedError::InvalidResponse("empty embedding batch".to_string()))?;
        self.check_dim(&vector)?;

        let mut cache = self
            .query_cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        cache.put(text.to_string(), vector.clone());
        Ok(vector)
    }

    /// Embed documents in order, batched to the provider limit with up to
    /// four batches in flight. A batch that fails after retries is retried
    /// item-by-item before the whole call surfaces an error.
    pub fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        if texts.is_empty() {
            return Ok(vec![]);
        }
        let _span =
            tracing::info_span!("embed_documents", count = texts.len(), provider = self.provider.name())
                .entered();

        let limit = self.provider.batch_limit().max(1);
        let batches: Vec<(usize, Vec<String>)> = texts
            .chunks(limit)
            .enumerate()
            .map(|(i, chunk)| (i, chunk.to_vec()))
            .collect();

        let results = self.rt.block_on(async {
            let semaphore = Arc::new(tokio::sync::Semaphore::new(BATCH_FANOUT));
            let mut joins = tokio::task::JoinSet::new();

            for (batch_idx, batch) in batches {
                let provider = Arc::clone(&self.provider);
                let semaphore = Arc::clone(&semaphore);
                let retries = self.retries;
                joins.spawn(async move {
                    let _permit = semaphore
                        .acquire()
                        .await
                        .map_err(|e| EmbedError::Runtime(e.to_string()))?;
                    let result =
                        embed_batch_with_retry(provider.as_ref(), &batch, InputKind::Document, retries)
                            .await;
                    match result {
                        Ok(vectors) => Ok((batch_idx, vectors)),
                        Err(first_err) => {
                            // Per-item fallback: one oversized or malformed
                            // text shouldn't sink the whole batch
                            tracing::warn!(
                                error = %first_err,
                                batch = batch_idx,
                                size = batch.len(),
                                "Batch embed failed, retrying per item"
                            );
                            if !first_err.is_retryable() {
                                return Err(first_err);
                            }
                            let mut vectors = Vec::with_capacity(batch.len());
                            for text in &batch {
                                let single = embed_batch_with_retry(
                                    provider.as_ref(),
                                    std::slice::from_ref(text),
                                    InputKind::Document,
                                    retries,
                                )
                                .await?;
                                vectors.extend(single);
                            }
                            Ok((batch_idx, vectors))
                        }
                    }
                });
            }

            let mut collected: Vec<Option<Vec<Vec<f32>>>> = Vec::new();
            collected.resize_with(texts.len().div_ceil(limit), || None);
            while let Some(joined) = joins.join_next().await {
                let (idx, vectors) =
                    joined.map_err(|e| EmbedError::Runtime(e.to_string()))??;
                collected[idx] = Some(vectors);
            }
            Ok::<_, EmbedError>(collected)
        })?;

        let mut out = Vec::with_capacity(texts.len());
        for batch in results {
            let vectors = batch
                .ok_or_else(|| EmbedError::Runtime("missing embed batch result".to_string()))?;
            out.extend(vectors);
        }
        if out.len() != texts.len() {
            return Err(EmbedError::InvalidResponse(format!(
                "provider returned {} embeddings for {} inputs",
                out.len(),
                texts.len()
            )));
        }
        for vector in &out {
            self.check_dim(vector)?;
        }
        Ok(out)
    }

    fn check_dim(&self, vector: &[f32]) -> Result<(), EmbedError> {
        match self.dim.get() {
            Some(&dim) if dim != vector.len() => Err(EmbedError::DimensionDrift {
                expected: dim,
                actual: vector.len(),
            }),
            Some(_) => Ok(()),
            None => {
                let _ = self.dim.set(vector.len());
                Ok(())
            }
        }
    }

    fn embed_with_retry(
        &self,
        texts: &[String],
        kind: InputKind,
    ) -> Result<Vec<Vec<f32>>, EmbedError> {
        self.rt.block_on(embed_batch_with_retry(
            self.provider.as_ref(),
            texts,
            kind,
            self.retries,
        ))
    }
}

impl TextEmbedder for Embedder {
    fn probe(&self) -> Result<usize, EmbedError> {
        Embedder::probe(self)
    }

    fn model(&self) -> String {
        Embedder::model(self)
    }

    fn provider_name(&self) -> &'static str {
        Embedder::provider_name(self)
    }

    fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        Embedder::embed_query(self, text)
    }

    fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        Embedder::embed_documents(self, texts)
    }
}

/// Retry a provider call with exponential backoff. Auth and malformed
/// responses surface immediately; only transport-level failures retry.
async fn embed_batch_with_retry(
    provider: &dyn EmbeddingProvider,
    texts: &[String],
    kind: InputKind,
    retries: u32,
) -> Result<Vec<Vec<f32>>, EmbedError> {
    let normalized = |vectors: Vec<Vec<f32>>| -> Vec<Vec<f32>> {
        vectors.into_iter().map(normalize_l2).collect()
    };

    let mut attempt = 0u32;
    loop {
        match provider.embed_batch(texts, kind).await {
            Ok(vectors) => return Ok(normalized(vectors)),
            Err(e) if e.is_retryable() && attempt + 1 < retries.max(1) => {
                let delay = BACKOFF_BASE_MS * (1 << attempt.min(6));
                tracing::warn!(
                    provider = provider.name(),
                    attempt = attempt + 1,
                    delay_ms = delay,
                    error = %e,
                    "Embedding request failed, backing off"
                );
                tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Shared helper for providers: classify an HTTP error status.
pub(crate) fn classify_status(status: reqwest::StatusCode, body: &str) -> EmbedError {
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        EmbedError::Auth(format!("{}: {}", status, truncate(body, 200)))
    } else {
        EmbedError::Provider(format!("{}: {}", status, truncate(body, 200)))
    }
}

fn truncate(s: &str, max: usize) -> &str {
    let mut end = s.len().min(max);
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
