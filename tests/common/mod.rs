//! Shared test fixtures
//!
//! `BagEmbedder` is a deterministic, offline stand-in for a remote provider:
//! it hashes word tokens into a fixed-dimension bag-of-words vector, so
//! texts sharing vocabulary get high cosine similarity and unrelated texts
//! do not. Good enough to exercise indexing, ranking, and calibration
//! without a network.

#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use llm_semantic::embedder::{EmbedError, TextEmbedder};
use llm_semantic::storage::normalize_l2;

pub const TEST_DIM: usize = 64;

#[derive(Default)]
pub struct BagEmbedder {
    /// Count of embed_documents calls (for reuse assertions)
    pub document_calls: AtomicUsize,
}

impl BagEmbedder {
    pub fn new() -> Self {
        Self::default()
    }

    fn embed_text(text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; TEST_DIM];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let token = token.to_lowercase();
            let hash = blake3::hash(token.as_bytes());
            let slot = (hash.as_bytes()[0] as usize) % TEST_DIM;
            v[slot] += 1.0;
        }
        // All-blank text still needs a nonzero vector
        if v.iter().all(|&x| x == 0.0) {
            v[0] = 1.0;
        }
        normalize_l2(v)
    }
}

impl TextEmbedder for BagEmbedder {
    fn probe(&self) -> Result<usize, EmbedError> {
        Ok(TEST_DIM)
    }

    fn model(&self) -> String {
        "test-bag-embedder".to_string()
    }

    fn provider_name(&self) -> &'static str {
        "test"
    }

    fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        if text.trim().is_empty() {
            return Err(EmbedError::EmptyQuery);
        }
        Ok(Self::embed_text(text))
    }

    fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        self.document_calls.fetch_add(1, Ordering::SeqCst);
        Ok(texts.iter().map(|t| Self::embed_text(t)).collect())
    }
}

/// An embedder whose probe always fails (for fatal-path tests).
pub struct BrokenEmbedder;

impl TextEmbedder for BrokenEmbedder {
    fn probe(&self) -> Result<usize, EmbedError> {
        Err(EmbedError::Provider("connection refused".to_string()))
    }

    fn model(&self) -> String {
        "broken".to_string()
    }

    fn provider_name(&self) -> &'static str {
        "test"
    }

    fn embed_query(&self, _text: &str) -> Result<Vec<f32>, EmbedError> {
        Err(EmbedError::Provider("connection refused".to_string()))
    }

    fn embed_documents(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        Err(EmbedError::Provider("connection refused".to_string()))
    }
}

pub fn write_file(root: &Path, rel: &str, content: &str) {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, content).unwrap();
}
