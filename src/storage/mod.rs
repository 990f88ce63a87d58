//! Storage backends for chunks, vectors, memory, and calibration
//!
//! Two dissimilar backends (embedded SQLite+FTS5, remote Qdrant) sit behind
//! one object-safe contract. Vectors are L2-normalised before they reach
//! storage, so cosine similarity reduces to a dot product everywhere.

mod qdrant;
mod sqlite;

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::calibration::CalibrationMetadata;
use crate::chunker::{Chunk, ChunkType, Domain};

pub use qdrant::QdrantStore;
pub use sqlite::SqliteStore;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Runtime error: {0}")]
    Runtime(String),
    #[error("Backend error: {0}")]
    Backend(String),
    #[error(
        "Dimension mismatch: index stores {stored}-dim vectors, embedder produces {current}. \
         Re-index with --force or switch back to the original embedding model."
    )]
    DimensionMismatch { stored: usize, current: usize },
    #[error("Not found: {0}")]
    NotFound(String),
}

/// Per-file manifest row. At most one per `(path, domain)`; all chunks for
/// that pair were derived from `content_hash`.
#[derive(Debug, Clone, PartialEq)]
pub struct FileRecord {
    pub path: String,
    pub domain: Domain,
    pub content_hash: String,
    pub mtime: i64,
    pub chunk_count: u32,
    pub indexed_at: String,
}

/// A chunk with its retrieval score.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub score: f32,
}

/// Restricts a search to a slice of the index.
#[derive(Debug, Clone, Default)]
pub struct SearchScope {
    pub domain: Option<Domain>,
    pub chunk_types: Option<Vec<ChunkType>>,
    /// Matches when the chunk's file path starts with this prefix
    pub path_prefix: Option<String>,
}

impl SearchScope {
    pub fn for_domain(domain: Domain) -> Self {
        Self {
            domain: Some(domain),
            ..Default::default()
        }
    }

    pub(crate) fn matches(&self, chunk: &Chunk) -> bool {
        if let Some(domain) = self.domain {
            if chunk.domain != domain {
                return false;
            }
        }
        if let Some(ref types) = self.chunk_types {
            if !types.contains(&chunk.chunk_type) {
                return false;
            }
        }
        if let Some(ref prefix) = self.path_prefix {
            let path = chunk.file_path.to_string_lossy().replace('\\', "/");
            if !path.starts_with(prefix.as_str()) {
                return false;
            }
        }
        true
    }
}

/// Index-wide statistics.
#[derive(Debug, Clone, Default)]
pub struct StorageStats {
    pub files_indexed: u64,
    pub chunks_total: u64,
    pub last_updated: String,
    /// (files, chunks) per domain
    pub by_domain: HashMap<Domain, (u64, u64)>,
    pub vector_dim: Option<usize>,
    pub embedding_model: Option<String>,
    pub size_bytes: u64,
}

/// Lifecycle state of a memory row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryStatus {
    Pending,
    Promoted,
}

impl MemoryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryStatus::Pending => "pending",
            MemoryStatus::Promoted => "promoted",
        }
    }
}

impl std::fmt::Display for MemoryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MemoryStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(MemoryStatus::Pending),
            "promoted" => Ok(MemoryStatus::Promoted),
            other => Err(format!("unknown memory status '{}'", other)),
        }
    }
}

/// A learned question/answer pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub id: String,
    pub question: String,
    pub answer: String,
    pub tags: Vec<String>,
    pub source: String,
    pub status: MemoryStatus,
    pub occurrences: u32,
    pub created_at: String,
    pub updated_at: String,
}

/// One row of the append-only retrieval log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalLogEntry {
    pub memory_id: String,
    pub query: String,
    pub score: f32,
    /// Unix seconds
    pub ts: i64,
}

/// The storage contract shared by the SQLite and Qdrant backends.
///
/// All methods are synchronous; backends own their async runtime internally.
pub trait Storage: Send + Sync {
    fn backend_name(&self) -> &'static str;

    /// Stamped vector dimension, if any vectors have been written.
    fn vector_dim(&self) -> Result<Option<usize>, StorageError>;

    /// Stamp the dimension and model on first write; fail closed on conflict.
    fn ensure_dim(&self, dim: usize, model: &str) -> Result<(), StorageError>;

    /// Atomically replace a file's chunks and manifest row.
    /// `vectors` must be positionally aligned with `chunks`.
    fn upsert_file(
        &self,
        record: &FileRecord,
        chunks: &[Chunk],
        vectors: &[Vec<f32>],
    ) -> Result<(), StorageError>;

    /// Remove a file's manifest row and all of its chunks.
    fn delete_file(&self, path: &str, domain: Domain) -> Result<u32, StorageError>;

    /// Drop every chunk and file record in a domain. Returns chunks removed.
    fn delete_domain(&self, domain: Domain) -> Result<u64, StorageError>;

    fn get_file_record(&self, path: &str, domain: Domain)
        -> Result<Option<FileRecord>, StorageError>;

    fn list_files(&self, domain: Domain) -> Result<Vec<FileRecord>, StorageError>;

    /// Embeddings already stored for these content hashes (re-index reuse).
    fn embeddings_by_hash(
        &self,
        hashes: &[&str],
    ) -> Result<HashMap<String, Vec<f32>>, StorageError>;

    /// Top-k by cosine, ordered score descending, ties by chunk id ascending.
    fn dense_top_k(
        &self,
        query: &[f32],
        k: usize,
        scope: &SearchScope,
    ) -> Result<Vec<ScoredChunk>, StorageError>;

    /// Top-k by lexical relevance (BM25 on SQLite, emulated on Qdrant).
    fn fts_top_k(
        &self,
        query: &str,
        k: usize,
        scope: &SearchScope,
    ) -> Result<Vec<ScoredChunk>, StorageError>;

    fn stats(&self) -> Result<StorageStats, StorageError>;

    fn get_calibration(&self, domain: Domain)
        -> Result<Option<CalibrationMetadata>, StorageError>;
    fn put_calibration(&self, meta: &CalibrationMetadata) -> Result<(), StorageError>;

    // ===== memory =====

    /// Insert or update a memory row. Returns true when the row is new.
    fn memory_upsert(&self, entry: &MemoryEntry, vector: &[f32]) -> Result<bool, StorageError>;
    fn memory_get(&self, id: &str) -> Result<Option<MemoryEntry>, StorageError>;
    fn memory_list(
        &self,
        status: Option<MemoryStatus>,
        tag: Option<&str>,
        limit: usize,
    ) -> Result<Vec<MemoryEntry>, StorageError>;
    fn memory_delete(&self, id: &str) -> Result<bool, StorageError>;
    fn memory_set_status(&self, id: &str, status: MemoryStatus) -> Result<(), StorageError>;
    /// All memory rows with their vectors, for in-process semantic ranking.
    fn memory_all(&self) -> Result<Vec<(MemoryEntry, Vec<f32>)>, StorageError>;

    // ===== retrieval log =====

    fn track_retrievals(&self, entries: &[RetrievalLogEntry]) -> Result<(), StorageError>;
    fn retrieval_history(
        &self,
        memory_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<RetrievalLogEntry>, StorageError>;
    fn retrieval_count(&self) -> Result<u64, StorageError>;
    /// Delete log rows with `ts < now - older_than_days`. Returns rows removed.
    fn prune_retrievals(&self, older_than_days: u32) -> Result<u64, StorageError>;
}

// ============ Vector packing ============

/// Pack a vector as little-endian f32 bytes for blob storage.
pub fn pack_vector(vector: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(vector.len() * 4);
    for v in vector {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

/// Unpack a blob back into f32s. Returns None when the length is not a
/// multiple of 4 (corruption); callers skip such rows with a warning.
pub fn unpack_vector(bytes: &[u8]) -> Option<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return None;
    }
    // Blob alignment is not guaranteed, so the zero-copy cast may fail
    if let Ok(slice) = bytemuck::try_cast_slice::<u8, f32>(bytes) {
        return Some(slice.to_vec());
    }
    Some(
        bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
    )
}

/// Dot product (= cosine similarity for L2-normalised vectors).
/// SIMD-accelerated where available, with a scalar fallback.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    use simsimd::SpatialSimilarity;
    let score = f32::dot(a, b).unwrap_or_else(|| {
        a.iter()
            .zip(b)
            .map(|(&x, &y)| (x as f64) * (y as f64))
            .sum::<f64>()
    }) as f32;
    if score.is_finite() {
        score
    } else {
        0.0
    }
}

/// L2-normalise in place (no-op for the zero vector).
pub fn normalize_l2(mut v: Vec<f32>) -> Vec<f32> {
    let norm_sq: f32 = v.iter().fold(0.0, |acc, &x| acc + x * x);
    if norm_sq > 0.0 {
        let inv = 1.0 / norm_sq.sqrt();
        v.iter_mut().for_each(|x| *x *= inv);
    }
    v
}

// ============ FTS normalisation ============

/// Split an identifier on snake_case and camelCase boundaries.
pub fn tokenize_identifier(ident: &str) -> Vec<String> {
    let mut words = Vec::new();
    for part in ident.split(|c: char| !c.is_alphanumeric()) {
        if part.is_empty() {
            continue;
        }
        let mut word = String::new();
        let mut prev_lower = false;
        for c in part.chars() {
            if c.is_uppercase() && prev_lower && !word.is_empty() {
                words.push(std::mem::take(&mut word));
            }
            prev_lower = c.is_lowercase() || c.is_ascii_digit();
            word.extend(c.to_lowercase());
        }
        if !word.is_empty() {
            words.push(word);
        }
    }
    words
}

/// Normalise text for the lexical index: identifiers split on word
/// boundaries and joined with single spaces.
/// Example: `parseConfigFile` -> `parse config file`
pub fn normalize_for_fts(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for token in text.split(|c: char| !(c.is_alphanumeric() || c == '_')) {
        if token.is_empty() {
            continue;
        }
        for word in tokenize_identifier(token) {
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str(&word);
        }
    }
    out
}

/// Normalise a path for storage keys (forward slashes everywhere).
pub(crate) fn normalize_path(path: &std::path::Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

/// Rebuild a Chunk from stored fields (shared by both backends).
#[allow(clippy::too_many_arguments)]
pub(crate) fn chunk_from_parts(
    id: String,
    path: String,
    domain: &str,
    chunk_type: &str,
    name: String,
    signature: String,
    start_line: i64,
    end_line: i64,
    content: String,
    language: String,
    content_hash: String,
    modified_at: i64,
) -> Chunk {
    let domain = domain.parse().unwrap_or_else(|_| {
        tracing::warn!(chunk_id = %id, stored = %domain, "Unknown domain in storage, defaulting to code");
        Domain::Code
    });
    let chunk_type = chunk_type.parse().unwrap_or_else(|_| {
        tracing::warn!(chunk_id = %id, stored = %chunk_type, "Unknown chunk type in storage, defaulting to generic");
        ChunkType::Generic
    });
    Chunk {
        id,
        file_path: PathBuf::from(path),
        domain,
        chunk_type,
        name,
        signature,
        start_line: start_line.clamp(1, u32::MAX as i64) as u32,
        end_line: end_line.clamp(1, u32::MAX as i64) as u32,
        content,
        language,
        content_hash,
        modified_at,
    }
}
