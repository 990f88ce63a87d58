//! # llm-semantic: semantic search over source trees
//!
//! Ingests a repository, produces language-aware chunks, embeds them via a
//! remote model provider, persists them in SQLite (or Qdrant), and answers
//! ranked semantic, hybrid, and multi-query searches. A parallel memory
//! subsystem stores learned question/answer pairs and tracks how often each
//! one is retrieved.
//!
//! ## Quick start
//!
//! ```no_run
//! use std::path::Path;
//! use llm_semantic::chunker::Domain;
//! use llm_semantic::embedder::{Embedder, EmbedderKind, EmbedderOptions};
//! use llm_semantic::indexer::{IndexOptions, Indexer};
//! use llm_semantic::search::{SearchOptions, Searcher};
//! use llm_semantic::storage::{SqliteStore, Storage};
//!
//! # fn main() -> anyhow::Result<()> {
//! let embedder = Embedder::new(EmbedderKind::OpenAi, EmbedderOptions::default())?;
//! let store = SqliteStore::open(Path::new(".llm-index/semantic.db"), None)?;
//!
//! let indexer = Indexer::new(&store, &embedder, Domain::Code);
//! indexer.index(Path::new("."), &IndexOptions::default(), |_| {}, || false)?;
//!
//! let searcher = Searcher::new(&embedder);
//! let results = searcher.search(&store, Domain::Code, "parse configuration", &SearchOptions::default())?;
//! for r in &results {
//!     println!("{:.2} {}:{} {}", r.score, r.chunk.file_path.display(), r.chunk.start_line, r.chunk.name);
//! }
//! # Ok(())
//! # }
//! ```

pub mod calibration;
pub mod chunker;
pub mod config;
pub mod embedder;
pub mod error;
pub mod indexer;
pub mod memory;
pub mod search;
pub mod storage;

pub use calibration::{CalibrationMetadata, Relevance};
pub use chunker::{Chunk, ChunkType, Chunker, ChunkerFactory, Domain};
pub use config::{SemanticConfig, StorageKind};
pub use embedder::{Embedder, EmbedderKind, EmbedderOptions, TextEmbedder};
pub use error::{ErrorKind, SemanticError};
pub use indexer::{IndexOptions, IndexReport, Indexer};
pub use memory::{MemoryStore, RetrievalLogger};
pub use search::{MultisearchOptions, MultisearchOutput, RankedResult, SearchOptions, Searcher};
pub use storage::{
    FileRecord, MemoryEntry, MemoryStatus, QdrantStore, RetrievalLogEntry, ScoredChunk,
    SearchScope, SqliteStore, Storage, StorageError, StorageStats,
};
