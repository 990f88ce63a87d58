//! Language-aware chunking
//!
//! Splitters produce the retrievable units the index stores. Each chunker
//! handles a set of file extensions; the factory dispatches by extension and
//! falls back to the generic sliding-window splitter for unknown types.

mod code;
mod generic;
mod html;
mod markdown;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use code::CodeChunker;
pub use generic::GenericChunker;
pub use html::HtmlChunker;
pub use markdown::MarkdownChunker;

#[derive(Error, Debug)]
pub enum ChunkerError {
    #[error("Failed to chunk {0}: {1}")]
    ChunkFailed(String, String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Logical bucket a chunk is indexed under.
///
/// Controls which collection/table the chunk lives in and which profiles a
/// search consults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Domain {
    Code,
    Docs,
    Memory,
    Sprints,
}

impl Domain {
    pub const ALL: [Domain; 4] = [Domain::Code, Domain::Docs, Domain::Memory, Domain::Sprints];

    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Code => "code",
            Domain::Docs => "docs",
            Domain::Memory => "memory",
            Domain::Sprints => "sprints",
        }
    }
}

impl std::fmt::Display for Domain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Domain {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "code" => Ok(Domain::Code),
            "docs" => Ok(Domain::Docs),
            "memory" => Ok(Domain::Memory),
            "sprints" => Ok(Domain::Sprints),
            other => Err(format!(
                "unknown profile '{}' (available: code, docs, memory, sprints)",
                other
            )),
        }
    }
}

/// Kind of source element a chunk was cut from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkType {
    Function,
    Method,
    Struct,
    Interface,
    Class,
    Module,
    Section,
    Block,
    Generic,
}

impl ChunkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkType::Function => "function",
            ChunkType::Method => "method",
            ChunkType::Struct => "struct",
            ChunkType::Interface => "interface",
            ChunkType::Class => "class",
            ChunkType::Module => "module",
            ChunkType::Section => "section",
            ChunkType::Block => "block",
            ChunkType::Generic => "generic",
        }
    }
}

impl std::fmt::Display for ChunkType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ChunkType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "function" => Ok(ChunkType::Function),
            "method" => Ok(ChunkType::Method),
            "struct" => Ok(ChunkType::Struct),
            "interface" => Ok(ChunkType::Interface),
            "class" => Ok(ChunkType::Class),
            "module" => Ok(ChunkType::Module),
            "section" => Ok(ChunkType::Section),
            "block" => Ok(ChunkType::Block),
            "generic" => Ok(ChunkType::Generic),
            other => Err(format!("unknown chunk type '{}'", other)),
        }
    }
}

/// The indivisible retrievable unit.
///
/// `id` is stable: identical content at an identical location yields an
/// identical id (`{file_path}:{start_line}:{hash8}`).
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: String,
    pub file_path: PathBuf,
    pub domain: Domain,
    pub chunk_type: ChunkType,
    /// Human label: function name, heading text, or first non-blank line
    pub name: String,
    /// One-line declaration when derivable, else empty
    pub signature: String,
    /// 1-indexed, inclusive
    pub start_line: u32,
    /// 1-indexed, inclusive
    pub end_line: u32,
    pub content: String,
    /// Free-form source language tag ("rust", "markdown", "text", ...)
    pub language: String,
    /// blake3 hex of `content`
    pub content_hash: String,
    /// File mtime (unix secs) at index time; drives the recency boost
    pub modified_at: i64,
}

impl Chunk {
    /// Build a chunk, deriving `content_hash` and `id` from the inputs.
    #[allow(clippy::too_many_arguments)]
    pub fn build(
        path: &Path,
        chunk_type: ChunkType,
        name: impl Into<String>,
        signature: impl Into<String>,
        start_line: u32,
        end_line: u32,
        content: String,
        language: impl Into<String>,
    ) -> Self {
        let content_hash = blake3::hash(content.as_bytes()).to_hex().to_string();
        let id = chunk_id(path, start_line, &content_hash);
        Chunk {
            id,
            file_path: path.to_path_buf(),
            domain: Domain::Code,
            chunk_type,
            name: name.into(),
            signature: signature.into(),
            start_line,
            end_line,
            content,
            language: language.into(),
            content_hash,
            modified_at: 0,
        }
    }
}

/// Stable chunk id: `{path}:{start_line}:{hash8}` with forward-slash paths.
pub fn chunk_id(path: &Path, start_line: u32, content_hash: &str) -> String {
    let path_str = path.to_string_lossy().replace('\\', "/");
    let prefix = content_hash.get(..8).unwrap_or(content_hash);
    format!("{}:{}:{}", path_str, start_line, prefix)
}

/// First non-blank line of a block, truncated for use as a chunk name.
pub(crate) fn first_line_name(content: &str, max_len: usize) -> String {
    let line = content
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("");
    if line.len() <= max_len {
        line.to_string()
    } else {
        let mut end = max_len;
        while !line.is_char_boundary(end) {
            end -= 1;
        }
        line[..end].to_string()
    }
}

/// Polymorphic splitter: file bytes in, ordered chunks out.
pub trait Chunker: Send + Sync {
    /// Split `source` into chunks. Chunks MUST be in source order with
    /// non-overlapping 1-indexed line ranges. Empty sources yield no chunks.
    fn chunk(&self, path: &Path, source: &str) -> Result<Vec<Chunk>, ChunkerError>;

    /// File extensions (lowercase, no dot) this chunker handles.
    fn extensions(&self) -> &'static [&'static str];

    fn name(&self) -> &'static str;
}

/// Dispatches files to the right chunker by extension.
pub struct ChunkerFactory {
    chunkers: Vec<Box<dyn Chunker>>,
    by_ext: HashMap<&'static str, usize>,
    generic: GenericChunker,
}

impl Default for ChunkerFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkerFactory {
    pub fn new() -> Self {
        let chunkers: Vec<Box<dyn Chunker>> = vec![
            Box::new(CodeChunker::go()),
            Box::new(CodeChunker::rust()),
            Box::new(CodeChunker::python()),
            Box::new(CodeChunker::javascript()),
            Box::new(CodeChunker::php()),
            Box::new(MarkdownChunker::default()),
            Box::new(HtmlChunker::new()),
        ];
        let mut by_ext = HashMap::new();
        for (i, chunker) in chunkers.iter().enumerate() {
            for ext in chunker.extensions() {
                by_ext.insert(*ext, i);
            }
        }
        Self {
            chunkers,
            by_ext,
            generic: GenericChunker::default(),
        }
    }

    /// The chunker responsible for `path` (generic for unknown extensions).
    pub fn for_path(&self, path: &Path) -> &dyn Chunker {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        match ext.as_deref().and_then(|e| self.by_ext.get(e)) {
            Some(&i) => self.chunkers[i].as_ref(),
            None => &self.generic,
        }
    }

    /// Chunk a file, stamping domain and mtime onto every produced chunk.
    pub fn chunk_file(
        &self,
        path: &Path,
        source: &str,
        domain: Domain,
        modified_at: i64,
    ) -> Result<Vec<Chunk>, ChunkerError> {
        let mut chunks = self.for_path(path).chunk(path, source)?;
        for chunk in &mut chunks {
            chunk.domain = domain;
            chunk.modified_at = modified_at;
        }
        Ok(chunks)
    }
}

/// Check the ordering invariant: non-overlapping chunks sorted by start line.
#[cfg(test)]
pub(crate) fn assert_source_order(chunks: &[Chunk]) {
    for pair in chunks.windows(2) {
        assert!(
            pair[0].start_line <= pair[0].end_line,
            "chunk {} has inverted range",
            pair[0].id
        );
        assert!(
            pair[0].end_line < pair[1].start_line,
            "chunks {} and {} overlap",
            pair[0].id,
            pair[1].id
        );
    }
}
