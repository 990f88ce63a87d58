//! Learned-memory store
//!
//! Question/answer pairs live as chunk-like rows keyed by the canonical
//! question, searched semantically like any other collection. Every search
//! hit can be appended to the retrieval log; that write happens on a
//! background queue so search latency never waits on logging, and a logging
//! failure is logged but never fails the search.

use std::path::Path;
use std::sync::Arc;

use crossbeam_channel::Sender;
use serde::Deserialize;

use crate::calibration::{default_calibration, Relevance};
use crate::chunker::Domain;
use crate::embedder::TextEmbedder;
use crate::error::{ErrorKind, SemanticError};
use crate::storage::{
    cosine_similarity, MemoryEntry, MemoryStatus, RetrievalLogEntry, Storage,
};

/// Bounds for `prune-log --older-than` (1 day to ~100 years).
pub const PRUNE_DAYS_MIN: u32 = 1;
pub const PRUNE_DAYS_MAX: u32 = 36_500;

/// Derive the stable memory id from the canonical question.
///
/// Case and surrounding whitespace don't change identity, so re-storing the
/// same question is idempotent.
pub fn memory_id(question: &str) -> String {
    let canonical = question.trim().to_lowercase();
    let hash = blake3::hash(canonical.as_bytes()).to_hex().to_string();
    hash[..16].to_string()
}

/// The text embedded for a memory row.
pub fn memory_embedding_text(question: &str, answer: &str) -> String {
    format!("Q: {}\nA: {}", question, answer)
}

/// A memory search hit.
#[derive(Debug, Clone)]
pub struct MemoryHit {
    pub entry: MemoryEntry,
    pub score: f32,
    pub relevance: Relevance,
}

/// Fire-and-forget retrieval-log writer.
///
/// Entries are queued to a worker thread that owns a storage handle; the
/// queue drains on drop so short-lived CLI invocations don't lose rows.
pub struct RetrievalLogger {
    tx: Option<Sender<Vec<RetrievalLogEntry>>>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl RetrievalLogger {
    pub fn spawn(storage: Arc<dyn Storage>) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded::<Vec<RetrievalLogEntry>>();
        let handle = std::thread::spawn(move || {
            for batch in rx {
                if let Err(e) = storage.track_retrievals(&batch) {
                    tracing::warn!(error = %e, rows = batch.len(), "Retrieval log write failed");
                }
            }
        });
        Self {
            tx: Some(tx),
            handle: Some(handle),
        }
    }

    pub fn log(&self, entries: Vec<RetrievalLogEntry>) {
        if entries.is_empty() {
            return;
        }
        if let Some(ref tx) = self.tx {
            if tx.send(entries).is_err() {
                tracing::warn!("Retrieval log worker is gone, dropping entries");
            }
        }
    }
}

impl Drop for RetrievalLogger {
    fn drop(&mut self) {
        drop(self.tx.take());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Filters for memory search and listing.
#[derive(Debug, Clone, Default)]
pub struct MemoryFilter {
    pub tags: Vec<String>,
    pub status: Option<MemoryStatus>,
}

impl MemoryFilter {
    fn matches(&self, entry: &MemoryEntry) -> bool {
        if let Some(status) = self.status {
            if entry.status != status {
                return false;
            }
        }
        if !self.tags.is_empty() {
            let has_any = self.tags.iter().any(|t| entry.tags.contains(t));
            if !has_any {
                return false;
            }
        }
        true
    }
}

/// One JSONL line of `memory import`.
#[derive(Debug, Deserialize)]
struct ImportRow {
    question: String,
    answer: String,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    source: String,
}

/// Memory operations over a storage backend.
pub struct MemoryStore<'a> {
    storage: &'a dyn Storage,
    embedder: &'a dyn TextEmbedder,
}

impl<'a> MemoryStore<'a> {
    pub fn new(storage: &'a dyn Storage, embedder: &'a dyn TextEmbedder) -> Self {
        Self { storage, embedder }
    }

    /// Store a Q/A pair. Returns the entry and whether it was new.
    pub fn store(
        &self,
        question: &str,
        answer: &str,
        tags: Vec<String>,
        source: &str,
    ) -> Result<(MemoryEntry, bool), SemanticError> {
        let question = question.trim();
        if question.is_empty() {
            return Err(SemanticError::invalid_input("memory question cannot be empty"));
        }
        let now = chrono::Utc::now().to_rfc3339();
        let entry = MemoryEntry {
            id: memory_id(question),
            question: question.to_string(),
            answer: answer.trim().to_string(),
            tags,
            source: source.to_string(),
            status: MemoryStatus::Pending,
            occurrences: 1,
            created_at: now.clone(),
            updated_at: now,
        };
        let text = memory_embedding_text(&entry.question, &entry.answer);
        let vector = self
            .embedder
            .embed_documents(&[text])
            .map_err(SemanticError::from)?
            .pop()
            .ok_or_else(|| SemanticError::new(ErrorKind::Provider, "empty embedding batch"))?;

        let is_new = self
            .storage
            .memory_upsert(&entry, &vector)
            .map_err(storage_err)?;
        Ok((entry, is_new))
    }

    /// Semantic search over memory rows. When a logger is supplied, one
    /// retrieval row is queued per returned match.
    pub fn search(
        &self,
        query: &str,
        top: usize,
        threshold: f32,
        filter: &MemoryFilter,
        logger: Option<&RetrievalLogger>,
    ) -> Result<Vec<MemoryHit>, SemanticError> {
        let query_vec = self.embedder.embed_query(query).map_err(SemanticError::from)?;
        let calibration = match self.storage.get_calibration(Domain::Memory) {
            Ok(Some(meta)) => meta,
            _ => default_calibration(Domain::Memory, &self.embedder.model(), query_vec.len()),
        };

        let mut hits: Vec<MemoryHit> = self
            .storage
            .memory_all()
            .map_err(storage_err)?
            .into_iter()
            .filter(|(entry, _)| filter.matches(entry))
            .map(|(entry, vector)| {
                let score = cosine_similarity(&query_vec, &vector);
                MemoryHit {
                    relevance: calibration.tier(score),
                    entry,
                    score,
                }
            })
            .filter(|hit| hit.score >= threshold)
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.entry.id.cmp(&b.entry.id))
        });
        hits.truncate(top);

        if let Some(logger) = logger {
            let ts = chrono::Utc::now().timestamp();
            let entries: Vec<RetrievalLogEntry> = hits
                .iter()
                .map(|hit| RetrievalLogEntry {
                    memory_id: hit.entry.id.clone(),
                    query: query.to_string(),
                    score: hit.score,
                    ts,
                })
                .collect();
            logger.log(entries);
        }

        Ok(hits)
    }

    pub fn get(&self, id: &str) -> Result<MemoryEntry, SemanticError> {
        self.storage
            .memory_get(id)
            .map_err(storage_err)?
            .ok_or_else(|| {
                SemanticError::not_found(format!("no memory with id '{}'", id))
                    .with_hint("List ids with: memory list")
            })
    }

    pub fn list(
        &self,
        filter: &MemoryFilter,
        limit: usize,
    ) -> Result<Vec<MemoryEntry>, SemanticError> {
        let tag = filter.tags.first().map(String::as_str);
        let entries = self
            .storage
            .memory_list(filter.status, tag, limit)
            .map_err(storage_err)?;
        Ok(entries.into_iter().filter(|e| filter.matches(e)).collect())
    }

    pub fn delete(&self, id: &str) -> Result<(), SemanticError> {
        let deleted = self.storage.memory_delete(id).map_err(storage_err)?;
        if !deleted {
            return Err(SemanticError::not_found(format!("no memory with id '{}'", id)));
        }
        Ok(())
    }

    /// Promote a memory: mark it promoted and append a markdown block under
    /// the named section of the named file (both created when missing).
    pub fn promote(&self, id: &str, file: &Path, section: &str) -> Result<(), SemanticError> {
        let entry = self.get(id)?;
        self.storage
            .memory_set_status(id, MemoryStatus::Promoted)
            .map_err(storage_err)?;

        let block = format!(
            "- **Q:** {}\n  **A:** {}\n  <!-- memory:{} -->\n",
            entry.question, entry.answer, entry.id
        );
        append_under_section(file, section, &block).map_err(|e| {
            SemanticError::new(
                ErrorKind::NotFound,
                format!("failed to write {}: {}", file.display(), e),
            )
            .with_hint("Check file permissions on the promotion target")
        })?;
        tracing::info!(memory_id = %id, file = %file.display(), section, "Memory promoted");
        Ok(())
    }

    /// Import Q/A pairs from a JSONL file. Returns (stored, updated).
    pub fn import(&self, path: &Path) -> Result<(usize, usize), SemanticError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            SemanticError::not_found(format!("cannot read {}: {}", path.display(), e))
        })?;
        let mut stored = 0usize;
        let mut updated = 0usize;
        for (lineno, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let row: ImportRow = serde_json::from_str(line).map_err(|e| {
                SemanticError::invalid_input(format!(
                    "{}:{}: invalid JSON: {}",
                    path.display(),
                    lineno + 1,
                    e
                ))
                .with_hint("Each line must be {\"question\": ..., \"answer\": ..., \"tags\"?: [...]}")
            })?;
            let (_, is_new) = self.store(&row.question, &row.answer, row.tags, &row.source)?;
            if is_new {
                stored += 1;
            } else {
                updated += 1;
            }
        }
        Ok((stored, updated))
    }

    /// Totals for `memory stats`.
    pub fn stats(&self) -> Result<MemoryStats, SemanticError> {
        let all = self.storage.memory_list(None, None, usize::MAX).map_err(storage_err)?;
        let promoted = all
            .iter()
            .filter(|e| e.status == MemoryStatus::Promoted)
            .count();
        Ok(MemoryStats {
            total: all.len(),
            pending: all.len() - promoted,
            promoted,
            retrievals: self.storage.retrieval_count().map_err(storage_err)?,
        })
    }

    /// Delete retrieval-log rows older than `days` (validated range).
    pub fn prune_log(&self, days: u32) -> Result<u64, SemanticError> {
        if !(PRUNE_DAYS_MIN..=PRUNE_DAYS_MAX).contains(&days) {
            return Err(SemanticError::invalid_input(format!(
                "prune window {} out of range",
                days
            ))
            .with_hint(format!(
                "--older-than must be between {} and {} days",
                PRUNE_DAYS_MIN, PRUNE_DAYS_MAX
            )));
        }
        self.storage.prune_retrievals(days).map_err(storage_err)
    }

    pub fn history(
        &self,
        memory_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<RetrievalLogEntry>, SemanticError> {
        self.storage
            .retrieval_history(memory_id, limit)
            .map_err(storage_err)
    }
}

#[derive(Debug, serde::Serialize)]
pub struct MemoryStats {
    pub total: usize,
    pub pending: usize,
    pub promoted: usize,
    pub retrievals: u64,
}

fn storage_err(e: crate::storage::StorageError) -> SemanticError {
    SemanticError::new(ErrorKind::StorageOpen, e.to_string())
}

/// Append `block` at the end of the `## {section}` region of a markdown
/// file, creating the file and/or section as needed.
fn append_under_section(path: &Path, section: &str, block: &str) -> std::io::Result<()> {
    let existing = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e),
    };

    let heading = format!("## {}", section);
    let lines: Vec<&str> = existing.lines().collect();
    let section_start = lines.iter().position(|l| l.trim() == heading);

    let output = match section_start {
        Some(start) => {
            // Section ends at the next heading of level <= 2
            let end = lines[start + 1..]
                .iter()
                .position(|l| {
                    let t = l.trim_start();
                    t.starts_with("# ") || t.starts_with("## ")
                })
                .map(|rel| start + 1 + rel)
                .unwrap_or(lines.len());

            let mut out: Vec<String> = lines[..end].iter().map(|l| l.to_string()).collect();
            // Trim trailing blanks inside the section before appending
            while out.last().map(|l| l.trim().is_empty()).unwrap_or(false) {
                out.pop();
            }
            out.push(String::new());
            out.extend(block.trim_end().lines().map(str::to_string));
            out.push(String::new());
            out.extend(lines[end..].iter().map(|l| l.to_string()));
            out.join("\n")
        }
        None => {
            let mut out = existing;
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(&heading);
            out.push_str("\n\n");
            out.push_str(block.trim_end());
            out.push('\n');
            out
        }
    };

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(path, output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_memory_id_stable_and_canonical() {
        let a = memory_id("How do I reset the index?");
        let b = memory_id("  how do i reset the index?  ");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert_ne!(a, memory_id("How do I delete the index?"));
    }

    #[test]
    fn test_embedding_text_shape() {
        assert_eq!(
            memory_embedding_text("Why?", "Because."),
            "Q: Why?\nA: Because."
        );
    }

    #[test]
    fn test_filter_matching() {
        let entry = MemoryEntry {
            id: "x".into(),
            question: "q".into(),
            answer: "a".into(),
            tags: vec!["ops".into(), "db".into()],
            source: String::new(),
            status: MemoryStatus::Pending,
            occurrences: 1,
            created_at: String::new(),
            updated_at: String::new(),
        };
        assert!(MemoryFilter::default().matches(&entry));
        assert!(MemoryFilter {
            tags: vec!["db".into()],
            ..Default::default()
        }
        .matches(&entry));
        assert!(!MemoryFilter {
            tags: vec!["web".into()],
            ..Default::default()
        }
        .matches(&entry));
        assert!(!MemoryFilter {
            status: Some(MemoryStatus::Promoted),
            ..Default::default()
        }
        .matches(&entry));
    }

    #[test]
    fn test_append_under_new_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("notes/learned.md");
        append_under_section(&path, "Learned", "- **Q:** q\n  **A:** a\n").unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("## Learned\n"));
        assert!(content.contains("**Q:** q"));
    }

    #[test]
    fn test_append_into_existing_section() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("doc.md");
        std::fs::write(
            &path,
            "# Title\n\n## Learned\n\n- old entry\n\n## Other\n\nkeep me\n",
        )
        .unwrap();
        append_under_section(&path, "Learned", "- new entry\n").unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        let learned_pos = content.find("- new entry").unwrap();
        let other_pos = content.find("## Other").unwrap();
        assert!(learned_pos < other_pos, "entry must land inside its section");
        assert!(content.contains("- old entry"));
        assert!(content.contains("keep me"));
    }

    #[test]
    fn test_append_creates_missing_section() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("doc.md");
        std::fs::write(&path, "# Title\n\nbody\n").unwrap();
        append_under_section(&path, "Learned", "- entry\n").unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("# Title"));
        assert!(content.contains("## Learned"));
        assert!(content.contains("- entry"));
    }
}
