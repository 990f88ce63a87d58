//! Index manager
//!
//! Keeps the index consistent with a filesystem subtree: walks the tree
//! (gitignore-aware), skips files whose content hash is already indexed,
//! chunks changed files in a bounded parallel pool, embeds chunk batches,
//! and replaces each file's rows atomically. Files are written in walk
//! order so runs are deterministic.
//!
//! Per-file failures are collected and counted; only storage-open and
//! embedder-probe failures abort the run.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::WalkBuilder;
use rand::seq::SliceRandom;
use rayon::prelude::*;
use serde::Serialize;

use crate::calibration::{calibrate_from_vectors, SAMPLE_SIZE};
use crate::chunker::{Chunk, ChunkerFactory, Domain};
use crate::embedder::TextEmbedder;
use crate::error::{ErrorKind, SemanticError};
use crate::storage::{FileRecord, Storage};

/// Files larger than this are skipped (counted, not errored).
const MAX_FILE_SIZE: u64 = 1_048_576;
/// Directories excluded from the walk unless overridden.
pub const DEFAULT_EXCLUDES: &[&str] = &["vendor", "node_modules", ".git"];
/// Progress callback cadence in non-verbose mode.
const PROGRESS_EVERY: usize = 100;
/// Files chunked per parallel batch (bounds memory on big trees).
const CHUNK_BATCH_FILES: usize = 256;

/// Options for an indexing pass.
#[derive(Debug, Clone, Default)]
pub struct IndexOptions {
    /// Glob patterns applied to the file name and the relative path;
    /// empty means everything
    pub includes: Vec<String>,
    /// Directory names to skip (added to DEFAULT_EXCLUDES)
    pub excludes: Vec<String>,
    /// Re-index files even when the stored hash matches
    pub force: bool,
    /// Honor .gitignore files (default true)
    pub no_gitignore: bool,
    /// Emit a progress event per file instead of every 100
    pub verbose: bool,
}

/// Progress event emitted during a pass.
#[derive(Debug, Clone)]
pub struct IndexProgress {
    pub current: usize,
    pub total: usize,
    pub file_path: String,
    pub skipped: bool,
    pub chunks_total: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexFileError {
    pub path: String,
    pub message: String,
}

/// Outcome of an indexing pass.
#[derive(Debug, Default, Serialize)]
pub struct IndexReport {
    pub files_seen: usize,
    pub files_indexed: usize,
    pub files_unchanged: usize,
    pub files_skipped: usize,
    /// Stale file records removed (update mode)
    pub files_removed: usize,
    pub chunks_created: usize,
    pub chunks_removed: usize,
    pub interrupted: bool,
    pub errors: Vec<IndexFileError>,
}

/// Orchestrates the chunk -> embed -> store pipeline for one profile.
pub struct Indexer<'a> {
    storage: &'a dyn Storage,
    embedder: &'a dyn TextEmbedder,
    factory: ChunkerFactory,
    domain: Domain,
}

/// Result of chunking one file in the parallel stage.
struct PreparedFile {
    rel: String,
    file_hash: String,
    mtime: i64,
    chunks: Vec<Chunk>,
}

impl<'a> Indexer<'a> {
    pub fn new(storage: &'a dyn Storage, embedder: &'a dyn TextEmbedder, domain: Domain) -> Self {
        Self {
            storage,
            embedder,
            factory: ChunkerFactory::new(),
            domain,
        }
    }

    /// Full pass: index every eligible file under `root`.
    pub fn index(
        &self,
        root: &Path,
        opts: &IndexOptions,
        mut on_progress: impl FnMut(&IndexProgress),
        cancelled: impl Fn() -> bool,
    ) -> Result<IndexReport, SemanticError> {
        self.run(root, opts, false, &mut on_progress, &cancelled)
    }

    /// Incremental pass: changed files only, plus removal of file records
    /// whose path no longer exists.
    pub fn update(
        &self,
        root: &Path,
        opts: &IndexOptions,
        mut on_progress: impl FnMut(&IndexProgress),
        cancelled: impl Fn() -> bool,
    ) -> Result<IndexReport, SemanticError> {
        self.run(root, opts, true, &mut on_progress, &cancelled)
    }

    fn run(
        &self,
        root: &Path,
        opts: &IndexOptions,
        prune_missing: bool,
        on_progress: &mut dyn FnMut(&IndexProgress),
        cancelled: &dyn Fn() -> bool,
    ) -> Result<IndexReport, SemanticError> {
        // Probe failure is fatal: without a dimension there is no index
        let dim = self.embedder.probe().map_err(SemanticError::from)?;
        let model = self.embedder.model();
        self.storage.ensure_dim(dim, &model).map_err(|e| {
            SemanticError::new(ErrorKind::StorageOpen, e.to_string())
        })?;

        let files = enumerate_files(root, opts)?;
        let total = files.len();
        let mut report = IndexReport {
            files_seen: total,
            ..Default::default()
        };

        // Bounded pool for the CPU-bound chunking stage
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
            .min(8);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .build()
            .map_err(|e| SemanticError::new(ErrorKind::ChunkerFailure, e.to_string()))?;
        let mut seen_paths: HashSet<String> = HashSet::with_capacity(total);
        let mut calibration_pool: Vec<String> = Vec::new();
        let mut rng = rand::thread_rng();
        let mut processed = 0usize;

        for batch in files.chunks(CHUNK_BATCH_FILES) {
            if cancelled() {
                report.interrupted = true;
                break;
            }

            // Chunking is CPU-bound: parallel over files, results in order
            let prepared: Vec<Result<Option<PreparedFile>, IndexFileError>> = pool.install(|| {
                batch
                    .par_iter()
                    .map(|path| self.prepare_file(root, path))
                    .collect()
            });

            for (path, outcome) in batch.iter().zip(prepared) {
                if cancelled() {
                    report.interrupted = true;
                    break;
                }
                processed += 1;

                let prepared = match outcome {
                    Ok(Some(p)) => p,
                    Ok(None) => {
                        // Oversized or binary: counted as skipped, no error
                        report.files_skipped += 1;
                        emit_progress(on_progress, opts, processed, total, path, true, &report);
                        continue;
                    }
                    Err(err) => {
                        report.files_skipped += 1;
                        report.errors.push(err);
                        emit_progress(on_progress, opts, processed, total, path, true, &report);
                        continue;
                    }
                };

                seen_paths.insert(prepared.rel.clone());

                // Hash check: unchanged files cost one manifest lookup
                if !opts.force {
                    match self.storage.get_file_record(&prepared.rel, self.domain) {
                        Ok(Some(record)) if record.content_hash == prepared.file_hash => {
                            report.files_unchanged += 1;
                            emit_progress(
                                on_progress, opts, processed, total, path, true, &report,
                            );
                            continue;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::warn!(path = %prepared.rel, error = %e, "Manifest lookup failed, re-indexing");
                        }
                    }
                }

                if prepared.chunks.is_empty() {
                    // The chunker declared the file empty; drop any stale rows
                    if let Ok(removed) = self.storage.delete_file(&prepared.rel, self.domain) {
                        report.chunks_removed += removed as usize;
                    }
                    report.files_skipped += 1;
                    emit_progress(on_progress, opts, processed, total, path, true, &report);
                    continue;
                }

                match self.embed_and_store(&prepared, &mut report) {
                    Ok(created) => {
                        report.files_indexed += 1;
                        report.chunks_created += created;
                        // Reservoir-sample composites for calibration
                        for chunk in &prepared.chunks {
                            let composite = format!(
                                "{}\n{}\n{}",
                                chunk.content, chunk.name, prepared.rel
                            );
                            calibration_pool.push(composite);
                            if calibration_pool.len() > SAMPLE_SIZE * 4 {
                                calibration_pool.shuffle(&mut rng);
                                calibration_pool.truncate(SAMPLE_SIZE * 2);
                            }
                        }
                    }
                    Err(e) => {
                        report.files_skipped += 1;
                        report.errors.push(IndexFileError {
                            path: prepared.rel.clone(),
                            message: e.to_string(),
                        });
                    }
                }
                emit_progress(on_progress, opts, processed, total, path, false, &report);
            }

            if report.interrupted {
                break;
            }
        }

        if prune_missing && !report.interrupted {
            let removed = self.prune_deleted(&seen_paths, &mut report)?;
            report.files_removed = removed;
        }

        if report.chunks_created > 0 && !report.interrupted {
            if let Err(e) = self.recalibrate(&mut rng, calibration_pool, dim, &model) {
                tracing::warn!(error = %e, "Calibration failed, keeping previous thresholds");
            }
        }

        Ok(report)
    }

    /// Read, hash, and chunk one file. `Ok(None)` means skip silently.
    fn prepare_file(
        &self,
        root: &Path,
        path: &Path,
    ) -> Result<Option<PreparedFile>, IndexFileError> {
        let file_err = |message: String| IndexFileError {
            path: path.display().to_string(),
            message,
        };

        let metadata = std::fs::metadata(path).map_err(|e| file_err(e.to_string()))?;
        if metadata.len() > MAX_FILE_SIZE {
            tracing::debug!(path = %path.display(), size = metadata.len(), "Skipping oversized file");
            return Ok(None);
        }
        let mtime = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        let bytes = std::fs::read(path).map_err(|e| file_err(e.to_string()))?;
        if bytes.contains(&0) {
            return Ok(None); // binary
        }
        let source = String::from_utf8_lossy(&bytes);
        let file_hash = blake3::hash(&bytes).to_hex().to_string();

        let rel = path
            .strip_prefix(root)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/");

        let chunks = self
            .factory
            .chunk_file(Path::new(&rel), &source, self.domain, mtime)
            .map_err(|e| file_err(e.to_string()))?;

        Ok(Some(PreparedFile {
            rel,
            file_hash,
            mtime,
            chunks,
        }))
    }

    /// Embed a file's chunks (reusing stored vectors by content hash) and
    /// replace its rows atomically. Returns the number of chunks written.
    fn embed_and_store(
        &self,
        prepared: &PreparedFile,
        report: &mut IndexReport,
    ) -> Result<usize, SemanticError> {
        let hashes: Vec<&str> = prepared
            .chunks
            .iter()
            .map(|c| c.content_hash.as_str())
            .collect();
        let cached = self
            .storage
            .embeddings_by_hash(&hashes)
            .unwrap_or_default();

        let mut to_embed: Vec<String> = Vec::new();
        let mut embed_slots: Vec<usize> = Vec::new();
        let mut vectors: Vec<Option<Vec<f32>>> = vec![None; prepared.chunks.len()];

        for (i, chunk) in prepared.chunks.iter().enumerate() {
            match cached.get(&chunk.content_hash) {
                Some(vector) => vectors[i] = Some(vector.clone()),
                None => {
                    to_embed.push(chunk.content.clone());
                    embed_slots.push(i);
                }
            }
        }

        if !to_embed.is_empty() {
            let embedded = self
                .embedder
                .embed_documents(&to_embed)
                .map_err(SemanticError::from)?;
            for (slot, vector) in embed_slots.into_iter().zip(embedded) {
                vectors[slot] = Some(vector);
            }
        }

        let vectors: Vec<Vec<f32>> = vectors
            .into_iter()
            .map(|v| v.ok_or_else(|| SemanticError::new(ErrorKind::Provider, "missing embedding")))
            .collect::<Result<_, _>>()?;

        let previous = self
            .storage
            .get_file_record(&prepared.rel, self.domain)
            .ok()
            .flatten()
            .map(|r| r.chunk_count as usize)
            .unwrap_or(0);

        let record = FileRecord {
            path: prepared.rel.clone(),
            domain: self.domain,
            content_hash: prepared.file_hash.clone(),
            mtime: prepared.mtime,
            chunk_count: prepared.chunks.len() as u32,
            indexed_at: chrono::Utc::now().to_rfc3339(),
        };
        self.storage
            .upsert_file(&record, &prepared.chunks, &vectors)
            .map_err(|e| SemanticError::new(ErrorKind::StorageOpen, e.to_string()))?;
        report.chunks_removed += previous;

        tracing::debug!(path = %prepared.rel, chunks = prepared.chunks.len(), "File indexed");
        Ok(prepared.chunks.len())
    }

    fn prune_deleted(
        &self,
        seen: &HashSet<String>,
        report: &mut IndexReport,
    ) -> Result<usize, SemanticError> {
        let records = self
            .storage
            .list_files(self.domain)
            .map_err(|e| SemanticError::new(ErrorKind::StorageOpen, e.to_string()))?;
        let mut removed = 0usize;
        for record in records {
            if !seen.contains(&record.path) {
                match self.storage.delete_file(&record.path, self.domain) {
                    Ok(chunks) => {
                        removed += 1;
                        report.chunks_removed += chunks as usize;
                        tracing::info!(path = %record.path, "Removed deleted file from index");
                    }
                    Err(e) => {
                        report.errors.push(IndexFileError {
                            path: record.path,
                            message: e.to_string(),
                        });
                    }
                }
            }
        }
        Ok(removed)
    }

    /// Re-derive calibration thresholds from a fresh sample.
    fn recalibrate(
        &self,
        rng: &mut impl rand::Rng,
        mut pool: Vec<String>,
        dim: usize,
        model: &str,
    ) -> Result<(), SemanticError> {
        if pool.is_empty() {
            return Ok(());
        }
        if let Ok(Some(existing)) = self.storage.get_calibration(self.domain) {
            if existing.is_stale_for(model, dim) {
                tracing::info!(
                    domain = %self.domain,
                    old_model = %existing.embedding_model,
                    "Embedder fingerprint changed, recalibrating"
                );
            }
        }

        pool.shuffle(rng);
        pool.truncate(SAMPLE_SIZE);
        let texts: Vec<String> = pool;
        let vectors = self
            .embedder
            .embed_documents(&texts)
            .map_err(SemanticError::from)?;
        let meta = calibrate_from_vectors(self.domain, model, &vectors);
        self.storage
            .put_calibration(&meta)
            .map_err(|e| SemanticError::new(ErrorKind::StorageOpen, e.to_string()))?;
        tracing::info!(
            domain = %self.domain,
            baseline = meta.baseline_score,
            high = meta.threshold_high,
            "Calibration updated"
        );
        Ok(())
    }
}

fn emit_progress(
    on_progress: &mut dyn FnMut(&IndexProgress),
    opts: &IndexOptions,
    current: usize,
    total: usize,
    path: &Path,
    skipped: bool,
    report: &IndexReport,
) {
    if opts.verbose || current % PROGRESS_EVERY == 0 || current == total {
        on_progress(&IndexProgress {
            current,
            total,
            file_path: path.display().to_string(),
            skipped,
            chunks_total: report.chunks_created,
        });
    }
}

/// Walk `root` and return the eligible files in deterministic order.
pub fn enumerate_files(root: &Path, opts: &IndexOptions) -> Result<Vec<PathBuf>, SemanticError> {
    if !root.exists() {
        return Err(
            SemanticError::not_found(format!("path does not exist: {}", root.display()))
                .with_hint("Check the path argument to index"),
        );
    }

    let include_set = build_include_set(&opts.includes)?;

    let mut excludes: HashSet<String> = DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect();
    excludes.extend(opts.excludes.iter().cloned());

    let mut walker = WalkBuilder::new(root);
    walker
        .git_ignore(!opts.no_gitignore)
        .git_global(!opts.no_gitignore)
        .git_exclude(!opts.no_gitignore)
        .filter_entry(move |entry| {
            let name = entry.file_name().to_string_lossy();
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                return !excludes.contains(name.as_ref());
            }
            true
        });

    let mut files: Vec<PathBuf> = Vec::new();
    for entry in walker.build() {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(error = %e, "Walk error, skipping entry");
                continue;
            }
        };
        if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }
        let path = entry.into_path();
        if let Some(ref set) = include_set {
            let rel = path.strip_prefix(root).unwrap_or(&path);
            let name_match = path
                .file_name()
                .map(|n| set.is_match(Path::new(n)))
                .unwrap_or(false);
            if !set.is_match(rel) && !name_match {
                continue;
            }
        }
        files.push(path);
    }

    files.sort();
    Ok(files)
}

fn build_include_set(includes: &[String]) -> Result<Option<GlobSet>, SemanticError> {
    if includes.is_empty() {
        return Ok(None);
    }
    let mut builder = GlobSetBuilder::new();
    for pattern in includes {
        let glob = Glob::new(pattern).map_err(|e| {
            SemanticError::invalid_input(format!("invalid include glob '{}': {}", pattern, e))
                .with_hint("Globs look like '*.rs' or 'src/**/*.md'")
        })?;
        builder.add(glob);
    }
    let set = builder
        .build()
        .map_err(|e| SemanticError::invalid_input(format!("invalid include set: {}", e)))?;
    Ok(Some(set))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch(dir: &Path, rel: &str, content: &str) {
        let path = dir.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, content).unwrap();
    }

    #[test]
    fn test_enumerate_respects_default_excludes() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "src/main.rs", "fn main() {}");
        touch(dir.path(), "node_modules/pkg/index.js", "x");
        touch(dir.path(), "vendor/lib.go", "y");
        let files = enumerate_files(dir.path(), &IndexOptions::default()).unwrap();
        let names: Vec<String> = files
            .iter()
            .map(|p| p.strip_prefix(dir.path()).unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["src/main.rs"]);
    }

    #[test]
    fn test_enumerate_includes_filter() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "a.rs", "x");
        touch(dir.path(), "b.md", "y");
        touch(dir.path(), "deep/c.rs", "z");
        let opts = IndexOptions {
            includes: vec!["*.rs".to_string()],
            ..Default::default()
        };
        let files = enumerate_files(dir.path(), &opts).unwrap();
        assert_eq!(files.len(), 2);
        assert!(files.iter().all(|f| f.extension().unwrap() == "rs"));
    }

    #[test]
    fn test_enumerate_custom_excludes() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "keep/a.rs", "x");
        touch(dir.path(), "skipme/b.rs", "y");
        let opts = IndexOptions {
            excludes: vec!["skipme".to_string()],
            ..Default::default()
        };
        let files = enumerate_files(dir.path(), &opts).unwrap();
        assert_eq!(files.len(), 1);
        assert!(files[0].ends_with("keep/a.rs"));
    }

    #[test]
    fn test_enumerate_gitignore() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), ".gitignore", "ignored.rs\n");
        touch(dir.path(), "ignored.rs", "x");
        touch(dir.path(), "kept.rs", "y");
        // gitignore applies only inside a repo; the ignore crate requires a
        // .git dir for .gitignore to take effect
        std::fs::create_dir_all(dir.path().join(".git")).unwrap();

        let files = enumerate_files(dir.path(), &IndexOptions::default()).unwrap();
        let names: Vec<String> = files
            .iter()
            .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().to_string()))
            .collect();
        assert!(names.contains(&"kept.rs".to_string()));
        assert!(!names.contains(&"ignored.rs".to_string()));

        let opts = IndexOptions {
            no_gitignore: true,
            ..Default::default()
        };
        let files = enumerate_files(dir.path(), &opts).unwrap();
        let names: Vec<String> = files
            .iter()
            .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().to_string()))
            .collect();
        assert!(names.contains(&"ignored.rs".to_string()));
    }

    #[test]
    fn test_enumerate_missing_root() {
        let err = enumerate_files(Path::new("/definitely/not/here"), &IndexOptions::default())
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[test]
    fn test_enumerate_deterministic_order() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "z.rs", "1");
        touch(dir.path(), "a.rs", "2");
        touch(dir.path(), "m/b.rs", "3");
        let first = enumerate_files(dir.path(), &IndexOptions::default()).unwrap();
        let second = enumerate_files(dir.path(), &IndexOptions::default()).unwrap();
        assert_eq!(first, second);
        let mut sorted = first.clone();
        sorted.sort();
        assert_eq!(first, sorted);
    }
}
