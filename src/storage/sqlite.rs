//! Embedded SQLite backend (sqlx async with sync wrappers)
//!
//! All state lives in one database file: chunks with packed-f32 embedding
//! blobs, the per-file manifest, an FTS5 lexical index, memory rows, the
//! retrieval log, and calibration records. Callers use the store
//! synchronously; sqlx operations run on an owned tokio runtime.
//!
//! The first vector write stamps `vector_dim` in metadata; reopening or
//! writing at a different dimension fails closed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use tokio::runtime::Runtime;

use super::{
    chunk_from_parts, cosine_similarity, normalize_for_fts, normalize_path, pack_vector,
    unpack_vector, FileRecord, MemoryEntry, MemoryStatus, RetrievalLogEntry, ScoredChunk,
    SearchScope, Storage, StorageError, StorageStats,
};
use crate::calibration::CalibrationMetadata;
use crate::chunker::{Chunk, Domain};

/// Thread-safe SQLite store.
///
/// Uses sqlx connection pooling with WAL mode for concurrent reads; writes
/// are serialised under a single transaction per file upsert.
pub struct SqliteStore {
    pool: SqlitePool,
    rt: Runtime,
    path: PathBuf,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

/// Full chunk row tuple (matches the column list in CHUNK_COLUMNS).
type ChunkRowTuple = (
    String, // id
    String, // path
    String, // domain
    String, // chunk_type
    String, // name
    String, // signature
    i64,    // start_line
    i64,    // end_line
    String, // content
    String, // language
    String, // content_hash
    i64,    // modified_at
);

const CHUNK_COLUMNS: &str =
    "id, path, domain, chunk_type, name, signature, start_line, end_line, content, language, content_hash, modified_at";

fn row_to_chunk(row: ChunkRowTuple) -> Chunk {
    chunk_from_parts(
        row.0, row.1, &row.2, &row.3, row.4, row.5, row.6, row.7, row.8, row.9, row.10, row.11,
    )
}

impl SqliteStore {
    /// Open (creating if missing) the database at `path`.
    ///
    /// When `expected_dim` is known (the embedder has been probed), a stored
    /// dimension that disagrees fails closed before any query runs.
    pub fn open(path: &Path, expected_dim: Option<usize>) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let rt = Runtime::new().map_err(|e| StorageError::Runtime(e.to_string()))?;

        let path_str = path.to_string_lossy().replace('\\', "/");
        let db_url = format!("sqlite://{}?mode=rwc", path_str);

        let pool = rt.block_on(async {
            SqlitePoolOptions::new()
                .max_connections(4)
                .after_connect(|conn, _meta| {
                    Box::pin(async move {
                        sqlx::query("PRAGMA foreign_keys = ON")
                            .execute(&mut *conn)
                            .await?;
                        // WAL mode: concurrent reads, single writer
                        sqlx::query("PRAGMA journal_mode = WAL")
                            .execute(&mut *conn)
                            .await?;
                        sqlx::query("PRAGMA busy_timeout = 5000")
                            .execute(&mut *conn)
                            .await?;
                        // NORMAL sync is safe with WAL
                        sqlx::query("PRAGMA synchronous = NORMAL")
                            .execute(&mut *conn)
                            .await?;
                        Ok(())
                    })
                })
                .connect(&db_url)
                .await
        })?;

        let store = Self {
            pool,
            rt,
            path: path.to_path_buf(),
        };

        store.init_schema()?;

        // Index files contain repository text; keep them private
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let restrictive = std::fs::Permissions::from_mode(0o600);
            let _ = std::fs::set_permissions(path, restrictive);
        }

        if let Some(dim) = expected_dim {
            if let Some(stored) = store.vector_dim()? {
                if stored != dim {
                    return Err(StorageError::DimensionMismatch {
                        stored,
                        current: dim,
                    });
                }
            }
        }

        tracing::debug!(path = %path.display(), "SQLite store opened");
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StorageError> {
        self.rt.block_on(async {
            let schema = include_str!("schema.sql");
            for statement in schema.split(';') {
                let stmt: String = statement
                    .lines()
                    .filter(|line| !line.trim().starts_with("--"))
                    .collect::<Vec<_>>()
                    .join("\n");
                let stmt = stmt.trim();
                if stmt.is_empty() {
                    continue;
                }
                sqlx::query(stmt).execute(&self.pool).await?;
            }
            Ok(())
        })
    }

    fn get_metadata(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.rt.block_on(async {
            let row: Option<(String,)> =
                sqlx::query_as("SELECT value FROM metadata WHERE key = ?1")
                    .bind(key)
                    .fetch_optional(&self.pool)
                    .await?;
            Ok(row.map(|(v,)| v))
        })
    }

    fn put_metadata(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.rt.block_on(async {
            sqlx::query("INSERT OR REPLACE INTO metadata (key, value) VALUES (?1, ?2)")
                .bind(key)
                .bind(value)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
    }

    /// Candidate (id, path, embedding) rows under the scope's SQL-expressible
    /// filters; the path prefix is applied by the caller.
    fn candidate_rows(
        &self,
        scope: &SearchScope,
    ) -> Result<Vec<(String, String, Vec<u8>)>, StorageError> {
        let mut sql = String::from("SELECT id, path, embedding FROM chunks");
        let mut clauses: Vec<String> = Vec::new();
        let mut binds: Vec<String> = Vec::new();

        if let Some(domain) = scope.domain {
            clauses.push(format!("domain = ?{}", binds.len() + 1));
            binds.push(domain.to_string());
        }
        if let Some(ref types) = scope.chunk_types {
            let placeholders: Vec<String> = (0..types.len())
                .map(|i| format!("?{}", binds.len() + i + 1))
                .collect();
            clauses.push(format!("chunk_type IN ({})", placeholders.join(",")));
            for t in types {
                binds.push(t.to_string());
            }
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }

        self.rt.block_on(async {
            let mut query = sqlx::query_as::<_, (String, String, Vec<u8>)>(&sql);
            for bind in &binds {
                query = query.bind(bind);
            }
            Ok(query.fetch_all(&self.pool).await?)
        })
    }

    /// Fetch full chunks for a ranked id list, preserving the given order.
    fn chunks_by_ids(&self, ranked: &[(String, f32)]) -> Result<Vec<ScoredChunk>, StorageError> {
        if ranked.is_empty() {
            return Ok(vec![]);
        }
        let placeholders: Vec<String> = (1..=ranked.len()).map(|i| format!("?{}", i)).collect();
        let sql = format!(
            "SELECT {} FROM chunks WHERE id IN ({})",
            CHUNK_COLUMNS,
            placeholders.join(",")
        );

        let rows: Vec<ChunkRowTuple> = self.rt.block_on(async {
            let mut query = sqlx::query_as::<_, ChunkRowTuple>(&sql);
            for (id, _) in ranked {
                query = query.bind(id);
            }
            Ok::<_, StorageError>(query.fetch_all(&self.pool).await?)
        })?;

        let mut by_id: HashMap<String, Chunk> = rows
            .into_iter()
            .map(row_to_chunk)
            .map(|c| (c.id.clone(), c))
            .collect();

        Ok(ranked
            .iter()
            .filter_map(|(id, score)| {
                by_id.remove(id).map(|chunk| ScoredChunk {
                    chunk,
                    score: *score,
                })
            })
            .collect())
    }

    fn row_to_memory(row: MemoryRowTuple) -> MemoryEntry {
        let tags: Vec<String> = serde_json::from_str(&row.3).unwrap_or_default();
        let status = row.5.parse().unwrap_or(MemoryStatus::Pending);
        MemoryEntry {
            id: row.0,
            question: row.1,
            answer: row.2,
            tags,
            source: row.4,
            status,
            occurrences: row.6.clamp(0, u32::MAX as i64) as u32,
            created_at: row.7,
            updated_at: row.8,
        }
    }
}

type MemoryRowTuple = (
    String, // id
    String, // question
    String, // answer
    String, // tags json
    String, // source
    String, // status
    i64,    // occurrences
    String, // created_at
    String, // updated_at
);

const MEMORY_COLUMNS: &str =
    "id, question, answer, tags, source, status, occurrences, created_at, updated_at";

impl Storage for SqliteStore {
    fn backend_name(&self) -> &'static str {
        "sqlite"
    }

    fn vector_dim(&self) -> Result<Option<usize>, StorageError> {
        Ok(self
            .get_metadata("vector_dim")?
            .and_then(|v| v.parse().ok()))
    }

    fn ensure_dim(&self, dim: usize, model: &str) -> Result<(), StorageError> {
        match self.vector_dim()? {
            Some(stored) if stored != dim => Err(StorageError::DimensionMismatch {
                stored,
                current: dim,
            }),
            Some(_) => Ok(()),
            None => {
                self.put_metadata("vector_dim", &dim.to_string())?;
                self.put_metadata("embedding_model", model)?;
                self.put_metadata("created_at", &chrono::Utc::now().to_rfc3339())?;
                Ok(())
            }
        }
    }

    fn upsert_file(
        &self,
        record: &FileRecord,
        chunks: &[Chunk],
        vectors: &[Vec<f32>],
    ) -> Result<(), StorageError> {
        if chunks.len() != vectors.len() {
            return Err(StorageError::Runtime(format!(
                "chunk/vector count mismatch: {} chunks, {} vectors",
                chunks.len(),
                vectors.len()
            )));
        }
        if let Some(dim) = self.vector_dim()? {
            if let Some(bad) = vectors.iter().find(|v| v.len() != dim) {
                return Err(StorageError::DimensionMismatch {
                    stored: dim,
                    current: bad.len(),
                });
            }
        }

        self.rt.block_on(async {
            let mut tx = self.pool.begin().await?;

            // Delete-then-insert for this (path, domain)
            sqlx::query(
                "DELETE FROM chunks_fts WHERE domain = ?2 AND id IN (SELECT id FROM chunks WHERE path = ?1 AND domain = ?2)",
            )
            .bind(&record.path)
            .bind(record.domain.to_string())
            .execute(&mut *tx)
            .await?;
            sqlx::query("DELETE FROM chunks WHERE path = ?1 AND domain = ?2")
                .bind(&record.path)
                .bind(record.domain.to_string())
                .execute(&mut *tx)
                .await?;

            for (chunk, vector) in chunks.iter().zip(vectors) {
                sqlx::query(
                    "INSERT OR REPLACE INTO chunks (id, path, domain, chunk_type, name, signature, start_line, end_line, content, language, content_hash, modified_at, embedding)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                )
                .bind(&chunk.id)
                .bind(normalize_path(&chunk.file_path))
                .bind(chunk.domain.to_string())
                .bind(chunk.chunk_type.to_string())
                .bind(&chunk.name)
                .bind(&chunk.signature)
                .bind(chunk.start_line as i64)
                .bind(chunk.end_line as i64)
                .bind(&chunk.content)
                .bind(&chunk.language)
                .bind(&chunk.content_hash)
                .bind(chunk.modified_at)
                .bind(pack_vector(vector))
                .execute(&mut *tx)
                .await?;

                let fts_text = format!(
                    "{} {} {}",
                    normalize_for_fts(&chunk.name),
                    normalize_for_fts(&chunk.signature),
                    normalize_for_fts(&chunk.content)
                );
                sqlx::query("INSERT INTO chunks_fts (id, domain, content) VALUES (?1, ?2, ?3)")
                    .bind(&chunk.id)
                    .bind(chunk.domain.to_string())
                    .bind(fts_text.trim())
                    .execute(&mut *tx)
                    .await?;
            }

            sqlx::query(
                "INSERT OR REPLACE INTO files (path, domain, content_hash, mtime, chunk_count, indexed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )
            .bind(&record.path)
            .bind(record.domain.to_string())
            .bind(&record.content_hash)
            .bind(record.mtime)
            .bind(chunks.len() as i64)
            .bind(&record.indexed_at)
            .execute(&mut *tx)
            .await?;

            sqlx::query("INSERT OR REPLACE INTO metadata (key, value) VALUES ('updated_at', ?1)")
                .bind(chrono::Utc::now().to_rfc3339())
                .execute(&mut *tx)
                .await?;

            tx.commit().await?;
            Ok(())
        })
    }

    fn delete_file(&self, path: &str, domain: Domain) -> Result<u32, StorageError> {
        self.rt.block_on(async {
            let mut tx = self.pool.begin().await?;
            sqlx::query(
                "DELETE FROM chunks_fts WHERE domain = ?2 AND id IN (SELECT id FROM chunks WHERE path = ?1 AND domain = ?2)",
            )
            .bind(path)
            .bind(domain.to_string())
            .execute(&mut *tx)
            .await?;
            let deleted = sqlx::query("DELETE FROM chunks WHERE path = ?1 AND domain = ?2")
                .bind(path)
                .bind(domain.to_string())
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM files WHERE path = ?1 AND domain = ?2")
                .bind(path)
                .bind(domain.to_string())
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            Ok(deleted.rows_affected() as u32)
        })
    }

    fn delete_domain(&self, domain: Domain) -> Result<u64, StorageError> {
        self.rt.block_on(async {
            let mut tx = self.pool.begin().await?;
            sqlx::query("DELETE FROM chunks_fts WHERE domain = ?1")
                .bind(domain.to_string())
                .execute(&mut *tx)
                .await?;
            let deleted = sqlx::query("DELETE FROM chunks WHERE domain = ?1")
                .bind(domain.to_string())
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM files WHERE domain = ?1")
                .bind(domain.to_string())
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM calibration WHERE domain = ?1")
                .bind(domain.to_string())
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            Ok(deleted.rows_affected())
        })
    }

    fn get_file_record(
        &self,
        path: &str,
        domain: Domain,
    ) -> Result<Option<FileRecord>, StorageError> {
        self.rt.block_on(async {
            let row: Option<(String, i64, i64, String)> = sqlx::query_as(
                "SELECT content_hash, mtime, chunk_count, indexed_at FROM files WHERE path = ?1 AND domain = ?2",
            )
            .bind(path)
            .bind(domain.to_string())
            .fetch_optional(&self.pool)
            .await?;
            Ok(row.map(|(content_hash, mtime, chunk_count, indexed_at)| FileRecord {
                path: path.to_string(),
                domain,
                content_hash,
                mtime,
                chunk_count: chunk_count.clamp(0, u32::MAX as i64) as u32,
                indexed_at,
            }))
        })
    }

    fn list_files(&self, domain: Domain) -> Result<Vec<FileRecord>, StorageError> {
        self.rt.block_on(async {
            let rows: Vec<(String, String, i64, i64, String)> = sqlx::query_as(
                "SELECT path, content_hash, mtime, chunk_count, indexed_at FROM files WHERE domain = ?1 ORDER BY path",
            )
            .bind(domain.to_string())
            .fetch_all(&self.pool)
            .await?;
            Ok(rows
                .into_iter()
                .map(|(path, content_hash, mtime, chunk_count, indexed_at)| FileRecord {
                    path,
                    domain,
                    content_hash,
                    mtime,
                    chunk_count: chunk_count.clamp(0, u32::MAX as i64) as u32,
                    indexed_at,
                })
                .collect())
        })
    }

    fn embeddings_by_hash(
        &self,
        hashes: &[&str],
    ) -> Result<HashMap<String, Vec<f32>>, StorageError> {
        if hashes.is_empty() {
            return Ok(HashMap::new());
        }
        // SQLite's bind limit is ~999; chunk the lookup
        let mut result = HashMap::new();
        for batch in hashes.chunks(500) {
            let placeholders: Vec<String> = (1..=batch.len()).map(|i| format!("?{}", i)).collect();
            let sql = format!(
                "SELECT content_hash, embedding FROM chunks WHERE content_hash IN ({})",
                placeholders.join(",")
            );
            let rows: Vec<(String, Vec<u8>)> = self.rt.block_on(async {
                let mut query = sqlx::query_as::<_, (String, Vec<u8>)>(&sql);
                for hash in batch {
                    query = query.bind(*hash);
                }
                Ok::<_, StorageError>(query.fetch_all(&self.pool).await?)
            })?;
            for (hash, blob) in rows {
                if let Some(vector) = unpack_vector(&blob) {
                    result.insert(hash, vector);
                }
            }
        }
        Ok(result)
    }

    fn dense_top_k(
        &self,
        query: &[f32],
        k: usize,
        scope: &SearchScope,
    ) -> Result<Vec<ScoredChunk>, StorageError> {
        let _span = tracing::debug_span!("dense_top_k", k = k).entered();

        let rows = self.candidate_rows(scope)?;

        let mut scored: Vec<(String, f32)> = rows
            .into_iter()
            .filter_map(|(id, path, blob)| {
                if let Some(ref prefix) = scope.path_prefix {
                    if !path.starts_with(prefix.as_str()) {
                        return None;
                    }
                }
                let vector = match unpack_vector(&blob) {
                    Some(v) if v.len() == query.len() => v,
                    _ => {
                        tracing::warn!(chunk_id = %id, "Skipping chunk with unreadable embedding");
                        return None;
                    }
                };
                Some((id, cosine_similarity(query, &vector)))
            })
            .collect();

        // Score descending, ties by chunk id ascending: deterministic results
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        scored.truncate(k);

        self.chunks_by_ids(&scored)
    }

    fn fts_top_k(
        &self,
        query: &str,
        k: usize,
        scope: &SearchScope,
    ) -> Result<Vec<ScoredChunk>, StorageError> {
        let normalized = normalize_for_fts(query);
        if normalized.is_empty() {
            return Ok(vec![]);
        }
        // Quote each token; OR keeps recall up for multi-word queries while
        // BM25 still ranks full matches first
        let match_expr = normalized
            .split(' ')
            .map(|t| format!("\"{}\"", t))
            .collect::<Vec<_>>()
            .join(" OR ");

        let mut sql = String::from(
            "SELECT chunks_fts.id, bm25(chunks_fts) AS rank, chunks.path FROM chunks_fts \
             JOIN chunks ON chunks.id = chunks_fts.id AND chunks.domain = chunks_fts.domain \
             WHERE chunks_fts MATCH ?1",
        );
        let mut binds: Vec<String> = vec![match_expr];
        if let Some(domain) = scope.domain {
            sql.push_str(&format!(" AND chunks.domain = ?{}", binds.len() + 1));
            binds.push(domain.to_string());
        }
        if let Some(ref types) = scope.chunk_types {
            let placeholders: Vec<String> = (0..types.len())
                .map(|i| format!("?{}", binds.len() + i + 1))
                .collect();
            sql.push_str(&format!(
                " AND chunks.chunk_type IN ({})",
                placeholders.join(",")
            ));
            for t in types {
                binds.push(t.to_string());
            }
        }
        sql.push_str(" ORDER BY rank LIMIT ?");
        eprintln!("DEBUG SQL={:?} BINDS={:?}", sql, binds);

        let rows: Vec<(String, f64, String)> = self.rt.block_on(async {
            use sqlx::Row;
            let mut q = sqlx::query(&sql);
            for bind in &binds {
                q = q.bind(bind);
            }
            q = q.bind((k * 4).max(k) as i64);
            let raw_rows = q.fetch_all(&self.pool).await?;
            for r in &raw_rows {
                eprintln!("DEBUG ROW col0={:?} col1_type={:?}", r.try_get::<String,_>(0), r.column(1).type_id());
            }
            Ok::<_, StorageError>(vec![])
        })?;

        let ranked: Vec<(String, f32)> = rows
            .into_iter()
            .filter(|(_, _, path)| match scope.path_prefix {
                Some(ref prefix) => path.starts_with(prefix.as_str()),
                None => true,
            })
            .map(|(id, rank, _)| (id, (-rank).max(0.0) as f32))
            .take(k)
            .collect();

        self.chunks_by_ids(&ranked)
    }

    fn stats(&self) -> Result<StorageStats, StorageError> {
        self.rt.block_on(async {
            let (chunks_total,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM chunks")
                .fetch_one(&self.pool)
                .await?;
            let (files_indexed,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM files")
                .fetch_one(&self.pool)
                .await?;

            let file_rows: Vec<(String, i64)> =
                sqlx::query_as("SELECT domain, COUNT(*) FROM files GROUP BY domain")
                    .fetch_all(&self.pool)
                    .await?;
            let chunk_rows: Vec<(String, i64)> =
                sqlx::query_as("SELECT domain, COUNT(*) FROM chunks GROUP BY domain")
                    .fetch_all(&self.pool)
                    .await?;

            let mut by_domain: HashMap<Domain, (u64, u64)> = HashMap::new();
            for (domain, count) in file_rows {
                if let Ok(d) = domain.parse::<Domain>() {
                    by_domain.entry(d).or_default().0 = count as u64;
                }
            }
            for (domain, count) in chunk_rows {
                if let Ok(d) = domain.parse::<Domain>() {
                    by_domain.entry(d).or_default().1 = count as u64;
                }
            }

            let last_updated: Option<(String,)> =
                sqlx::query_as("SELECT value FROM metadata WHERE key = 'updated_at'")
                    .fetch_optional(&self.pool)
                    .await?;
            let vector_dim: Option<(String,)> =
                sqlx::query_as("SELECT value FROM metadata WHERE key = 'vector_dim'")
                    .fetch_optional(&self.pool)
                    .await?;
            let model: Option<(String,)> =
                sqlx::query_as("SELECT value FROM metadata WHERE key = 'embedding_model'")
                    .fetch_optional(&self.pool)
                    .await?;

            let size_bytes = std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);

            Ok(StorageStats {
                files_indexed: files_indexed as u64,
                chunks_total: chunks_total as u64,
                last_updated: last_updated.map(|(v,)| v).unwrap_or_default(),
                by_domain,
                vector_dim: vector_dim.and_then(|(v,)| v.parse().ok()),
                embedding_model: model.map(|(v,)| v),
                size_bytes,
            })
        })
    }

    fn get_calibration(
        &self,
        domain: Domain,
    ) -> Result<Option<CalibrationMetadata>, StorageError> {
        self.rt.block_on(async {
            let row: Option<(String, String, f64, f64, f64, f64, f64, f64, i64)> = sqlx::query_as(
                "SELECT embedding_model, calibration_date, perfect_match_score, baseline_score, score_range, threshold_high, threshold_medium, threshold_low, vector_dim
                 FROM calibration WHERE domain = ?1",
            )
            .bind(domain.to_string())
            .fetch_optional(&self.pool)
            .await?;
            Ok(row.map(
                |(model, date, perfect, baseline, range, high, medium, low, dim)| {
                    CalibrationMetadata {
                        domain,
                        embedding_model: model,
                        calibration_date: date,
                        perfect_match_score: perfect as f32,
                        baseline_score: baseline as f32,
                        score_range: range as f32,
                        threshold_high: high as f32,
                        threshold_medium: medium as f32,
                        threshold_low: low as f32,
                        vector_dim: dim.max(0) as usize,
                    }
                },
            ))
        })
    }

    fn put_calibration(&self, meta: &CalibrationMetadata) -> Result<(), StorageError> {
        self.rt.block_on(async {
            sqlx::query(
                "INSERT OR REPLACE INTO calibration (domain, embedding_model, calibration_date, perfect_match_score, baseline_score, score_range, threshold_high, threshold_medium, threshold_low, vector_dim)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )
            .bind(meta.domain.to_string())
            .bind(&meta.embedding_model)
            .bind(&meta.calibration_date)
            .bind(meta.perfect_match_score as f64)
            .bind(meta.baseline_score as f64)
            .bind(meta.score_range as f64)
            .bind(meta.threshold_high as f64)
            .bind(meta.threshold_medium as f64)
            .bind(meta.threshold_low as f64)
            .bind(meta.vector_dim as i64)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
    }

    // ===== memory =====

    fn memory_upsert(&self, entry: &MemoryEntry, vector: &[f32]) -> Result<bool, StorageError> {
        self.rt.block_on(async {
            let existing: Option<(i64,)> =
                sqlx::query_as("SELECT occurrences FROM memories WHERE id = ?1")
                    .bind(&entry.id)
                    .fetch_optional(&self.pool)
                    .await?;
            let is_new = existing.is_none();
            let tags = serde_json::to_string(&entry.tags)
                .map_err(|e| StorageError::Runtime(e.to_string()))?;

            match existing {
                Some((occurrences,)) => {
                    sqlx::query(
                        "UPDATE memories SET question = ?1, answer = ?2, tags = ?3, source = ?4, occurrences = ?5, updated_at = ?6, embedding = ?7 WHERE id = ?8",
                    )
                    .bind(&entry.question)
                    .bind(&entry.answer)
                    .bind(&tags)
                    .bind(&entry.source)
                    .bind(occurrences + 1)
                    .bind(&entry.updated_at)
                    .bind(pack_vector(vector))
                    .bind(&entry.id)
                    .execute(&self.pool)
                    .await?;
                }
                None => {
                    sqlx::query(
                        "INSERT INTO memories (id, question, answer, tags, source, status, occurrences, created_at, updated_at, embedding)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7, ?8, ?9)",
                    )
                    .bind(&entry.id)
                    .bind(&entry.question)
                    .bind(&entry.answer)
                    .bind(&tags)
                    .bind(&entry.source)
                    .bind(entry.status.to_string())
                    .bind(&entry.created_at)
                    .bind(&entry.updated_at)
                    .bind(pack_vector(vector))
                    .execute(&self.pool)
                    .await?;
                }
            }
            Ok(is_new)
        })
    }

    fn memory_get(&self, id: &str) -> Result<Option<MemoryEntry>, StorageError> {
        let sql = format!("SELECT {} FROM memories WHERE id = ?1", MEMORY_COLUMNS);
        self.rt.block_on(async {
            let row: Option<MemoryRowTuple> = sqlx::query_as(&sql)
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row.map(Self::row_to_memory))
        })
    }

    fn memory_list(
        &self,
        status: Option<MemoryStatus>,
        tag: Option<&str>,
        limit: usize,
    ) -> Result<Vec<MemoryEntry>, StorageError> {
        let mut sql = format!("SELECT {} FROM memories", MEMORY_COLUMNS);
        if status.is_some() {
            sql.push_str(" WHERE status = ?1");
        }
        sql.push_str(" ORDER BY updated_at DESC");

        let rows: Vec<MemoryRowTuple> = self.rt.block_on(async {
            let mut q = sqlx::query_as::<_, MemoryRowTuple>(&sql);
            if let Some(s) = status {
                q = q.bind(s.to_string());
            }
            Ok::<_, StorageError>(q.fetch_all(&self.pool).await?)
        })?;

        let entries = rows
            .into_iter()
            .map(Self::row_to_memory)
            .filter(|m| match tag {
                Some(t) => m.tags.iter().any(|mt| mt == t),
                None => true,
            })
            .take(limit)
            .collect();
        Ok(entries)
    }

    fn memory_delete(&self, id: &str) -> Result<bool, StorageError> {
        self.rt.block_on(async {
            let mut tx = self.pool.begin().await?;
            let result = sqlx::query("DELETE FROM memories WHERE id = ?1")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM retrievals WHERE memory_id = ?1")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            Ok(result.rows_affected() > 0)
        })
    }

    fn memory_set_status(&self, id: &str, status: MemoryStatus) -> Result<(), StorageError> {
        self.rt.block_on(async {
            let result =
                sqlx::query("UPDATE memories SET status = ?1, updated_at = ?2 WHERE id = ?3")
                    .bind(status.to_string())
                    .bind(chrono::Utc::now().to_rfc3339())
                    .bind(id)
                    .execute(&self.pool)
                    .await?;
            if result.rows_affected() == 0 {
                return Err(StorageError::NotFound(format!("memory {}", id)));
            }
            Ok(())
        })
    }

    fn memory_all(&self) -> Result<Vec<(MemoryEntry, Vec<f32>)>, StorageError> {
        let sql = format!("SELECT {}, embedding FROM memories", MEMORY_COLUMNS);
        type Row = (
            String,
            String,
            String,
            String,
            String,
            String,
            i64,
            String,
            String,
            Vec<u8>,
        );
        let rows: Vec<Row> = self
            .rt
            .block_on(async { Ok::<_, StorageError>(sqlx::query_as(&sql).fetch_all(&self.pool).await?) })?;

        Ok(rows
            .into_iter()
            .filter_map(|r| {
                let blob = r.9;
                let entry =
                    Self::row_to_memory((r.0, r.1, r.2, r.3, r.4, r.5, r.6, r.7, r.8));
                match unpack_vector(&blob) {
                    Some(vector) => Some((entry, vector)),
                    None => {
                        tracing::warn!(memory_id = %entry.id, "Skipping memory with unreadable embedding");
                        None
                    }
                }
            })
            .collect())
    }

    // ===== retrieval log =====

    fn track_retrievals(&self, entries: &[RetrievalLogEntry]) -> Result<(), StorageError> {
        if entries.is_empty() {
            return Ok(());
        }
        self.rt.block_on(async {
            let mut tx = self.pool.begin().await?;
            for entry in entries {
                sqlx::query(
                    "INSERT INTO retrievals (memory_id, query, score, ts) VALUES (?1, ?2, ?3, ?4)",
                )
                .bind(&entry.memory_id)
                .bind(&entry.query)
                .bind(entry.score as f64)
                .bind(entry.ts)
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await?;
            Ok(())
        })
    }

    fn retrieval_history(
        &self,
        memory_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<RetrievalLogEntry>, StorageError> {
        let sql = match memory_id {
            Some(_) => {
                "SELECT memory_id, query, score, ts FROM retrievals WHERE memory_id = ?1 ORDER BY ts DESC LIMIT ?2"
            }
            None => "SELECT memory_id, query, score, ts FROM retrievals ORDER BY ts DESC LIMIT ?1",
        };
        let rows: Vec<(String, String, f64, i64)> = self.rt.block_on(async {
            let mut q = sqlx::query_as::<_, (String, String, f64, i64)>(sql);
            if let Some(id) = memory_id {
                q = q.bind(id);
            }
            q = q.bind(limit as i64);
            Ok::<_, StorageError>(q.fetch_all(&self.pool).await?)
        })?;
        Ok(rows
            .into_iter()
            .map(|(memory_id, query, score, ts)| RetrievalLogEntry {
                memory_id,
                query,
                score: score as f32,
                ts,
            })
            .collect())
    }

    fn retrieval_count(&self) -> Result<u64, StorageError> {
        self.rt.block_on(async {
            let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM retrievals")
                .fetch_one(&self.pool)
                .await?;
            Ok(count as u64)
        })
    }

    fn prune_retrievals(&self, older_than_days: u32) -> Result<u64, StorageError> {
        let cutoff = chrono::Utc::now().timestamp() - (older_than_days as i64) * 86_400;
        self.rt.block_on(async {
            let result = sqlx::query("DELETE FROM retrievals WHERE ts < ?1")
                .bind(cutoff)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::ChunkType;
    use tempfile::TempDir;

    fn open_store(dir: &TempDir) -> SqliteStore {
        SqliteStore::open(&dir.path().join("semantic.db"), None).unwrap()
    }

    fn make_chunk(path: &str, line: u32, content: &str, domain: Domain) -> Chunk {
        let mut chunk = Chunk::build(
            Path::new(path),
            ChunkType::Function,
            format!("chunk_{}", line),
            "",
            line,
            line + 2,
            content.to_string(),
            "rust",
        );
        chunk.domain = domain;
        chunk
    }

    fn make_record(path: &str, domain: Domain, hash: &str) -> FileRecord {
        FileRecord {
            path: path.to_string(),
            domain,
            content_hash: hash.to_string(),
            mtime: 1_700_000_000,
            chunk_count: 0,
            indexed_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    fn unit(dim: usize, idx: usize) -> Vec<f32> {
        let mut v = vec![0.0; dim];
        v[idx % dim] = 1.0;
        v
    }

    #[test]
    fn test_upsert_and_file_record() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store.ensure_dim(4, "test-model").unwrap();

        let chunks = vec![
            make_chunk("src/a.rs", 1, "fn alpha() {}", Domain::Code),
            make_chunk("src/a.rs", 10, "fn beta() {}", Domain::Code),
        ];
        let vectors = vec![unit(4, 0), unit(4, 1)];
        let record = make_record("src/a.rs", Domain::Code, "hash1");
        store.upsert_file(&record, &chunks, &vectors).unwrap();

        let fetched = store.get_file_record("src/a.rs", Domain::Code).unwrap().unwrap();
        assert_eq!(fetched.content_hash, "hash1");
        assert_eq!(fetched.chunk_count, 2);
        assert!(store.get_file_record("src/a.rs", Domain::Docs).unwrap().is_none());

        let stats = store.stats().unwrap();
        assert_eq!(stats.files_indexed, 1);
        assert_eq!(stats.chunks_total, 2);
        assert_eq!(stats.vector_dim, Some(4));
    }

    #[test]
    fn test_upsert_replaces_atomically() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store.ensure_dim(4, "m").unwrap();

        let chunks = vec![
            make_chunk("a.rs", 1, "fn one() {}", Domain::Code),
            make_chunk("a.rs", 5, "fn two() {}", Domain::Code),
        ];
        store
            .upsert_file(&make_record("a.rs", Domain::Code, "h1"), &chunks, &vec![unit(4, 0), unit(4, 1)])
            .unwrap();

        // Replace with a single different chunk
        let chunks2 = vec![make_chunk("a.rs", 1, "fn three() {}", Domain::Code)];
        store
            .upsert_file(&make_record("a.rs", Domain::Code, "h2"), &chunks2, &vec![unit(4, 2)])
            .unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.chunks_total, 1);
        let record = store.get_file_record("a.rs", Domain::Code).unwrap().unwrap();
        assert_eq!(record.content_hash, "h2");
    }

    #[test]
    fn test_dense_top_k_ordering_and_ties() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store.ensure_dim(4, "m").unwrap();

        // Two chunks with identical vectors (tie) and one orthogonal
        let c1 = make_chunk("a.rs", 1, "fn aaa() {}", Domain::Code);
        let c2 = make_chunk("a.rs", 10, "fn bbb() {}", Domain::Code);
        let c3 = make_chunk("a.rs", 20, "fn ccc() {}", Domain::Code);
        let ids: Vec<String> = vec![c1.id.clone(), c2.id.clone()];
        store
            .upsert_file(
                &make_record("a.rs", Domain::Code, "h"),
                &[c1, c2, c3],
                &[unit(4, 0), unit(4, 0), unit(4, 1)],
            )
            .unwrap();

        let results = store
            .dense_top_k(&unit(4, 0), 10, &SearchScope::for_domain(Domain::Code))
            .unwrap();
        assert_eq!(results.len(), 3);
        assert!(results[0].score > results[2].score);
        // Tie broken by chunk id ascending
        let mut tied: Vec<String> = vec![results[0].chunk.id.clone(), results[1].chunk.id.clone()];
        tied.sort();
        let mut expected = ids;
        expected.sort();
        assert_eq!(tied, expected);
        assert_eq!(results[0].chunk.id, tied[0]);
    }

    #[test]
    fn test_dense_scope_filters() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store.ensure_dim(4, "m").unwrap();

        let code = make_chunk("src/a.rs", 1, "fn code_fn() {}", Domain::Code);
        let docs = make_chunk("docs/b.md", 1, "## docs section", Domain::Docs);
        store
            .upsert_file(&make_record("src/a.rs", Domain::Code, "h1"), &[code], &[unit(4, 0)])
            .unwrap();
        store
            .upsert_file(&make_record("docs/b.md", Domain::Docs, "h2"), &[docs], &[unit(4, 0)])
            .unwrap();

        let code_only = store
            .dense_top_k(&unit(4, 0), 10, &SearchScope::for_domain(Domain::Code))
            .unwrap();
        assert_eq!(code_only.len(), 1);
        assert_eq!(code_only[0].chunk.domain, Domain::Code);

        let prefixed = store
            .dense_top_k(
                &unit(4, 0),
                10,
                &SearchScope {
                    path_prefix: Some("docs/".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(prefixed.len(), 1);
        assert_eq!(prefixed[0].chunk.domain, Domain::Docs);

        let typed = store
            .dense_top_k(
                &unit(4, 0),
                10,
                &SearchScope {
                    chunk_types: Some(vec![ChunkType::Section]),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(typed.len(), 0); // both test chunks are functions
    }

    #[test]
    fn test_fts_top_k() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store.ensure_dim(4, "m").unwrap();

        let c1 = make_chunk("a.rs", 1, "fn parseConfigFile() { read_yaml(); }", Domain::Code);
        let c2 = make_chunk("a.rs", 10, "fn renderOutput() { draw(); }", Domain::Code);
        store
            .upsert_file(
                &make_record("a.rs", Domain::Code, "h"),
                &[c1, c2],
                &[unit(4, 0), unit(4, 1)],
            )
            .unwrap();

        let hits = store
            .fts_top_k("parse config", 10, &SearchScope::for_domain(Domain::Code))
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].chunk.content.contains("parseConfigFile"));
        assert!(hits[0].score >= 0.0);

        let none = store
            .fts_top_k("zzz_missing_term", 10, &SearchScope::default())
            .unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn test_delete_file_and_domain() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store.ensure_dim(4, "m").unwrap();

        for (path, domain) in [("a.rs", Domain::Code), ("b.md", Domain::Docs)] {
            let chunk = make_chunk(path, 1, &format!("content of {}", path), domain);
            store
                .upsert_file(&make_record(path, domain, "h"), &[chunk], &[unit(4, 0)])
                .unwrap();
        }

        let removed = store.delete_file("a.rs", Domain::Code).unwrap();
        assert_eq!(removed, 1);
        assert!(store.get_file_record("a.rs", Domain::Code).unwrap().is_none());

        let removed = store.delete_domain(Domain::Docs).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.stats().unwrap().chunks_total, 0);
    }

    #[test]
    fn test_dimension_fail_closed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("semantic.db");
        {
            let store = SqliteStore::open(&path, None).unwrap();
            store.ensure_dim(4, "model-a").unwrap();
        }
        // Reopen with a different probed dimension
        let err = SqliteStore::open(&path, Some(8)).unwrap_err();
        assert!(matches!(
            err,
            StorageError::DimensionMismatch { stored: 4, current: 8 }
        ));
        // Same dimension reopens fine
        let store = SqliteStore::open(&path, Some(4)).unwrap();
        let err = store.ensure_dim(8, "model-b").unwrap_err();
        assert!(matches!(err, StorageError::DimensionMismatch { .. }));
    }

    #[test]
    fn test_embeddings_by_hash() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store.ensure_dim(4, "m").unwrap();

        let chunk = make_chunk("a.rs", 1, "fn cached() {}", Domain::Code);
        let hash = chunk.content_hash.clone();
        store
            .upsert_file(&make_record("a.rs", Domain::Code, "h"), &[chunk], &[unit(4, 2)])
            .unwrap();

        let found = store.embeddings_by_hash(&[hash.as_str(), "missing"]).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[&hash], unit(4, 2));
    }

    #[test]
    fn test_calibration_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        assert!(store.get_calibration(Domain::Code).unwrap().is_none());

        let meta = crate::calibration::default_calibration(Domain::Code, "model-x", 4);
        store.put_calibration(&meta).unwrap();
        let fetched = store.get_calibration(Domain::Code).unwrap().unwrap();
        assert_eq!(fetched.embedding_model, "model-x");
        assert_eq!(fetched.vector_dim, 4);
        assert!((fetched.threshold_high - meta.threshold_high).abs() < 1e-6);
    }

    #[test]
    fn test_memory_round_trip_and_occurrences() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        let now = chrono::Utc::now().to_rfc3339();
        let entry = MemoryEntry {
            id: "mem1".into(),
            question: "How do I reset?".into(),
            answer: "Run the reset command.".into(),
            tags: vec!["ops".into()],
            source: "manual".into(),
            status: MemoryStatus::Pending,
            occurrences: 1,
            created_at: now.clone(),
            updated_at: now,
        };
        assert!(store.memory_upsert(&entry, &unit(4, 0)).unwrap());
        // Re-storing the same id is an update, not an insert
        assert!(!store.memory_upsert(&entry, &unit(4, 0)).unwrap());

        let fetched = store.memory_get("mem1").unwrap().unwrap();
        assert_eq!(fetched.occurrences, 2);
        assert_eq!(fetched.tags, vec!["ops".to_string()]);

        let listed = store.memory_list(Some(MemoryStatus::Pending), None, 10).unwrap();
        assert_eq!(listed.len(), 1);
        let tagged = store.memory_list(None, Some("ops"), 10).unwrap();
        assert_eq!(tagged.len(), 1);
        let missing_tag = store.memory_list(None, Some("nope"), 10).unwrap();
        assert!(missing_tag.is_empty());

        store.memory_set_status("mem1", MemoryStatus::Promoted).unwrap();
        assert_eq!(
            store.memory_get("mem1").unwrap().unwrap().status,
            MemoryStatus::Promoted
        );

        let all = store.memory_all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].1, unit(4, 0));

        assert!(store.memory_delete("mem1").unwrap());
        assert!(!store.memory_delete("mem1").unwrap());
    }

    #[test]
    fn test_retrieval_log_and_prune() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let now = chrono::Utc::now().timestamp();

        let entries = vec![
            RetrievalLogEntry {
                memory_id: "m1".into(),
                query: "old query".into(),
                score: 0.8,
                ts: now - 10 * 86_400,
            },
            RetrievalLogEntry {
                memory_id: "m1".into(),
                query: "new query".into(),
                score: 0.9,
                ts: now,
            },
        ];
        store.track_retrievals(&entries).unwrap();
        assert_eq!(store.retrieval_count().unwrap(), 2);

        let history = store.retrieval_history(Some("m1"), 10).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].query, "new query"); // newest first

        // Prune at 5 days removes exactly the 10-day-old row
        let removed = store.prune_retrievals(5).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.retrieval_count().unwrap(), 1);
        let remaining = store.retrieval_history(None, 10).unwrap();
        assert_eq!(remaining[0].query, "new query");
    }

    #[test]
    fn test_vector_count_mismatch_rejected() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let chunk = make_chunk("a.rs", 1, "fn x() {}", Domain::Code);
        let err = store
            .upsert_file(&make_record("a.rs", Domain::Code, "h"), &[chunk], &[])
            .unwrap_err();
        assert!(matches!(err, StorageError::Runtime(_)));
    }
}
