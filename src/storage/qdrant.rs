//! Remote Qdrant backend (plain REST, no SDK)
//!
//! One collection per profile holds chunk points (vector + full payload).
//! Two sibling collections carry the rest of the state: `{base}__memory`
//! for memory rows (real vectors) and `{base}__meta` for payload-only
//! bookkeeping points (file records, calibration, retrieval log, the
//! dimension stamp) over a 1-dim dummy vector.
//!
//! Qdrant point ids must be integers or UUIDs, so string keys are mapped to
//! deterministic UUIDs derived from their blake3 hash; the real key lives in
//! the payload.
//!
//! Lexical search is emulated by scrolling payloads and substring-matching;
//! hybrid-search users are pointed at the SQLite backend.

use std::collections::HashMap;
use std::sync::OnceLock;

use serde_json::{json, Value};
use tokio::runtime::Runtime;

use super::{
    chunk_from_parts, normalize_for_fts, normalize_path, FileRecord, MemoryEntry, MemoryStatus,
    RetrievalLogEntry, ScoredChunk, SearchScope, Storage, StorageError, StorageStats,
};
use crate::calibration::CalibrationMetadata;
use crate::chunker::{Chunk, Domain};

/// Page size for scroll-based operations.
const SCROLL_PAGE: usize = 512;
/// Upper bound on points examined by the emulated lexical search.
const FTS_SCAN_CAP: usize = 10_000;

pub struct QdrantStore {
    rt: Runtime,
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    collections: HashMap<Domain, String>,
    meta_collection: String,
    memory_collection: String,
    dim: OnceLock<usize>,
}

/// Deterministic UUID for a string key (blake3-derived, RFC 4122 shaped).
fn uuid_for_key(key: &str) -> String {
    let hash = blake3::hash(key.as_bytes());
    let b = hash.as_bytes();
    format!(
        "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
        b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7], b[8], b[9], b[10], b[11], b[12], b[13], b[14], b[15]
    )
}

fn chunk_payload(chunk: &Chunk) -> Value {
    json!({
        "chunk_id": chunk.id,
        "path": normalize_path(&chunk.file_path),
        "domain": chunk.domain.to_string(),
        "chunk_type": chunk.chunk_type.to_string(),
        "name": chunk.name,
        "signature": chunk.signature,
        "start_line": chunk.start_line,
        "end_line": chunk.end_line,
        "content": chunk.content,
        "language": chunk.language,
        "content_hash": chunk.content_hash,
        "modified_at": chunk.modified_at,
    })
}

fn payload_str(payload: &Value, key: &str) -> String {
    payload
        .get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

fn payload_i64(payload: &Value, key: &str) -> i64 {
    payload.get(key).and_then(|v| v.as_i64()).unwrap_or(0)
}

fn payload_to_chunk(payload: &Value) -> Chunk {
    chunk_from_parts(
        payload_str(payload, "chunk_id"),
        payload_str(payload, "path"),
        &payload_str(payload, "domain"),
        &payload_str(payload, "chunk_type"),
        payload_str(payload, "name"),
        payload_str(payload, "signature"),
        payload_i64(payload, "start_line"),
        payload_i64(payload, "end_line"),
        payload_str(payload, "content"),
        payload_str(payload, "language"),
        payload_str(payload, "content_hash"),
        payload_i64(payload, "modified_at"),
    )
}

fn payload_to_memory(payload: &Value) -> MemoryEntry {
    let tags = payload
        .get("tags")
        .and_then(|v| v.as_array())
        .map(|a| {
            a.iter()
                .filter_map(|t| t.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    MemoryEntry {
        id: payload_str(payload, "memory_id"),
        question: payload_str(payload, "question"),
        answer: payload_str(payload, "answer"),
        tags,
        source: payload_str(payload, "source"),
        status: payload_str(payload, "status")
            .parse()
            .unwrap_or(MemoryStatus::Pending),
        occurrences: payload_i64(payload, "occurrences").clamp(0, u32::MAX as i64) as u32,
        created_at: payload_str(payload, "created_at"),
        updated_at: payload_str(payload, "updated_at"),
    }
}

impl QdrantStore {
    /// Connect to a Qdrant server.
    ///
    /// `collections` maps each profile to its collection name (resolved by
    /// the caller); `expected_dim` triggers the fail-closed dimension check
    /// against any collection that already exists server-side.
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        collection_base: &str,
        collections: HashMap<Domain, String>,
        expected_dim: Option<usize>,
    ) -> Result<Self, StorageError> {
        let rt = Runtime::new().map_err(|e| StorageError::Runtime(e.to_string()))?;
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let store = Self {
            rt,
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            collections,
            meta_collection: format!("{}__meta", collection_base),
            memory_collection: format!("{}__memory", collection_base),
            dim: OnceLock::new(),
        };

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

        Ok(store)
    }

    fn collection(&self, domain: Domain) -> &str {
        self.collections
            .get(&domain)
            .map(String::as_str)
            .unwrap_or("llm_semantic")
    }

    fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value, StorageError> {
        let url = format!("{}{}", self.base_url, path);
        self.rt.block_on(async {
            let mut req = self.client.request(method.clone(), &url);
            if let Some(ref key) = self.api_key {
                req = req.header("api-key", key);
            }
            if let Some(ref body) = body {
                req = req.json(body);
            }
            let resp = req
                .send()
                .await
                .map_err(|e| StorageError::Backend(format!("qdrant request failed: {}", e)))?;
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            if status == reqwest::StatusCode::NOT_FOUND {
                return Err(StorageError::NotFound(format!("{} {}", method, url)));
            }
            if !status.is_success() {
                return Err(StorageError::Backend(format!(
                    "qdrant {} {} returned {}: {}",
                    method, url, status, text
                )));
            }
            serde_json::from_str(&text)
                .map_err(|e| StorageError::Backend(format!("invalid qdrant response: {}", e)))
        })
    }

    /// Create the collection if missing; fail closed when it exists with a
    /// different vector size.
    fn ensure_collection(&self, name: &str, dim: usize) -> Result<(), StorageError> {
        match self.request(reqwest::Method::GET, &format!("/collections/{}", name), None) {
            Ok(info) => {
                let stored = info
                    .pointer("/result/config/params/vectors/size")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0) as usize;
                if stored != 0 && stored != dim {
                    return Err(StorageError::DimensionMismatch {
                        stored,
                        current: dim,
                    });
                }
                Ok(())
            }
            Err(StorageError::NotFound(_)) => {
                self.request(
                    reqwest::Method::PUT,
                    &format!("/collections/{}", name),
                    Some(json!({"vectors": {"size": dim, "distance": "Cosine"}})),
                )?;
                tracing::info!(collection = name, dim, "Created qdrant collection");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn upsert_points(&self, collection: &str, points: Vec<Value>) -> Result<(), StorageError> {
        if points.is_empty() {
            return Ok(());
        }
        self.request(
            reqwest::Method::PUT,
            &format!("/collections/{}/points?wait=true", collection),
            Some(json!({ "points": points })),
        )?;
        Ok(())
    }

    fn delete_by_filter(&self, collection: &str, filter: Value) -> Result<(), StorageError> {
        match self.request(
            reqwest::Method::POST,
            &format!("/collections/{}/points/delete?wait=true", collection),
            Some(json!({ "filter": filter })),
        ) {
            Ok(_) => Ok(()),
            // A collection that never got created has nothing to delete
            Err(StorageError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn count_by_filter(&self, collection: &str, filter: Value) -> Result<u64, StorageError> {
        match self.request(
            reqwest::Method::POST,
            &format!("/collections/{}/points/count", collection),
            Some(json!({ "filter": filter, "exact": true })),
        ) {
            Ok(v) => Ok(v.pointer("/result/count").and_then(|c| c.as_u64()).unwrap_or(0)),
            Err(StorageError::NotFound(_)) => Ok(0),
            Err(e) => Err(e),
        }
    }

    /// Scroll all points matching a filter (payloads, optionally vectors).
    fn scroll(
        &self,
        collection: &str,
        filter: Option<Value>,
        with_vector: bool,
        cap: usize,
    ) -> Result<Vec<Value>, StorageError> {
        let mut points = Vec::new();
        let mut offset: Option<Value> = None;
        loop {
            let mut body = json!({
                "limit": SCROLL_PAGE,
                "with_payload": true,
                "with_vector": with_vector,
            });
            if let Some(ref f) = filter {
                body["filter"] = f.clone();
            }
            if let Some(ref o) = offset {
                body["offset"] = o.clone();
            }
            let resp = match self.request(
                reqwest::Method::POST,
                &format!("/collections/{}/points/scroll", collection),
                Some(body),
            ) {
                Ok(v) => v,
                Err(StorageError::NotFound(_)) => return Ok(points),
                Err(e) => return Err(e),
            };
            let page = resp
                .pointer("/result/points")
                .and_then(|p| p.as_array())
                .cloned()
                .unwrap_or_default();
            let next = resp.pointer("/result/next_page_offset").cloned();
            points.extend(page);
            if points.len() >= cap {
                points.truncate(cap);
                return Ok(points);
            }
            match next {
                Some(Value::Null) | None => return Ok(points),
                Some(o) => offset = Some(o),
            }
        }
    }

    fn scope_filter(scope: &SearchScope) -> Option<Value> {
        let mut must = Vec::new();
        if let Some(ref types) = scope.chunk_types {
            let values: Vec<String> = types.iter().map(|t| t.to_string()).collect();
            must.push(json!({"key": "chunk_type", "match": {"any": values}}));
        }
        if must.is_empty() {
            None
        } else {
            Some(json!({ "must": must }))
        }
    }

    fn meta_point_filter(kind: &str) -> Value {
        json!({"must": [{"key": "type", "match": {"value": kind}}]})
    }

    fn put_meta_point(&self, key: &str, payload: Value) -> Result<(), StorageError> {
        self.ensure_collection(&self.meta_collection, 1)?;
        self.upsert_points(
            &self.meta_collection,
            vec![json!({
                "id": uuid_for_key(key),
                "vector": [0.0],
                "payload": payload,
            })],
        )
    }

    fn stored_dim(&self) -> Result<Option<usize>, StorageError> {
        let points = match self.scroll(
            &self.meta_collection,
            Some(Self::meta_point_filter("dim_stamp")),
            false,
            2,
        ) {
            Ok(p) => p,
            Err(StorageError::Backend(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        Ok(points
            .first()
            .and_then(|p| p.pointer("/payload/vector_dim"))
            .and_then(|v| v.as_u64())
            .map(|v| v as usize))
    }

    /// Search one domain collection, returning (payload, score) pairs.
    fn search_collection(
        &self,
        domain: Domain,
        query: &[f32],
        k: usize,
        scope: &SearchScope,
    ) -> Result<Vec<(Value, f32)>, StorageError> {
        let mut body = json!({
            "vector": query,
            "limit": k,
            "with_payload": true,
        });
        if let Some(filter) = Self::scope_filter(scope) {
            body["filter"] = filter;
        }
        let resp = match self.request(
            reqwest::Method::POST,
            &format!("/collections/{}/points/search", self.collection(domain)),
            Some(body),
        ) {
            Ok(v) => v,
            Err(StorageError::NotFound(_)) => return Ok(vec![]),
            Err(e) => return Err(e),
        };
        Ok(resp
            .pointer("/result")
            .and_then(|r| r.as_array())
            .map(|hits| {
                hits.iter()
                    .filter_map(|hit| {
                        let payload = hit.get("payload")?.clone();
                        let score = hit.get("score")?.as_f64()? as f32;
                        Some((payload, score))
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    fn scope_domains(&self, scope: &SearchScope) -> Vec<Domain> {
        match scope.domain {
            Some(d) => vec![d],
            None => Domain::ALL.to_vec(),
        }
    }
}

impl Storage for QdrantStore {
    fn backend_name(&self) -> &'static str {
        "qdrant"
    }

    fn vector_dim(&self) -> Result<Option<usize>, StorageError> {
        if let Some(&dim) = self.dim.get() {
            return Ok(Some(dim));
        }
        let stored = self.stored_dim()?;
        if let Some(dim) = stored {
            let _ = self.dim.set(dim);
        }
        Ok(stored)
    }

    fn ensure_dim(&self, dim: usize, model: &str) -> Result<(), StorageError> {
        match self.vector_dim()? {
            Some(stored) if stored != dim => Err(StorageError::DimensionMismatch {
                stored,
                current: dim,
            }),
            Some(_) => Ok(()),
            None => {
                self.put_meta_point(
                    "dim_stamp",
                    json!({
                        "type": "dim_stamp",
                        "vector_dim": dim,
                        "embedding_model": model,
                        "created_at": chrono::Utc::now().to_rfc3339(),
                    }),
                )?;
                let _ = self.dim.set(dim);
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
        let collection = self.collection(record.domain).to_string();
        if let Some(dim) = vectors.first().map(Vec::len) {
            self.ensure_collection(&collection, dim)?;
        }

        // Delete-then-insert for this path (no transactions over REST; the
        // window between the two calls is accepted for a remote backend)
        self.delete_by_filter(
            &collection,
            json!({"must": [{"key": "path", "match": {"value": record.path}}]}),
        )?;

        let points: Vec<Value> = chunks
            .iter()
            .zip(vectors)
            .map(|(chunk, vector)| {
                json!({
                    "id": uuid_for_key(&chunk.id),
                    "vector": vector,
                    "payload": chunk_payload(chunk),
                })
            })
            .collect();
        self.upsert_points(&collection, points)?;

        self.put_meta_point(
            &format!("file:{}:{}", record.domain, record.path),
            json!({
                "type": "file",
                "path": record.path,
                "domain": record.domain.to_string(),
                "content_hash": record.content_hash,
                "mtime": record.mtime,
                "chunk_count": chunks.len(),
                "indexed_at": record.indexed_at,
            }),
        )
    }

    fn delete_file(&self, path: &str, domain: Domain) -> Result<u32, StorageError> {
        let collection = self.collection(domain).to_string();
        let filter = json!({"must": [{"key": "path", "match": {"value": path}}]});
        let count = self.count_by_filter(&collection, filter.clone())?;
        self.delete_by_filter(&collection, filter)?;
        self.delete_by_filter(
            &self.meta_collection,
            json!({"must": [
                {"key": "type", "match": {"value": "file"}},
                {"key": "path", "match": {"value": path}},
                {"key": "domain", "match": {"value": domain.to_string()}},
            ]}),
        )?;
        Ok(count as u32)
    }

    fn delete_domain(&self, domain: Domain) -> Result<u64, StorageError> {
        let collection = self.collection(domain).to_string();
        let count = self.count_by_filter(&collection, json!({}))?;
        match self.request(
            reqwest::Method::DELETE,
            &format!("/collections/{}", collection),
            None,
        ) {
            Ok(_) | Err(StorageError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        self.delete_by_filter(
            &self.meta_collection,
            json!({"must": [
                {"key": "type", "match": {"value": "file"}},
                {"key": "domain", "match": {"value": domain.to_string()}},
            ]}),
        )?;
        self.delete_by_filter(
            &self.meta_collection,
            json!({"must": [
                {"key": "type", "match": {"value": "calibration"}},
                {"key": "domain", "match": {"value": domain.to_string()}},
            ]}),
        )?;
        Ok(count)
    }

    fn get_file_record(
        &self,
        path: &str,
        domain: Domain,
    ) -> Result<Option<FileRecord>, StorageError> {
        let points = self.scroll(
            &self.meta_collection,
            Some(json!({"must": [
                {"key": "type", "match": {"value": "file"}},
                {"key": "path", "match": {"value": path}},
                {"key": "domain", "match": {"value": domain.to_string()}},
            ]})),
            false,
            2,
        )?;
        Ok(points.first().map(|p| {
            let payload = p.get("payload").cloned().unwrap_or(Value::Null);
            FileRecord {
                path: payload_str(&payload, "path"),
                domain,
                content_hash: payload_str(&payload, "content_hash"),
                mtime: payload_i64(&payload, "mtime"),
                chunk_count: payload_i64(&payload, "chunk_count").clamp(0, u32::MAX as i64) as u32,
                indexed_at: payload_str(&payload, "indexed_at"),
            }
        }))
    }

    fn list_files(&self, domain: Domain) -> Result<Vec<FileRecord>, StorageError> {
        let points = self.scroll(
            &self.meta_collection,
            Some(json!({"must": [
                {"key": "type", "match": {"value": "file"}},
                {"key": "domain", "match": {"value": domain.to_string()}},
            ]})),
            false,
            FTS_SCAN_CAP,
        )?;
        let mut records: Vec<FileRecord> = points
            .iter()
            .map(|p| {
                let payload = p.get("payload").cloned().unwrap_or(Value::Null);
                FileRecord {
                    path: payload_str(&payload, "path"),
                    domain,
                    content_hash: payload_str(&payload, "content_hash"),
                    mtime: payload_i64(&payload, "mtime"),
                    chunk_count: payload_i64(&payload, "chunk_count").clamp(0, u32::MAX as i64)
                        as u32,
                    indexed_at: payload_str(&payload, "indexed_at"),
                }
            })
            .collect();
        records.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(records)
    }

    fn embeddings_by_hash(
        &self,
        hashes: &[&str],
    ) -> Result<HashMap<String, Vec<f32>>, StorageError> {
        if hashes.is_empty() {
            return Ok(HashMap::new());
        }
        let values: Vec<&str> = hashes.to_vec();
        let mut found = HashMap::new();
        for domain in Domain::ALL {
            let points = self.scroll(
                self.collection(domain),
                Some(json!({"must": [{"key": "content_hash", "match": {"any": values}}]})),
                true,
                FTS_SCAN_CAP,
            )?;
            for point in points {
                let hash = point
                    .pointer("/payload/content_hash")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                let vector: Option<Vec<f32>> = point.get("vector").and_then(|v| {
                    v.as_array().map(|a| {
                        a.iter()
                            .filter_map(|x| x.as_f64().map(|f| f as f32))
                            .collect()
                    })
                });
                if let (false, Some(vector)) = (hash.is_empty(), vector) {
                    found.insert(hash, vector);
                }
            }
        }
        Ok(found)
    }

    fn dense_top_k(
        &self,
        query: &[f32],
        k: usize,
        scope: &SearchScope,
    ) -> Result<Vec<ScoredChunk>, StorageError> {
        let mut hits: Vec<(Value, f32)> = Vec::new();
        for domain in self.scope_domains(scope) {
            // Over-fetch so a client-side path filter can't starve results
            let fetch = if scope.path_prefix.is_some() { k * 4 } else { k };
            hits.extend(self.search_collection(domain, query, fetch.max(k), scope)?);
        }

        let mut scored: Vec<ScoredChunk> = hits
            .into_iter()
            .filter_map(|(payload, score)| {
                let chunk = payload_to_chunk(&payload);
                if !scope.matches(&chunk) {
                    return None;
                }
                Some(ScoredChunk { chunk, score })
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.chunk.id.cmp(&b.chunk.id))
        });
        scored.truncate(k);
        Ok(scored)
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
        let tokens: Vec<&str> = normalized.split(' ').collect();

        let mut scored: Vec<ScoredChunk> = Vec::new();
        for domain in self.scope_domains(scope) {
            let points = self.scroll(
                self.collection(domain),
                Self::scope_filter(scope),
                false,
                FTS_SCAN_CAP,
            )?;
            for point in points {
                let payload = match point.get("payload") {
                    Some(p) => p.clone(),
                    None => continue,
                };
                let chunk = payload_to_chunk(&payload);
                if !scope.matches(&chunk) {
                    continue;
                }
                let haystack = normalize_for_fts(&format!(
                    "{} {} {}",
                    chunk.name, chunk.signature, chunk.content
                ));
                let matches = tokens
                    .iter()
                    .filter(|t| haystack.contains(*t as &str))
                    .count();
                if matches > 0 {
                    scored.push(ScoredChunk {
                        chunk,
                        score: matches as f32 / tokens.len() as f32,
                    });
                }
            }
        }

        scored.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.chunk.id.cmp(&b.chunk.id))
        });
        scored.truncate(k);
        Ok(scored)
    }

    fn stats(&self) -> Result<StorageStats, StorageError> {
        let mut by_domain = HashMap::new();
        let mut chunks_total = 0u64;
        for domain in Domain::ALL {
            let chunks = self.count_by_filter(self.collection(domain), json!({}))?;
            let files = self.count_by_filter(
                &self.meta_collection,
                json!({"must": [
                    {"key": "type", "match": {"value": "file"}},
                    {"key": "domain", "match": {"value": domain.to_string()}},
                ]}),
            )?;
            if chunks > 0 || files > 0 {
                by_domain.insert(domain, (files, chunks));
            }
            chunks_total += chunks;
        }
        let files_indexed = by_domain.values().map(|(f, _)| f).sum();

        let stamp = self
            .scroll(
                &self.meta_collection,
                Some(Self::meta_point_filter("dim_stamp")),
                false,
                2,
            )?
            .into_iter()
            .next()
            .and_then(|p| p.get("payload").cloned());

        Ok(StorageStats {
            files_indexed,
            chunks_total,
            last_updated: stamp
                .as_ref()
                .map(|p| payload_str(p, "created_at"))
                .unwrap_or_default(),
            by_domain,
            vector_dim: self.vector_dim()?,
            embedding_model: stamp.as_ref().map(|p| payload_str(p, "embedding_model")),
            size_bytes: 0,
        })
    }

    fn get_calibration(
        &self,
        domain: Domain,
    ) -> Result<Option<CalibrationMetadata>, StorageError> {
        let points = self.scroll(
            &self.meta_collection,
            Some(json!({"must": [
                {"key": "type", "match": {"value": "calibration"}},
                {"key": "domain", "match": {"value": domain.to_string()}},
            ]})),
            false,
            2,
        )?;
        Ok(points.first().and_then(|p| {
            let payload = p.get("payload")?;
            serde_json::from_value(payload.get("record")?.clone()).ok()
        }))
    }

    fn put_calibration(&self, meta: &CalibrationMetadata) -> Result<(), StorageError> {
        let record =
            serde_json::to_value(meta).map_err(|e| StorageError::Runtime(e.to_string()))?;
        self.put_meta_point(
            &format!("calibration:{}", meta.domain),
            json!({
                "type": "calibration",
                "domain": meta.domain.to_string(),
                "record": record,
            }),
        )
    }

    // ===== memory =====

    fn memory_upsert(&self, entry: &MemoryEntry, vector: &[f32]) -> Result<bool, StorageError> {
        self.ensure_collection(&self.memory_collection, vector.len())?;
        let existing = self.memory_get(&entry.id)?;
        let occurrences = existing.as_ref().map(|e| e.occurrences + 1).unwrap_or(1);
        let created_at = existing
            .as_ref()
            .map(|e| e.created_at.clone())
            .unwrap_or_else(|| entry.created_at.clone());
        let status = existing.as_ref().map(|e| e.status).unwrap_or(entry.status);

        self.upsert_points(
            &self.memory_collection,
            vec![json!({
                "id": uuid_for_key(&format!("memory:{}", entry.id)),
                "vector": vector,
                "payload": {
                    "memory_id": entry.id,
                    "question": entry.question,
                    "answer": entry.answer,
                    "tags": entry.tags,
                    "source": entry.source,
                    "status": status.to_string(),
                    "occurrences": occurrences,
                    "created_at": created_at,
                    "updated_at": entry.updated_at,
                },
            })],
        )?;
        Ok(existing.is_none())
    }

    fn memory_get(&self, id: &str) -> Result<Option<MemoryEntry>, StorageError> {
        let points = self.scroll(
            &self.memory_collection,
            Some(json!({"must": [{"key": "memory_id", "match": {"value": id}}]})),
            false,
            2,
        )?;
        Ok(points
            .first()
            .and_then(|p| p.get("payload"))
            .map(payload_to_memory))
    }

    fn memory_list(
        &self,
        status: Option<MemoryStatus>,
        tag: Option<&str>,
        limit: usize,
    ) -> Result<Vec<MemoryEntry>, StorageError> {
        let filter = status.map(|s| {
            json!({"must": [{"key": "status", "match": {"value": s.to_string()}}]})
        });
        let points = self.scroll(&self.memory_collection, filter, false, FTS_SCAN_CAP)?;
        let mut entries: Vec<MemoryEntry> = points
            .iter()
            .filter_map(|p| p.get("payload"))
            .map(payload_to_memory)
            .filter(|m| match tag {
                Some(t) => m.tags.iter().any(|mt| mt == t),
                None => true,
            })
            .collect();
        entries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        entries.truncate(limit);
        Ok(entries)
    }

    fn memory_delete(&self, id: &str) -> Result<bool, StorageError> {
        let existed = self.memory_get(id)?.is_some();
        self.delete_by_filter(
            &self.memory_collection,
            json!({"must": [{"key": "memory_id", "match": {"value": id}}]}),
        )?;
        self.delete_by_filter(
            &self.meta_collection,
            json!({"must": [
                {"key": "type", "match": {"value": "retrieval"}},
                {"key": "memory_id", "match": {"value": id}},
            ]}),
        )?;
        Ok(existed)
    }

    fn memory_set_status(&self, id: &str, status: MemoryStatus) -> Result<(), StorageError> {
        let mut entry = self
            .memory_get(id)?
            .ok_or_else(|| StorageError::NotFound(format!("memory {}", id)))?;
        entry.status = status;
        entry.updated_at = chrono::Utc::now().to_rfc3339();
        // Re-read the vector via scroll (set_payload would also work; one
        // upsert keeps the write path uniform)
        let points = self.scroll(
            &self.memory_collection,
            Some(json!({"must": [{"key": "memory_id", "match": {"value": id}}]})),
            true,
            2,
        )?;
        let vector: Vec<f32> = points
            .first()
            .and_then(|p| p.get("vector"))
            .and_then(|v| v.as_array())
            .map(|a| a.iter().filter_map(|x| x.as_f64().map(|f| f as f32)).collect())
            .unwrap_or_default();

        self.upsert_points(
            &self.memory_collection,
            vec![json!({
                "id": uuid_for_key(&format!("memory:{}", id)),
                "vector": vector,
                "payload": {
                    "memory_id": entry.id,
                    "question": entry.question,
                    "answer": entry.answer,
                    "tags": entry.tags,
                    "source": entry.source,
                    "status": entry.status.to_string(),
                    "occurrences": entry.occurrences,
                    "created_at": entry.created_at,
                    "updated_at": entry.updated_at,
                },
            })],
        )
    }

    fn memory_all(&self) -> Result<Vec<(MemoryEntry, Vec<f32>)>, StorageError> {
        let points = self.scroll(&self.memory_collection, None, true, FTS_SCAN_CAP)?;
        Ok(points
            .into_iter()
            .filter_map(|p| {
                let entry = payload_to_memory(p.get("payload")?);
                let vector: Vec<f32> = p
                    .get("vector")?
                    .as_array()?
                    .iter()
                    .filter_map(|x| x.as_f64().map(|f| f as f32))
                    .collect();
                Some((entry, vector))
            })
            .collect())
    }

    // ===== retrieval log =====

    fn track_retrievals(&self, entries: &[RetrievalLogEntry]) -> Result<(), StorageError> {
        if entries.is_empty() {
            return Ok(());
        }
        self.ensure_collection(&self.meta_collection, 1)?;
        let points: Vec<Value> = entries
            .iter()
            .map(|entry| {
                json!({
                    "id": uuid_for_key(&format!(
                        "retrieval:{}:{}:{}",
                        entry.memory_id, entry.ts, entry.query
                    )),
                    "vector": [0.0],
                    "payload": {
                        "type": "retrieval",
                        "memory_id": entry.memory_id,
                        "query": entry.query,
                        "score": entry.score,
                        "ts": entry.ts,
                    },
                })
            })
            .collect();
        self.upsert_points(&self.meta_collection, points)
    }

    fn retrieval_history(
        &self,
        memory_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<RetrievalLogEntry>, StorageError> {
        let mut must = vec![json!({"key": "type", "match": {"value": "retrieval"}})];
        if let Some(id) = memory_id {
            must.push(json!({"key": "memory_id", "match": {"value": id}}));
        }
        let points = self.scroll(
            &self.meta_collection,
            Some(json!({ "must": must })),
            false,
            FTS_SCAN_CAP,
        )?;
        let mut entries: Vec<RetrievalLogEntry> = points
            .iter()
            .filter_map(|p| {
                let payload = p.get("payload")?;
                Some(RetrievalLogEntry {
                    memory_id: payload_str(payload, "memory_id"),
                    query: payload_str(payload, "query"),
                    score: payload.get("score")?.as_f64()? as f32,
                    ts: payload_i64(payload, "ts"),
                })
            })
            .collect();
        entries.sort_by(|a, b| b.ts.cmp(&a.ts));
        entries.truncate(limit);
        Ok(entries)
    }

    fn retrieval_count(&self) -> Result<u64, StorageError> {
        self.count_by_filter(&self.meta_collection, Self::meta_point_filter("retrieval"))
    }

    fn prune_retrievals(&self, older_than_days: u32) -> Result<u64, StorageError> {
        let cutoff = chrono::Utc::now().timestamp() - (older_than_days as i64) * 86_400;
        let filter = json!({"must": [
            {"key": "type", "match": {"value": "retrieval"}},
            {"key": "ts", "range": {"lt": cutoff}},
        ]});
        let count = self.count_by_filter(&self.meta_collection, filter.clone())?;
        self.delete_by_filter(&self.meta_collection, filter)?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    fn test_store(server: &MockServer) -> QdrantStore {
        let collections = Domain::ALL
            .iter()
            .map(|&d| (d, format!("proj_{}", d)))
            .collect();
        QdrantStore::new(&server.base_url(), None, "proj", collections, None).unwrap()
    }

    #[test]
    fn test_uuid_for_key_is_stable_and_shaped() {
        let a = uuid_for_key("src/a.rs:1:abcd1234");
        let b = uuid_for_key("src/a.rs:1:abcd1234");
        assert_eq!(a, b);
        assert_eq!(a.len(), 36);
        assert_eq!(a.matches('-').count(), 4);
        assert_ne!(a, uuid_for_key("other"));
    }

    #[test]
    fn test_ensure_collection_dimension_fail_closed() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/collections/proj_code");
            then.status(200).json_body(serde_json::json!({
                "result": {"config": {"params": {"vectors": {"size": 768}}}}
            }));
        });
        let store = test_store(&server);
        let err = store.ensure_collection("proj_code", 384).unwrap_err();
        assert!(matches!(
            err,
            StorageError::DimensionMismatch { stored: 768, current: 384 }
        ));
        assert!(store.ensure_collection("proj_code", 768).is_ok());
    }

    #[test]
    fn test_ensure_collection_creates_when_missing() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/collections/proj_code");
            then.status(404).body("{\"status\":\"not found\"}");
        });
        let create = server.mock(|when, then| {
            when.method(PUT)
                .path("/collections/proj_code")
                .json_body_partial("{\"vectors\": {\"size\": 4, \"distance\": \"Cosine\"}}");
            then.status(200).json_body(serde_json::json!({"result": true}));
        });
        let store = test_store(&server);
        store.ensure_collection("proj_code", 4).unwrap();
        create.assert();
    }

    #[test]
    fn test_dense_top_k_parses_hits() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/collections/proj_code/points/search");
            then.status(200).json_body(serde_json::json!({
                "result": [
                    {"id": "x", "score": 0.91, "payload": {
                        "chunk_id": "src/a.rs:1:aaaa", "path": "src/a.rs",
                        "domain": "code", "chunk_type": "function",
                        "name": "alpha", "signature": "fn alpha()",
                        "start_line": 1, "end_line": 3,
                        "content": "fn alpha() {}", "language": "rust",
                        "content_hash": "aaaa", "modified_at": 100
                    }},
                    {"id": "y", "score": 0.40, "payload": {
                        "chunk_id": "src/b.rs:1:bbbb", "path": "src/b.rs",
                        "domain": "code", "chunk_type": "function",
                        "name": "beta", "signature": "fn beta()",
                        "start_line": 1, "end_line": 3,
                        "content": "fn beta() {}", "language": "rust",
                        "content_hash": "bbbb", "modified_at": 100
                    }}
                ]
            }));
        });
        let store = test_store(&server);
        let hits = store
            .dense_top_k(&[1.0, 0.0], 5, &SearchScope::for_domain(Domain::Code))
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].chunk.name, "alpha");
        assert!((hits[0].score - 0.91).abs() < 1e-6);
        assert_eq!(hits[0].chunk.start_line, 1);
    }

    #[test]
    fn test_dense_top_k_missing_collection_is_empty() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/collections/proj_code/points/search");
            then.status(404).body("{}");
        });
        let store = test_store(&server);
        let hits = store
            .dense_top_k(&[1.0], 5, &SearchScope::for_domain(Domain::Code))
            .unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn test_auth_header_sent() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET)
                .path("/collections/secure")
                .header("api-key", "sekrit");
            then.status(200).json_body(serde_json::json!({
                "result": {"config": {"params": {"vectors": {"size": 4}}}}
            }));
        });
        let collections = Domain::ALL
            .iter()
            .map(|&d| (d, format!("proj_{}", d)))
            .collect();
        let store = QdrantStore::new(
            &server.base_url(),
            Some("sekrit".into()),
            "proj",
            collections,
            None,
        )
        .unwrap();
        store.ensure_collection("secure", 4).unwrap();
        mock.assert();
    }
}
