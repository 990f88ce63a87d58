//! Search pipelines
//!
//! Dense search embeds the query and ranks by cosine; hybrid search fuses
//! the dense and lexical rankings with weighted Reciprocal Rank Fusion.
//! Recency boosting, calibration labelling, multi-profile merging, and
//! multi-query search with match boosting all compose on top.
//!
//! Results are deterministic for a given index state and query: every sort
//! breaks ties by chunk id ascending.

use std::collections::HashMap;

use crate::calibration::{default_calibration, CalibrationMetadata, Relevance};
use crate::chunker::{Chunk, ChunkType, Domain};
use crate::embedder::TextEmbedder;
use crate::error::SemanticError;
use crate::storage::{ScoredChunk, SearchScope, Storage};

/// Oversampling multiplier before threshold/truncation.
const OVERSAMPLE: usize = 4;
/// Floor for hybrid candidate list sizes.
const HYBRID_MIN_CANDIDATES: usize = 50;
/// Preview length in characters.
const PREVIEW_CHARS: usize = 200;
/// Maximum queries accepted by multisearch.
pub const MAX_QUERIES: usize = 8;

/// Options shared by `search` and each multisearch sub-query.
#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub top: usize,
    pub threshold: f32,
    pub chunk_types: Option<Vec<ChunkType>>,
    pub path_prefix: Option<String>,
    pub hybrid: bool,
    pub fusion_k: f32,
    pub fusion_alpha: f32,
    pub recency_boost: bool,
    pub recency_factor: f32,
    pub recency_decay_days: f32,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            top: 10,
            threshold: 0.25,
            chunk_types: None,
            path_prefix: None,
            hybrid: false,
            fusion_k: 60.0,
            fusion_alpha: 0.7,
            recency_boost: false,
            recency_factor: 0.25,
            recency_decay_days: 30.0,
        }
    }
}

impl SearchOptions {
    /// Reject out-of-range fusion parameters.
    pub fn validate(&self) -> Result<(), SemanticError> {
        if !(0.0..=1.0).contains(&self.fusion_alpha) {
            return Err(SemanticError::invalid_input(format!(
                "fusion alpha {} out of range",
                self.fusion_alpha
            ))
            .with_hint("--fusion-alpha must be between 0.0 and 1.0"));
        }
        if self.fusion_k <= 0.0 {
            return Err(SemanticError::invalid_input(format!(
                "fusion k {} out of range",
                self.fusion_k
            ))
            .with_hint("--fusion-k must be positive"));
        }
        if self.recency_factor < 0.0 {
            return Err(
                SemanticError::invalid_input("recency factor must be >= 0".to_string())
                    .with_hint("--recency-factor takes a non-negative number"),
            );
        }
        if self.recency_decay_days <= 0.0 {
            return Err(
                SemanticError::invalid_input("recency decay must be positive".to_string())
                    .with_hint("--recency-decay takes a number of days > 0"),
            );
        }
        Ok(())
    }

    fn scope(&self, domain: Domain) -> SearchScope {
        SearchScope {
            domain: Some(domain),
            chunk_types: self.chunk_types.clone(),
            path_prefix: self.path_prefix.clone(),
        }
    }
}

/// A ranked, labelled search result.
#[derive(Debug, Clone)]
pub struct RankedResult {
    pub chunk: Chunk,
    pub profile: Domain,
    /// Dense cosine when the chunk was in the dense list, else 0
    pub score: f32,
    /// Present when multisearch boosting applied
    pub boosted_score: Option<f32>,
    /// Queries that returned this chunk (multisearch)
    pub matched_queries: Vec<String>,
    pub relevance: Relevance,
    pub preview: String,
    /// Ordering key: fusion/boosted/recency-adjusted score
    rank_score: f32,
}

impl RankedResult {
    /// The score the result is ordered by.
    pub fn effective_score(&self) -> f32 {
        self.boosted_score.unwrap_or(self.rank_score)
    }
}

/// Multisearch output shape.
#[derive(Debug)]
pub enum MultisearchOutput {
    Blended(Vec<RankedResult>),
    ByQuery(Vec<(String, Vec<RankedResult>)>),
    ByProfile(Vec<(Domain, Vec<RankedResult>)>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Blended,
    ByQuery,
    ByProfile,
}

impl std::str::FromStr for OutputMode {
    type Err = SemanticError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "blended" => Ok(OutputMode::Blended),
            "by_query" => Ok(OutputMode::ByQuery),
            "by_collection" | "by_profile" => Ok(OutputMode::ByProfile),
            other => Err(SemanticError::invalid_input(format!(
                "unknown output mode '{}'",
                other
            ))
            .with_hint("Available modes: blended, by_query, by_collection")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MultisearchOptions {
    pub base: SearchOptions,
    pub boost: bool,
    pub boost_factor: f32,
    pub dedupe: bool,
    pub output: OutputMode,
}

impl Default for MultisearchOptions {
    fn default() -> Self {
        Self {
            base: SearchOptions::default(),
            boost: true,
            boost_factor: 0.05,
            dedupe: true,
            output: OutputMode::Blended,
        }
    }
}

/// Search entry point over one or more profile stores.
pub struct Searcher<'a> {
    embedder: &'a dyn TextEmbedder,
}

impl<'a> Searcher<'a> {
    pub fn new(embedder: &'a dyn TextEmbedder) -> Self {
        Self { embedder }
    }

    /// Dense or hybrid search against a single profile.
    pub fn search(
        &self,
        store: &dyn Storage,
        domain: Domain,
        query: &str,
        opts: &SearchOptions,
    ) -> Result<Vec<RankedResult>, SemanticError> {
        opts.validate()?;
        let _span = tracing::info_span!("search", domain = %domain, hybrid = opts.hybrid).entered();

        let query_vec = self.embedder.embed_query(query).map_err(SemanticError::from)?;
        let calibration = self.calibration_for(store, domain);
        let scope = opts.scope(domain);

        let candidates = if opts.hybrid {
            let n = (opts.top * OVERSAMPLE).max(HYBRID_MIN_CANDIDATES);
            let dense = store
                .dense_top_k(&query_vec, n, &scope)
                .map_err(|e| SemanticError::new(crate::error::ErrorKind::StorageOpen, e.to_string()))?;
            let lexical = store
                .fts_top_k(query, n, &scope)
                .map_err(|e| SemanticError::new(crate::error::ErrorKind::StorageOpen, e.to_string()))?;
            rrf_fuse(dense, lexical, opts.fusion_alpha, opts.fusion_k)
        } else {
            let n = (opts.top * OVERSAMPLE).max(opts.top);
            store
                .dense_top_k(&query_vec, n, &scope)
                .map_err(|e| SemanticError::new(crate::error::ErrorKind::StorageOpen, e.to_string()))?
                .into_iter()
                .map(|hit| Candidate {
                    dense_score: Some(hit.score),
                    rank_score: hit.score,
                    chunk: hit.chunk,
                })
                .collect()
        };

        let now = chrono::Utc::now().timestamp();
        let mut results: Vec<RankedResult> = candidates
            .into_iter()
            .map(|mut candidate| {
                if opts.recency_boost {
                    candidate.rank_score *= recency_multiplier(
                        candidate.chunk.modified_at,
                        now,
                        opts.recency_factor,
                        opts.recency_decay_days,
                    );
                }
                candidate
            })
            .filter(|candidate| match candidate.dense_score {
                // Threshold reads against the dense cosine; lexical-only
                // results have no cosine to fail against
                Some(score) => score >= opts.threshold,
                None => true,
            })
            .map(|candidate| {
                let score = candidate.dense_score.unwrap_or(0.0);
                RankedResult {
                    relevance: calibration.tier(score),
                    preview: make_preview(&candidate.chunk.content),
                    profile: domain,
                    score,
                    boosted_score: None,
                    matched_queries: Vec::new(),
                    rank_score: candidate.rank_score,
                    chunk: candidate.chunk,
                }
            })
            .collect();

        sort_ranked(&mut results);
        results.truncate(opts.top);
        Ok(results)
    }

    /// Search several profiles and merge: tag by profile, concatenate,
    /// re-sort, de-duplicate by chunk id keeping the higher-ranked one.
    pub fn search_profiles(
        &self,
        stores: &[(Domain, &dyn Storage)],
        query: &str,
        opts: &SearchOptions,
    ) -> Result<Vec<RankedResult>, SemanticError> {
        let mut merged: Vec<RankedResult> = Vec::new();
        for &(domain, store) in stores {
            merged.extend(self.search(store, domain, query, opts)?);
        }
        sort_ranked(&mut merged);
        dedupe_by_id(&mut merged);
        merged.truncate(opts.top);
        Ok(merged)
    }

    /// Run up to [`MAX_QUERIES`] queries and merge their results.
    pub fn multisearch(
        &self,
        stores: &[(Domain, &dyn Storage)],
        queries: &[String],
        opts: &MultisearchOptions,
    ) -> Result<MultisearchOutput, SemanticError> {
        if queries.is_empty() {
            return Err(SemanticError::invalid_input("multisearch needs at least one query"));
        }
        if queries.len() > MAX_QUERIES {
            return Err(SemanticError::invalid_input(format!(
                "multisearch accepts at most {} queries, got {}",
                MAX_QUERIES,
                queries.len()
            ))
            .with_hint("Split the call into several multisearch invocations"));
        }
        opts.base.validate()?;

        // Each query's pipeline runs independently
        let mut per_query: Vec<(String, Vec<RankedResult>)> = Vec::with_capacity(queries.len());
        for query in queries {
            let results = self.search_profiles(stores, query, &opts.base)?;
            per_query.push((query.clone(), results));
        }

        if opts.output == OutputMode::ByQuery {
            return Ok(MultisearchOutput::ByQuery(per_query));
        }

        // Merge by chunk id, collecting which queries matched each chunk
        let mut merged: Vec<RankedResult> = Vec::new();
        let mut by_id: HashMap<String, usize> = HashMap::new();
        for (query, results) in &per_query {
            for result in results {
                match by_id.get(result.chunk.id.as_str()) {
                    Some(&idx) if opts.dedupe => {
                        let existing = &mut merged[idx];
                        if !existing.matched_queries.contains(query) {
                            existing.matched_queries.push(query.clone());
                        }
                        // Keep the higher-ranked occurrence's scores
                        if result.rank_score > existing.rank_score {
                            existing.rank_score = result.rank_score;
                            existing.score = result.score;
                            existing.relevance = result.relevance;
                        }
                    }
                    _ => {
                        let mut tagged = result.clone();
                        tagged.matched_queries = vec![query.clone()];
                        by_id.insert(tagged.chunk.id.clone(), merged.len());
                        merged.push(tagged);
                    }
                }
            }
        }

        // Multi-match boost: chunks that answer several queries move up
        if opts.boost {
            for result in &mut merged {
                let extra = result.matched_queries.len().saturating_sub(1);
                result.boosted_score =
                    Some(result.rank_score + opts.boost_factor * extra as f32);
            }
        }

        merged.sort_by(|a, b| {
            b.effective_score()
                .total_cmp(&a.effective_score())
                .then_with(|| a.chunk.id.cmp(&b.chunk.id))
        });

        match opts.output {
            OutputMode::Blended => {
                merged.truncate(opts.base.top);
                Ok(MultisearchOutput::Blended(merged))
            }
            OutputMode::ByProfile => {
                let mut by_profile: Vec<(Domain, Vec<RankedResult>)> = Vec::new();
                for result in merged {
                    match by_profile.iter_mut().find(|(d, _)| *d == result.profile) {
                        Some((_, list)) => list.push(result),
                        None => by_profile.push((result.profile, vec![result])),
                    }
                }
                for (_, list) in &mut by_profile {
                    list.truncate(opts.base.top);
                }
                Ok(MultisearchOutput::ByProfile(by_profile))
            }
            OutputMode::ByQuery => unreachable!("handled above"),
        }
    }

    fn calibration_for(&self, store: &dyn Storage, domain: Domain) -> CalibrationMetadata {
        match store.get_calibration(domain) {
            Ok(Some(meta)) => meta,
            Ok(None) => default_calibration(
                domain,
                &self.embedder.model(),
                self.embedder.probe().unwrap_or(0),
            ),
            Err(e) => {
                tracing::warn!(error = %e, domain = %domain, "Calibration lookup failed, using defaults");
                default_calibration(domain, &self.embedder.model(), 0)
            }
        }
    }
}

/// Intermediate candidate before labelling.
struct Candidate {
    chunk: Chunk,
    /// Dense cosine, when the chunk appeared in the dense list
    dense_score: Option<f32>,
    /// Ordering score (cosine, or RRF for hybrid)
    rank_score: f32,
}

/// Weighted Reciprocal Rank Fusion over the dense and lexical rankings.
///
/// `rrf(d) = alpha / (k + rank_dense) + (1 - alpha) / (k + rank_lexical)`,
/// with a missing rank contributing zero. Ranks are 1-based.
fn rrf_fuse(
    dense: Vec<ScoredChunk>,
    lexical: Vec<ScoredChunk>,
    alpha: f32,
    fusion_k: f32,
) -> Vec<Candidate> {
    let mut candidates: HashMap<String, Candidate> = HashMap::new();

    for (rank, hit) in dense.into_iter().enumerate() {
        let contribution = alpha / (fusion_k + (rank + 1) as f32);
        candidates.insert(
            hit.chunk.id.clone(),
            Candidate {
                dense_score: Some(hit.score),
                rank_score: contribution,
                chunk: hit.chunk,
            },
        );
    }

    for (rank, hit) in lexical.into_iter().enumerate() {
        let contribution = (1.0 - alpha) / (fusion_k + (rank + 1) as f32);
        candidates
            .entry(hit.chunk.id.clone())
            .and_modify(|c| c.rank_score += contribution)
            .or_insert(Candidate {
                dense_score: None,
                rank_score: contribution,
                chunk: hit.chunk,
            });
    }

    candidates.into_values().collect()
}

/// Multiplicative recency factor: `1 + factor * 2^(-age_days / decay_days)`.
fn recency_multiplier(modified_at: i64, now: i64, factor: f32, decay_days: f32) -> f32 {
    if modified_at <= 0 {
        return 1.0;
    }
    let age_days = ((now - modified_at).max(0) as f32) / 86_400.0;
    1.0 + factor * (-age_days / decay_days).exp2()
}

/// First ~200 chars of content with whitespace runs collapsed.
fn make_preview(content: &str) -> String {
    let collapsed: String = content.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.len() <= PREVIEW_CHARS {
        return collapsed;
    }
    let mut end = PREVIEW_CHARS;
    while !collapsed.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &collapsed[..end])
}

fn sort_ranked(results: &mut [RankedResult]) {
    results.sort_by(|a, b| {
        b.rank_score
            .total_cmp(&a.rank_score)
            .then_with(|| a.chunk.id.cmp(&b.chunk.id))
    });
}

/// Drop lower-ranked duplicate chunk ids (input must be sorted).
fn dedupe_by_id(results: &mut Vec<RankedResult>) {
    let mut seen = std::collections::HashSet::new();
    results.retain(|r| seen.insert(r.chunk.id.clone()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn chunk(id_line: u32, content: &str) -> Chunk {
        Chunk::build(
            Path::new("src/a.rs"),
            ChunkType::Function,
            format!("f{}", id_line),
            "",
            id_line,
            id_line + 1,
            content.to_string(),
            "rust",
        )
    }

    fn scored(id_line: u32, content: &str, score: f32) -> ScoredChunk {
        ScoredChunk {
            chunk: chunk(id_line, content),
            score,
        }
    }

    #[test]
    fn test_validate_fusion_params() {
        let mut opts = SearchOptions::default();
        assert!(opts.validate().is_ok());
        opts.fusion_alpha = 1.5;
        assert!(opts.validate().is_err());
        opts.fusion_alpha = -0.1;
        assert!(opts.validate().is_err());
        opts.fusion_alpha = 0.0;
        assert!(opts.validate().is_ok());
        opts.fusion_k = 0.0;
        assert!(opts.validate().is_err());
    }

    #[test]
    fn test_rrf_alpha_one_is_pure_dense() {
        let dense = vec![scored(1, "a", 0.9), scored(2, "b", 0.5)];
        let lexical = vec![scored(2, "b", 1.0), scored(3, "c", 0.8)];
        let mut fused = rrf_fuse(dense, lexical, 1.0, 60.0);
        fused.sort_by(|a, b| b.rank_score.total_cmp(&a.rank_score));
        // With alpha=1 lexical contributes nothing: order is dense order,
        // and lexical-only docs score zero
        assert_eq!(fused[0].chunk.start_line, 1);
        assert_eq!(fused[1].chunk.start_line, 2);
        assert_eq!(fused[2].rank_score, 0.0);
    }

    #[test]
    fn test_rrf_alpha_zero_is_pure_lexical() {
        let dense = vec![scored(1, "a", 0.9), scored(2, "b", 0.5)];
        let lexical = vec![scored(2, "b", 1.0), scored(3, "c", 0.8)];
        let mut fused = rrf_fuse(dense, lexical, 0.0, 60.0);
        fused.sort_by(|a, b| b.rank_score.total_cmp(&a.rank_score));
        assert_eq!(fused[0].chunk.start_line, 2);
        assert_eq!(fused[1].chunk.start_line, 3);
    }

    #[test]
    fn test_rrf_both_lists_beats_single_list() {
        // Same ranks in both lists: the doc in both should outrank docs in
        // only one list at the same position
        let dense = vec![scored(1, "both", 0.9), scored(2, "dense only", 0.8)];
        let lexical = vec![scored(1, "both", 1.0), scored(3, "lex only", 0.9)];
        let mut fused = rrf_fuse(dense, lexical, 0.5, 60.0);
        fused.sort_by(|a, b| b.rank_score.total_cmp(&a.rank_score));
        assert_eq!(fused[0].chunk.start_line, 1);
    }

    #[test]
    fn test_rrf_preserves_dense_score_for_display() {
        let dense = vec![scored(1, "a", 0.77)];
        let lexical = vec![scored(2, "b", 1.0)];
        let fused = rrf_fuse(dense, lexical, 0.5, 60.0);
        let a = fused.iter().find(|c| c.chunk.start_line == 1).unwrap();
        let b = fused.iter().find(|c| c.chunk.start_line == 2).unwrap();
        assert_eq!(a.dense_score, Some(0.77));
        assert_eq!(b.dense_score, None);
    }

    #[test]
    fn test_recency_multiplier_decays() {
        let now = 1_700_000_000i64;
        let fresh = recency_multiplier(now, now, 0.5, 30.0);
        assert!((fresh - 1.5).abs() < 1e-4);
        // One half-life later the boost halves
        let old = recency_multiplier(now - 30 * 86_400, now, 0.5, 30.0);
        assert!((old - 1.25).abs() < 1e-4);
        // Unknown mtime: no boost
        assert_eq!(recency_multiplier(0, now, 0.5, 30.0), 1.0);
        // Zero factor: no-op
        assert_eq!(recency_multiplier(now, now, 0.0, 30.0), 1.0);
    }

    #[test]
    fn test_make_preview_collapses_whitespace() {
        let preview = make_preview("fn   foo()\n\n{\n    bar();\n}");
        assert_eq!(preview, "fn foo() { bar(); }");
        let long = make_preview(&"word ".repeat(100));
        assert!(long.chars().count() <= PREVIEW_CHARS + 1);
        assert!(long.ends_with('…'));
    }

    #[test]
    fn test_sort_and_dedupe_deterministic() {
        let make = |line: u32, score: f32| RankedResult {
            chunk: chunk(line, "x"),
            profile: Domain::Code,
            score,
            boosted_score: None,
            matched_queries: vec![],
            relevance: Relevance::None,
            preview: String::new(),
            rank_score: score,
        };
        let mut results = vec![make(2, 0.5), make(1, 0.5), make(3, 0.9)];
        sort_ranked(&mut results);
        assert_eq!(results[0].chunk.start_line, 3);
        // Tie between lines 1 and 2 broken by id ascending
        assert!(results[1].chunk.id < results[2].chunk.id);

        let duplicate = results[1].clone();
        results.push(duplicate);
        dedupe_by_id(&mut results);
        assert_eq!(results.len(), 3);
    }

    #[test]
    fn test_output_mode_parsing() {
        assert_eq!("blended".parse::<OutputMode>().unwrap(), OutputMode::Blended);
        assert_eq!("by_query".parse::<OutputMode>().unwrap(), OutputMode::ByQuery);
        assert_eq!(
            "by_collection".parse::<OutputMode>().unwrap(),
            OutputMode::ByProfile
        );
        assert_eq!(
            "by_profile".parse::<OutputMode>().unwrap(),
            OutputMode::ByProfile
        );
        assert!("sideways".parse::<OutputMode>().is_err());
    }
}
