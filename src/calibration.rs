//! Per-profile score calibration
//!
//! Raw cosine scores vary by embedding model: one model's "great match" is
//! 0.9, another's is 0.6. At index time we embed a sample of the profile's
//! own chunks, measure the self-similarity distribution, and derive the
//! thresholds used to label search results high/medium/low.
//!
//! Calibration is re-run only when the fingerprint `{model, vector_dim}`
//! changes or a full index is built; it persists as one row per profile.

use serde::{Deserialize, Serialize};

use crate::chunker::Domain;
use crate::storage::cosine_similarity;

/// How many chunks to sample for calibration.
pub const SAMPLE_SIZE: usize = 32;
/// Cap on cross-pair comparisons (sample is small, but keep it bounded).
const MAX_PAIRS: usize = 256;

/// Relevance tier assigned to a search result from calibrated thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Relevance {
    High,
    Medium,
    Low,
    None,
}

impl Relevance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Relevance::High => "high",
            Relevance::Medium => "medium",
            Relevance::Low => "low",
            Relevance::None => "none",
        }
    }

    /// Abbreviated form for `--min` output.
    pub fn short(&self) -> &'static str {
        match self {
            Relevance::High => "h",
            Relevance::Medium => "m",
            Relevance::Low => "l",
            Relevance::None => "n",
        }
    }
}

impl std::fmt::Display for Relevance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted calibration record for one profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationMetadata {
    pub domain: Domain,
    pub embedding_model: String,
    pub calibration_date: String,
    pub perfect_match_score: f32,
    pub baseline_score: f32,
    pub score_range: f32,
    pub threshold_high: f32,
    pub threshold_medium: f32,
    pub threshold_low: f32,
    pub vector_dim: usize,
}

impl CalibrationMetadata {
    /// Label a score against the calibrated thresholds.
    pub fn tier(&self, score: f32) -> Relevance {
        if score >= self.threshold_high {
            Relevance::High
        } else if score >= self.threshold_medium {
            Relevance::Medium
        } else if score >= self.threshold_low {
            Relevance::Low
        } else {
            Relevance::None
        }
    }

    /// True when this record was produced by a different embedder setup.
    pub fn is_stale_for(&self, model: &str, dim: usize) -> bool {
        self.embedding_model != model || self.vector_dim != dim
    }
}

/// Fallback thresholds when a profile has never been calibrated.
pub fn default_calibration(domain: Domain, model: &str, dim: usize) -> CalibrationMetadata {
    CalibrationMetadata {
        domain,
        embedding_model: model.to_string(),
        calibration_date: String::new(),
        perfect_match_score: 1.0,
        baseline_score: 0.0,
        score_range: 1.0,
        threshold_high: 0.80,
        threshold_medium: 0.50,
        threshold_low: 0.25,
        vector_dim: dim,
    }
}

/// Derive a calibration record from sampled chunk vectors.
///
/// `perfect` is the self-similarity of identical text (1.0 for normalised
/// vectors); `baseline` is the mean similarity across distinct sample
/// pairs, the score an unrelated-but-same-corpus match tends to get.
/// Thresholds sit at fixed fractions of the usable range above baseline.
pub fn calibrate_from_vectors(
    domain: Domain,
    model: &str,
    vectors: &[Vec<f32>],
) -> CalibrationMetadata {
    let dim = vectors.first().map(|v| v.len()).unwrap_or(0);

    let mut pair_sum = 0.0f64;
    let mut pair_count = 0usize;
    'outer: for i in 0..vectors.len() {
        for j in (i + 1)..vectors.len() {
            pair_sum += cosine_similarity(&vectors[i], &vectors[j]) as f64;
            pair_count += 1;
            if pair_count >= MAX_PAIRS {
                break 'outer;
            }
        }
    }

    let perfect = 1.0f32;
    let baseline = if pair_count == 0 {
        0.0
    } else {
        (pair_sum / pair_count as f64) as f32
    };
    // Degenerate distributions (single sample, all-identical content) still
    // need a positive range to label against
    let range = (perfect - baseline).max(0.05);

    CalibrationMetadata {
        domain,
        embedding_model: model.to_string(),
        calibration_date: chrono::Utc::now().to_rfc3339(),
        perfect_match_score: perfect,
        baseline_score: baseline,
        score_range: range,
        threshold_high: baseline + 0.80 * range,
        threshold_medium: baseline + 0.50 * range,
        threshold_low: baseline + 0.25 * range,
        vector_dim: dim,
    }
}
