//! Weighted Reciprocal Rank Fusion over dense and sparse result lists.
//!
//! # Scoring
//!
//! ```text
//! fused(id) = w_dense / (k + rank_dense(id)) + w_sparse / (k + rank_sparse(id))
//! ```
//!
//! Ranks are 1-based positions in each input list. An id missing from a
//! list gets no contribution from it (not a penalty).
//!
//! # Ordering
//!
//! 1. Fused score (desc).
//! 2. Raw dense score (desc); ids without a dense hit sort last.
//! 3. First-seen modality (dense before sparse).
//! 4. Id (asc).
//!
//! The output is never truncated: the union of both lists comes back so
//! that re-ranking and the quality gate see every candidate.

use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashMap;

use crate::error::RetrievalError;
use crate::models::SearchResult;

/// Default RRF smoothing constant.
pub const DEFAULT_RRF_K: f64 = 60.0;
/// Default weight for the dense (vector) modality.
pub const DEFAULT_DENSE_WEIGHT: f64 = 0.7;
/// Default weight for the sparse (keyword) modality.
pub const DEFAULT_SPARSE_WEIGHT: f64 = 0.3;

/// Validated fusion parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FusionParams {
    dense_weight: f64,
    sparse_weight: f64,
    k: f64,
}

impl FusionParams {
    /// Validate and build fusion parameters.
    ///
    /// Weights must be finite and non-negative, and not both zero.
    /// `k` must be finite and strictly positive.
    pub fn new(dense_weight: f64, sparse_weight: f64, k: f64) -> Result<Self, RetrievalError> {
        for (name, w) in [("dense_weight", dense_weight), ("sparse_weight", sparse_weight)] {
            if !w.is_finite() || w < 0.0 {
                return Err(RetrievalError::Validation(format!(
                    "{} must be a finite value >= 0 (got {})",
                    name, w
                )));
            }
        }
        if dense_weight == 0.0 && sparse_weight == 0.0 {
            return Err(RetrievalError::Validation(
                "dense_weight and sparse_weight cannot both be 0".to_string(),
            ));
        }
        if !k.is_finite() || k <= 0.0 {
            return Err(RetrievalError::Validation(format!(
                "rrf k must be > 0 (got {})",
                k
            )));
        }
        Ok(Self {
            dense_weight,
            sparse_weight,
            k,
        })
    }

    pub fn dense_weight(&self) -> f64 {
        self.dense_weight
    }

    pub fn sparse_weight(&self) -> f64 {
        self.sparse_weight
    }

    pub fn k(&self) -> f64 {
        self.k
    }
}

impl Default for FusionParams {
    fn default() -> Self {
        Self {
            dense_weight: DEFAULT_DENSE_WEIGHT,
            sparse_weight: DEFAULT_SPARSE_WEIGHT,
            k: DEFAULT_RRF_K,
        }
    }
}

/// The search modality a hit came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Dense,
    Sparse,
}

/// One entry of a ranked input list. Its rank is its position.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedHit {
    pub id: String,
    pub raw_score: f64,
}

impl RankedHit {
    pub fn new(id: impl Into<String>, raw_score: f64) -> Self {
        Self {
            id: id.into(),
            raw_score,
        }
    }
}

/// Fusion output for a single id.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FusedHit {
    pub id: String,
    pub fused_score: f64,
    pub dense_rank: Option<usize>,
    pub sparse_rank: Option<usize>,
    pub dense_score: Option<f64>,
    pub sparse_score: Option<f64>,
    pub first_seen: Modality,
}

/// Fuse ranked id lists with weighted RRF.
pub fn fuse(dense: &[RankedHit], sparse: &[RankedHit], params: &FusionParams) -> Vec<FusedHit> {
    let mut hits: HashMap<&str, FusedHit> = HashMap::new();

    for (modality, list, weight) in [
        (Modality::Dense, dense, params.dense_weight),
        (Modality::Sparse, sparse, params.sparse_weight),
    ] {
        for (pos, hit) in list.iter().enumerate() {
            let rank = pos + 1;
            let entry = hits.entry(hit.id.as_str()).or_insert_with(|| FusedHit {
                id: hit.id.clone(),
                fused_score: 0.0,
                dense_rank: None,
                sparse_rank: None,
                dense_score: None,
                sparse_score: None,
                first_seen: modality,
            });
            let (rank_slot, score_slot) = match modality {
                Modality::Dense => (&mut entry.dense_rank, &mut entry.dense_score),
                Modality::Sparse => (&mut entry.sparse_rank, &mut entry.sparse_score),
            };
            // Duplicate ids within one list keep their best (first) rank.
            if rank_slot.is_some() {
                continue;
            }
            *rank_slot = Some(rank);
            *score_slot = Some(hit.raw_score);
            entry.fused_score += weight / (params.k + rank as f64);
        }
    }

    let mut fused: Vec<FusedHit> = hits.into_values().collect();
    fused.sort_by(compare_fused);
    fused
}

fn compare_fused(a: &FusedHit, b: &FusedHit) -> Ordering {
    let dense_a = a.dense_score.unwrap_or(f64::NEG_INFINITY);
    let dense_b = b.dense_score.unwrap_or(f64::NEG_INFINITY);
    b.fused_score
        .partial_cmp(&a.fused_score)
        .unwrap_or(Ordering::Equal)
        .then(dense_b.partial_cmp(&dense_a).unwrap_or(Ordering::Equal))
        .then(a.first_seen.cmp(&b.first_seen))
        .then(a.id.cmp(&b.id))
}

/// A [`SearchResult`] after fusion. `result.score` holds the fused score.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FusedResult {
    pub result: SearchResult,
    pub dense_rank: Option<usize>,
    pub sparse_rank: Option<usize>,
    pub dense_score: Option<f64>,
    pub sparse_score: Option<f64>,
}

impl FusedResult {
    /// Wrap an already-scored result (e.g. a session's stored result) so it
    /// can re-enter the pipeline without fusion.
    pub fn carried(result: SearchResult) -> Self {
        Self {
            result,
            dense_rank: None,
            sparse_rank: None,
            dense_score: None,
            sparse_score: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.result.id
    }

    pub fn score(&self) -> f64 {
        self.result.score
    }
}

/// Fuse dense and sparse [`SearchResult`] lists, keeping their nodes.
///
/// Input lists must already be sorted best-first. When an id appears in
/// both lists, the dense copy of the result is kept.
pub fn fuse_results(
    dense: Vec<SearchResult>,
    sparse: Vec<SearchResult>,
    params: &FusionParams,
) -> Vec<FusedResult> {
    let dense_hits: Vec<RankedHit> = dense
        .iter()
        .map(|r| RankedHit::new(r.id.clone(), r.score))
        .collect();
    let sparse_hits: Vec<RankedHit> = sparse
        .iter()
        .map(|r| RankedHit::new(r.id.clone(), r.score))
        .collect();

    let mut by_id: HashMap<String, SearchResult> = HashMap::new();
    for r in dense.into_iter().chain(sparse) {
        by_id.entry(r.id.clone()).or_insert(r);
    }

    fuse(&dense_hits, &sparse_hits, params)
        .into_iter()
        .filter_map(|hit| {
            by_id.remove(&hit.id).map(|mut result| {
                result.score = hit.fused_score;
                FusedResult {
                    result,
                    dense_rank: hit.dense_rank,
                    sparse_rank: hit.sparse_rank,
                    dense_score: hit.dense_score,
                    sparse_score: hit.sparse_score,
                }
            })
        })
        .collect()
}
