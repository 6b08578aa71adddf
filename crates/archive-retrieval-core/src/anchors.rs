//! Anchor re-ranking: bias results toward positive examples and away from
//! negative ones.
//!
//! For a result with embedding `e`:
//!
//! ```text
//! score += positive_weight × max cos(e, positive anchors)
//! score -= negative_weight × max cos(e, negative anchors)
//! ```
//!
//! A result whose best negative similarity exceeds
//! `negative_filter_threshold` is removed regardless of its score. Results
//! without a known embedding pass through unchanged.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::embedding::max_similarity;
use crate::fusion::FusedResult;
use crate::models::StoreTag;

/// Characters of result text kept on an anchor for display.
pub const ANCHOR_PREVIEW_CHARS: usize = 160;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnchorPolarity {
    Positive,
    Negative,
}

impl fmt::Display for AnchorPolarity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnchorPolarity::Positive => write!(f, "positive"),
            AnchorPolarity::Negative => write!(f, "negative"),
        }
    }
}

/// A user-designated example result. `id` is the source result's id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemanticAnchor {
    pub id: String,
    pub source: StoreTag,
    pub polarity: AnchorPolarity,
    pub embedding: Vec<f32>,
    pub preview: String,
    pub created_at: DateTime<Utc>,
}

impl SemanticAnchor {
    pub fn new(
        id: impl Into<String>,
        source: StoreTag,
        polarity: AnchorPolarity,
        embedding: Vec<f32>,
        text: &str,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            source,
            polarity,
            embedding,
            preview: text.chars().take(ANCHOR_PREVIEW_CHARS).collect(),
            created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnchorConfig {
    pub positive_weight: f64,
    pub negative_weight: f64,
    pub negative_filter_threshold: f64,
}

impl Default for AnchorConfig {
    fn default() -> Self {
        Self {
            positive_weight: 0.3,
            negative_weight: 0.3,
            negative_filter_threshold: 0.7,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RerankOutcome {
    pub results: Vec<FusedResult>,
    pub filtered_by_negative: usize,
    pub adjusted: usize,
}

/// Adjust and filter `results` against the session's anchors.
///
/// `embeddings` maps result ids to their vectors. Ids missing from it
/// pass through unadjusted.
pub fn rerank(
    results: Vec<FusedResult>,
    embeddings: &HashMap<String, Vec<f32>>,
    positive: &[SemanticAnchor],
    negative: &[SemanticAnchor],
    config: &AnchorConfig,
) -> RerankOutcome {
    if positive.is_empty() && negative.is_empty() {
        return RerankOutcome {
            results,
            ..Default::default()
        };
    }

    let mut outcome = RerankOutcome::default();
    for mut fused in results {
        let Some(vector) = embeddings.get(fused.id()) else {
            outcome.results.push(fused);
            continue;
        };

        let pos = max_similarity(vector, positive.iter().map(|a| a.embedding.as_slice()));
        let neg = max_similarity(vector, negative.iter().map(|a| a.embedding.as_slice()));

        if let Some(n) = neg {
            if n > config.negative_filter_threshold {
                tracing::debug!(id = %fused.id(), similarity = n, "filtered by negative anchor");
                outcome.filtered_by_negative += 1;
                continue;
            }
        }

        let delta = pos.map_or(0.0, |p| config.positive_weight * p)
            - neg.map_or(0.0, |n| config.negative_weight * n);
        if delta != 0.0 {
            fused.result.score += delta;
            outcome.adjusted += 1;
        }
        outcome.results.push(fused);
    }

    outcome.results.sort_by(|a, b| {
        b.score()
            .partial_cmp(&a.score())
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.id().cmp(b.id()))
    });
    outcome
}
