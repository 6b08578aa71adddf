//! Quality gate: drop low-substance results and enrich short ones with
//! parent context.
//!
//! # Gate
//!
//! 1. `has_min_words`: `word_count >= min_word_count`.
//! 2. Quality score: the stored `qualityScore` when the importer recorded
//!    one ([`QualityScore::Provided`]), else a heuristic estimate
//!    ([`QualityScore::Estimated`]).
//! 3. `has_min_quality`: `score >= min_quality_score`.
//! 4. Results failing either check are dropped and counted.
//!
//! # Context expansion
//!
//! A passing result shorter than `2 × min_word_count` that has a parent is
//! expanded: the parent is fetched and folded into `context_text`. When the
//! child is the first chunk, the parent text is used as-is; otherwise a
//! 500-character parent excerpt is prepended under a label. Fetch failures
//! leave the result unexpanded.

use serde::Serialize;
use std::time::Instant;

use crate::fusion::FusedResult;
use crate::models::{count_words, ContentNode, SearchResult};
use crate::store::NodeLookup;

/// Characters of parent text included in a labeled excerpt.
pub const PARENT_EXCERPT_CHARS: usize = 500;

const TRUNCATION_MARKERS: [&str; 4] = ["...", "…", "[truncated]", "[continued]"];

/// Gate thresholds and expansion policy.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityGateConfig {
    pub min_word_count: usize,
    pub min_quality_score: f64,
    pub expand_context: bool,
    /// How many ancestors expansion may climb through.
    pub max_context_levels: usize,
    /// Recompute indicators from the expanded text instead of forcing them
    /// to passing.
    pub revalidate_expanded: bool,
}

impl Default for QualityGateConfig {
    fn default() -> Self {
        Self {
            min_word_count: 30,
            min_quality_score: 0.4,
            expand_context: true,
            max_context_levels: 1,
            revalidate_expanded: false,
        }
    }
}

/// Where a result's quality score came from.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "origin", content = "value", rename_all = "lowercase")]
pub enum QualityScore {
    /// Recorded in the node's source metadata.
    Provided(f64),
    /// Computed from content heuristics.
    Estimated(f64),
}

impl QualityScore {
    pub fn value(self) -> f64 {
        match self {
            QualityScore::Provided(v) | QualityScore::Estimated(v) => v,
        }
    }
}

/// Score a node: stored metadata first, heuristics otherwise.
pub fn quality_score(node: &ContentNode) -> QualityScore {
    match node.stored_quality_score() {
        Some(v) => QualityScore::Provided(v.clamp(0.0, 1.0)),
        None => QualityScore::Estimated(estimate_quality(node)),
    }
}

/// Heuristic quality estimate in `[0, 1]`.
///
/// Base 0.5; +0.2 for 100+ words (else +0.1 for 50+); +0.1 each for a
/// title, a non-system author, and tags.
pub fn estimate_quality(node: &ContentNode) -> f64 {
    let mut score = 0.5;
    if node.word_count >= 100 {
        score += 0.2;
    } else if node.word_count >= 50 {
        score += 0.1;
    }
    if node.title.as_deref().is_some_and(|t| !t.trim().is_empty()) {
        score += 0.1;
    }
    if node.author_role.as_deref() != Some("system") {
        score += 0.1;
    }
    if !node.tags.is_empty() {
        score += 0.1;
    }
    f64::clamp(score, 0.0, 1.0)
}

/// True when the text looks cut off or the node is a non-leading chunk.
///
/// Informational only; never fails the gate on its own.
pub fn is_possibly_truncated(node: &ContentNode) -> bool {
    let trimmed = node.text.trim_end();
    TRUNCATION_MARKERS.iter().any(|m| trimmed.ends_with(m))
        || node.chunk_index.is_some_and(|i| i > 0)
}

/// Per-result gate outcome. Recomputed on every pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QualityIndicators {
    pub has_min_words: bool,
    pub has_min_quality: bool,
    pub is_complete: bool,
    pub passed_gate: bool,
}

impl QualityIndicators {
    pub fn evaluate(node: &ContentNode, score: QualityScore, config: &QualityGateConfig) -> Self {
        let has_min_words = node.word_count >= config.min_word_count;
        let has_min_quality = score.value() >= config.min_quality_score;
        Self {
            has_min_words,
            has_min_quality,
            is_complete: !is_possibly_truncated(node),
            passed_gate: has_min_words && has_min_quality,
        }
    }

    pub fn all_passing() -> Self {
        Self {
            has_min_words: true,
            has_min_quality: true,
            is_complete: true,
            passed_gate: true,
        }
    }
}

/// A fused result after the gate, possibly carrying parent context.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnrichedResult {
    #[serde(flatten)]
    pub fused: FusedResult,
    pub context_expanded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_node: Option<ContentNode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_text: Option<String>,
    pub quality_score: QualityScore,
    pub indicators: QualityIndicators,
}

impl EnrichedResult {
    pub fn id(&self) -> &str {
        self.fused.id()
    }

    pub fn score(&self) -> f64 {
        self.fused.score()
    }

    /// The text to show a reader: expanded context when present.
    pub fn display_text(&self) -> &str {
        self.context_text
            .as_deref()
            .unwrap_or(&self.fused.result.node.text)
    }
}

/// Aggregate counters for one gate pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GateStats {
    pub input_count: usize,
    pub passed_count: usize,
    pub filtered_by_words: usize,
    pub filtered_by_quality: usize,
    pub dropped_malformed: usize,
    pub context_expanded_count: usize,
    pub processing_time_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GateOutcome {
    pub results: Vec<EnrichedResult>,
    pub stats: GateStats,
}

fn is_malformed(result: &SearchResult) -> bool {
    result.id.trim().is_empty() || !result.score.is_finite()
}

/// Run the full gate, expanding short results through `lookup`.
///
/// Input order is preserved. Never fails: lookup errors are logged and the
/// result is kept unexpanded.
pub async fn apply_gate(
    results: Vec<FusedResult>,
    lookup: &dyn NodeLookup,
    config: &QualityGateConfig,
) -> GateOutcome {
    let started = Instant::now();
    let mut stats = GateStats {
        input_count: results.len(),
        ..Default::default()
    };
    let mut passed = Vec::with_capacity(results.len());

    for fused in results {
        if is_malformed(&fused.result) {
            tracing::debug!(id = %fused.result.id, "dropping malformed result");
            stats.dropped_malformed += 1;
            continue;
        }
        let node = &fused.result.node;
        let score = quality_score(node);
        let indicators = QualityIndicators::evaluate(node, score, config);
        if !indicators.has_min_words {
            stats.filtered_by_words += 1;
            continue;
        }
        if !indicators.has_min_quality {
            stats.filtered_by_quality += 1;
            continue;
        }

        let mut enriched = EnrichedResult {
            fused,
            context_expanded: false,
            parent_node: None,
            context_text: None,
            quality_score: score,
            indicators,
        };
        if config.expand_context && needs_expansion(&enriched.fused.result.node, config) {
            expand_context(&mut enriched, lookup, config).await;
            if enriched.context_expanded {
                stats.context_expanded_count += 1;
            }
        }
        passed.push(enriched);
    }

    stats.passed_count = passed.len();
    stats.processing_time_ms = started.elapsed().as_millis() as u64;
    tracing::debug!(
        input = stats.input_count,
        passed = stats.passed_count,
        by_words = stats.filtered_by_words,
        by_quality = stats.filtered_by_quality,
        expanded = stats.context_expanded_count,
        "quality gate"
    );
    GateOutcome {
        results: passed,
        stats,
    }
}

fn needs_expansion(node: &ContentNode, config: &QualityGateConfig) -> bool {
    config.max_context_levels > 0
        && node.parent_node_id.is_some()
        && node.word_count < config.min_word_count.saturating_mul(2)
}

async fn expand_context(
    enriched: &mut EnrichedResult,
    lookup: &dyn NodeLookup,
    config: &QualityGateConfig,
) {
    let child = &enriched.fused.result.node;
    let short_limit = config.min_word_count.saturating_mul(2);
    let mut next_id = child.parent_node_id.clone();
    let mut ancestor: Option<ContentNode> = None;
    let mut levels = 0;

    while let Some(id) = next_id.take() {
        if levels >= config.max_context_levels {
            break;
        }
        match lookup.lookup_node(&id).await {
            Ok(Some(node)) => {
                levels += 1;
                if node.word_count < short_limit {
                    next_id = node.parent_node_id.clone();
                }
                ancestor = Some(node);
            }
            Ok(None) => {
                tracing::debug!(parent = %id, child = %child.id, "parent node not found");
            }
            Err(e) => {
                tracing::warn!(parent = %id, child = %child.id, error = %e, "context expansion failed");
            }
        }
    }

    let Some(parent) = ancestor else {
        return;
    };
    let text = build_context_text(child, &parent, levels == 1);
    enriched.indicators = if config.revalidate_expanded {
        revalidated(&text, enriched.quality_score, config)
    } else {
        QualityIndicators::all_passing()
    };
    enriched.context_text = Some(text);
    enriched.parent_node = Some(parent);
    enriched.context_expanded = true;
}

/// Combine parent and child text.
///
/// `direct_parent` is false when expansion climbed past the immediate
/// parent; the child can then never be the ancestor's start.
pub fn build_context_text(child: &ContentNode, parent: &ContentNode, direct_parent: bool) -> String {
    if direct_parent && child.is_parent_start() {
        return parent.text.clone();
    }
    let mut excerpt: String = parent.text.chars().take(PARENT_EXCERPT_CHARS).collect();
    if parent.text.chars().count() > PARENT_EXCERPT_CHARS {
        excerpt.push_str("...");
    }
    format!(
        "[Parent context]\n{}\n\n[Current chunk]\n{}",
        excerpt, child.text
    )
}

fn revalidated(text: &str, score: QualityScore, config: &QualityGateConfig) -> QualityIndicators {
    let has_min_words = count_words(text) >= config.min_word_count;
    let has_min_quality = score.value() >= config.min_quality_score;
    let trimmed = text.trim_end();
    QualityIndicators {
        has_min_words,
        has_min_quality,
        is_complete: !TRUNCATION_MARKERS.iter().any(|m| trimmed.ends_with(m)),
        passed_gate: has_min_words && has_min_quality,
    }
}

/// Lightweight gate without context expansion.
///
/// Returns the passing results with their indicators, in input order.
pub fn quick_filter(
    results: &[SearchResult],
    config: &QualityGateConfig,
) -> Vec<(SearchResult, QualityIndicators)> {
    results
        .iter()
        .filter(|r| !is_malformed(r))
        .filter_map(|r| {
            let indicators = QualityIndicators::evaluate(&r.node, quality_score(&r.node), config);
            indicators.passed_gate.then(|| (r.clone(), indicators))
        })
        .collect()
}
