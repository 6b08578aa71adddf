use std::collections::HashSet;
use std::sync::Arc;

use chrono::{Duration, Utc};
use proptest::prelude::*;

use archive_retrieval::anchors::{AnchorPolarity, SemanticAnchor};
use archive_retrieval::fusion::{fuse, fuse_results, FusionParams, RankedHit};
use archive_retrieval::models::{ContentNode, SearchResult, StoreTag, StoreTarget};
use archive_retrieval::quality::{apply_gate, quality_score, QualityGateConfig};
use archive_retrieval::session::{HistoryKind, SearchHistoryEntry, SearchSession};
use archive_retrieval::store::memory::InMemoryStore;
use archive_retrieval::store::unified::UnifiedStore;

#[derive(Debug, Clone)]
enum Op {
    Pin(u8),
    Unpin(u8),
    Exclude(u8),
    Unexclude(u8),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u8..8).prop_map(Op::Pin),
        (0u8..8).prop_map(Op::Unpin),
        (0u8..8).prop_map(Op::Exclude),
        (0u8..8).prop_map(Op::Unexclude),
    ]
}

fn session() -> SearchSession {
    SearchSession::new("prop", Utc::now(), Duration::hours(1))
}

fn history_entry(i: usize) -> SearchHistoryEntry {
    SearchHistoryEntry {
        query: Some(format!("q{}", i)),
        timestamp: Utc::now(),
        result_count: i,
        target: StoreTarget::All,
        kind: HistoryKind::Search,
        min_score: None,
        min_word_count: None,
    }
}

fn node_strategy() -> impl Strategy<Value = ContentNode> {
    (
        "[a-z]{1,6}",
        0usize..120,
        any::<bool>(),
        any::<bool>(),
        prop::option::of(0.0f64..1.0),
    )
        .prop_map(|(id, words, titled, system, stored)| {
            let mut node = ContentNode::new(id, vec!["word"; words].join(" "));
            if titled {
                node.title = Some("title".to_string());
            }
            if system {
                node.author_role = Some("system".to_string());
            }
            if let Some(q) = stored {
                node.source_metadata = serde_json::json!({ "qualityScore": q });
            }
            node
        })
}

fn ranked_list() -> impl Strategy<Value = Vec<RankedHit>> {
    prop::collection::vec(("[a-f]", 0.0f64..1.0), 0..12).prop_map(|hits| {
        hits.into_iter()
            .map(|(id, score)| RankedHit::new(id, score))
            .collect()
    })
}

proptest! {
    #[test]
    fn pinned_and_excluded_stay_disjoint(ops in prop::collection::vec(op(), 0..64)) {
        let mut s = session();
        for op in ops {
            match op {
                Op::Pin(i) => { s.pin([format!("r{}", i)]); }
                Op::Unpin(i) => { s.unpin([format!("r{}", i)]); }
                Op::Exclude(i) => { s.exclude([format!("r{}", i)]); }
                Op::Unexclude(i) => { s.unexclude([format!("r{}", i)]); }
            }
            prop_assert!(s.pinned_ids.is_disjoint(&s.excluded_ids));
        }
    }

    #[test]
    fn history_never_exceeds_bound(count in 0usize..200, max in 1usize..60) {
        let mut s = session();
        for i in 0..count {
            s.push_history(history_entry(i), max);
            prop_assert!(s.history.len() <= max);
        }
        // Oldest entries go first; the survivors are the newest, in order.
        let kept: Vec<usize> = s.history.iter().map(|e| e.result_count).collect();
        let expected: Vec<usize> = (count.saturating_sub(max)..count).collect();
        prop_assert_eq!(kept, expected);
    }

    #[test]
    fn anchors_are_unique_across_polarities(
        adds in prop::collection::vec((0u8..6, any::<bool>()), 0..40)
    ) {
        let mut s = session();
        for (i, positive) in adds {
            let polarity = if positive { AnchorPolarity::Positive } else { AnchorPolarity::Negative };
            s.add_anchor(SemanticAnchor::new(
                format!("a{}", i),
                StoreTag::Archive,
                polarity,
                vec![1.0],
                "text",
                Utc::now(),
            ));
            let mut seen = HashSet::new();
            for a in s.positive_anchors.iter().chain(&s.negative_anchors) {
                prop_assert!(seen.insert(a.id.clone()), "duplicate anchor {}", a.id);
            }
        }
    }

    #[test]
    fn same_anchor_twice_keeps_length(i in 0u8..6, positive in any::<bool>()) {
        let polarity = if positive { AnchorPolarity::Positive } else { AnchorPolarity::Negative };
        let anchor = SemanticAnchor::new(format!("a{}", i), StoreTag::Books, polarity, vec![1.0], "t", Utc::now());
        let mut s = session();
        s.add_anchor(anchor.clone());
        let before = s.anchor_count();
        s.add_anchor(anchor);
        prop_assert_eq!(s.anchor_count(), before);
    }

    #[test]
    fn fusion_is_sorted_union(dense in ranked_list(), sparse in ranked_list()) {
        let fused = fuse(&dense, &sparse, &FusionParams::default());
        let union: HashSet<&str> = dense.iter().chain(&sparse).map(|h| h.id.as_str()).collect();
        prop_assert_eq!(fused.len(), union.len());
        for pair in fused.windows(2) {
            prop_assert!(pair[0].fused_score >= pair[1].fused_score);
        }
    }

    #[test]
    fn gate_output_meets_thresholds(
        nodes in prop::collection::vec(node_strategy(), 0..20),
        min_words in 0usize..80,
        min_quality in 0.0f64..1.0,
    ) {
        let config = QualityGateConfig {
            min_word_count: min_words,
            min_quality_score: min_quality,
            ..Default::default()
        };
        let results: Vec<SearchResult> = nodes
            .into_iter()
            .enumerate()
            .map(|(i, node)| SearchResult {
                id: format!("{}-{}", node.id, i),
                source: StoreTag::Archive,
                node,
                score: 1.0 / (i as f64 + 1.0),
            })
            .collect();
        let fused = fuse_results(results, Vec::new(), &FusionParams::default());
        let lookup = UnifiedStore::new(Arc::new(InMemoryStore::new()));

        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let outcome = runtime.block_on(apply_gate(fused, &lookup, &config));

        for r in &outcome.results {
            let node = &r.fused.result.node;
            prop_assert!(node.word_count >= min_words);
            prop_assert!(quality_score(node).value() >= min_quality);
        }
        prop_assert_eq!(
            outcome.stats.passed_count + outcome.stats.filtered_by_words
                + outcome.stats.filtered_by_quality + outcome.stats.dropped_malformed,
            outcome.stats.input_count
        );
    }
}
