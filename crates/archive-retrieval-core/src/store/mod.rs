//! Storage abstraction for Archive Retrieval.
//!
//! The [`ContentStore`] trait is the call contract for a backing content
//! store: the primary "archive" store holding imported conversations, and
//! the optional secondary "books" store. The engine never looks inside a
//! store; it only issues these calls.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.
//!
//! | Type | Purpose |
//! |------|---------|
//! | [`NullStore`] | Stub secondary store: always empty, never available |
//! | [`memory::InMemoryStore`] | Brute-force in-memory store for tests and embedding |
//! | [`unified::UnifiedStore`] | Target-aware adapter over archive + books |

pub mod memory;
pub mod unified;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::models::{ContentNode, ScoredNode};

/// Options shared by embedding and keyword searches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchOptions {
    pub limit: usize,
    /// Minimum similarity for dense search. Ignored by keyword search.
    #[serde(default)]
    pub threshold: Option<f64>,
    #[serde(default)]
    pub source_type: Option<String>,
    #[serde(default)]
    pub hierarchy_level: Option<u32>,
}

impl SearchOptions {
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit,
            threshold: None,
            source_type: None,
            hierarchy_level: None,
        }
    }

    /// True when `node` satisfies the source-type and hierarchy filters.
    pub fn accepts(&self, node: &ContentNode) -> bool {
        if let Some(st) = &self.source_type {
            if &node.source_type != st {
                return false;
            }
        }
        if let Some(level) = self.hierarchy_level {
            if node.hierarchy_level != Some(level) {
                return false;
            }
        }
        true
    }
}

/// Structured filter for [`ContentStore::query_nodes`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeFilter {
    #[serde(default)]
    pub source_type: Option<String>,
    #[serde(default)]
    pub author_role: Option<String>,
    #[serde(default)]
    pub parent_node_id: Option<String>,
    #[serde(default)]
    pub hierarchy_level: Option<u32>,
    #[serde(default)]
    pub min_word_count: Option<usize>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: usize,
}

impl NodeFilter {
    pub fn matches(&self, node: &ContentNode) -> bool {
        if let Some(st) = &self.source_type {
            if &node.source_type != st {
                return false;
            }
        }
        if let Some(role) = &self.author_role {
            if node.author_role.as_deref() != Some(role.as_str()) {
                return false;
            }
        }
        if let Some(parent) = &self.parent_node_id {
            if node.parent_node_id.as_deref() != Some(parent.as_str()) {
                return false;
            }
        }
        if let Some(level) = self.hierarchy_level {
            if node.hierarchy_level != Some(level) {
                return false;
            }
        }
        if let Some(min) = self.min_word_count {
            if node.word_count < min {
                return false;
            }
        }
        true
    }
}

/// A page of nodes plus the total number of matches.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodePage {
    pub nodes: Vec<ContentNode>,
    pub total: usize,
}

/// Abstract backing content store.
///
/// All operations are async (via `async-trait`). Search methods return
/// nodes sorted best-first.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`search_by_embedding`](ContentStore::search_by_embedding) | Dense vector similarity search |
/// | [`search_by_keyword`](ContentStore::search_by_keyword) | Sparse full-text search |
/// | [`get_node`](ContentStore::get_node) | Fetch one node by id |
/// | [`get_embedding`](ContentStore::get_embedding) | Fetch a node's stored vector |
/// | [`query_nodes`](ContentStore::query_nodes) | Filtered listing with total count |
/// | [`is_available`](ContentStore::is_available) | Capability check for optional stores |
#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn search_by_embedding(
        &self,
        vector: &[f32],
        opts: &SearchOptions,
    ) -> Result<Vec<ScoredNode>>;

    async fn search_by_keyword(&self, text: &str, opts: &SearchOptions)
        -> Result<Vec<ScoredNode>>;

    async fn get_node(&self, id: &str) -> Result<Option<ContentNode>>;

    async fn get_embedding(&self, id: &str) -> Result<Option<Vec<f32>>>;

    async fn query_nodes(&self, filter: &NodeFilter) -> Result<NodePage>;

    /// Whether the store can currently serve queries.
    fn is_available(&self) -> bool {
        true
    }
}

/// Stub store used when no books store is configured.
///
/// Every query returns nothing and [`is_available`](ContentStore::is_available)
/// is `false`, so the adapter skips it entirely.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullStore;

#[async_trait]
impl ContentStore for NullStore {
    async fn search_by_embedding(
        &self,
        _vector: &[f32],
        _opts: &SearchOptions,
    ) -> Result<Vec<ScoredNode>> {
        Ok(Vec::new())
    }

    async fn search_by_keyword(
        &self,
        _text: &str,
        _opts: &SearchOptions,
    ) -> Result<Vec<ScoredNode>> {
        Ok(Vec::new())
    }

    async fn get_node(&self, _id: &str) -> Result<Option<ContentNode>> {
        Ok(None)
    }

    async fn get_embedding(&self, _id: &str) -> Result<Option<Vec<f32>>> {
        Ok(None)
    }

    async fn query_nodes(&self, _filter: &NodeFilter) -> Result<NodePage> {
        Ok(NodePage::default())
    }

    fn is_available(&self) -> bool {
        false
    }
}

/// Node lookup used by the quality gate for parent-context expansion.
#[async_trait]
pub trait NodeLookup: Send + Sync {
    async fn lookup_node(&self, id: &str) -> Result<Option<ContentNode>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_null_store_is_empty_and_unavailable() {
        let store = NullStore;
        assert!(!store.is_available());
        let opts = SearchOptions::with_limit(10);
        assert!(store.search_by_embedding(&[1.0], &opts).await.unwrap().is_empty());
        assert!(store.search_by_keyword("anything", &opts).await.unwrap().is_empty());
        assert!(store.get_node("n1").await.unwrap().is_none());
        assert!(store.get_embedding("n1").await.unwrap().is_none());
        assert_eq!(store.query_nodes(&NodeFilter::default()).await.unwrap().total, 0);
    }

    #[test]
    fn test_search_options_filters() {
        let mut node = ContentNode::new("n1", "text");
        node.source_type = "chatgpt".to_string();
        node.hierarchy_level = Some(0);

        let mut opts = SearchOptions::with_limit(5);
        assert!(opts.accepts(&node));
        opts.source_type = Some("claude".to_string());
        assert!(!opts.accepts(&node));
        opts.source_type = Some("chatgpt".to_string());
        opts.hierarchy_level = Some(1);
        assert!(!opts.accepts(&node));
    }

    #[test]
    fn test_node_filter_matches() {
        let mut node = ContentNode::new("n1", "one two three");
        node.author_role = Some("user".to_string());
        node.parent_node_id = Some("p1".to_string());

        let filter = NodeFilter {
            author_role: Some("user".to_string()),
            parent_node_id: Some("p1".to_string()),
            min_word_count: Some(3),
            ..Default::default()
        };
        assert!(filter.matches(&node));

        let filter = NodeFilter {
            min_word_count: Some(4),
            ..Default::default()
        };
        assert!(!filter.matches(&node));
    }
}
