//! Core data models shared by the retrieval pipeline.
//!
//! [`ContentNode`]s are owned by the backing stores and only read here.
//! Every query produces fresh [`SearchResult`]s tagged with the store they
//! came from.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::RetrievalError;

/// Which backing store a result originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreTag {
    Archive,
    Books,
}

impl fmt::Display for StoreTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreTag::Archive => write!(f, "archive"),
            StoreTag::Books => write!(f, "books"),
        }
    }
}

/// A unit of retrievable content: a message, a chunk of a long message,
/// a book passage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentNode {
    pub id: String,
    pub text: String,
    pub word_count: usize,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Node this one was chunked from, if any.
    #[serde(default)]
    pub parent_node_id: Option<String>,
    /// Position among the parent's chunks (0-based).
    #[serde(default)]
    pub chunk_index: Option<u32>,
    /// Character offset of this chunk within the parent text.
    #[serde(default)]
    pub chunk_start_offset: Option<usize>,
    /// `"user"`, `"assistant"`, `"system"`, ... as recorded by the importer.
    #[serde(default)]
    pub author_role: Option<String>,
    /// Import format the node came from (e.g. `"chatgpt"`, `"book"`).
    #[serde(default)]
    pub source_type: String,
    #[serde(default)]
    pub hierarchy_level: Option<u32>,
    #[serde(default)]
    pub source_metadata: serde_json::Value,
}

impl ContentNode {
    /// Build a node from raw text, counting whitespace-separated words.
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            id: id.into(),
            word_count: count_words(&text),
            text,
            title: None,
            tags: Vec::new(),
            parent_node_id: None,
            chunk_index: None,
            chunk_start_offset: None,
            author_role: None,
            source_type: String::new(),
            hierarchy_level: None,
            source_metadata: serde_json::Value::Null,
        }
    }

    /// Quality score recorded by an upstream analysis pass, if any.
    ///
    /// Accepts both `qualityScore` and `quality_score` keys.
    pub fn stored_quality_score(&self) -> Option<f64> {
        let meta = self.source_metadata.as_object()?;
        meta.get("qualityScore")
            .or_else(|| meta.get("quality_score"))
            .and_then(|v| v.as_f64())
            .filter(|v| v.is_finite())
    }

    /// True when this node is the first chunk of its parent.
    pub fn is_parent_start(&self) -> bool {
        self.chunk_index == Some(0) || self.chunk_start_offset == Some(0)
    }
}

/// Count whitespace-separated words.
pub fn count_words(text: &str) -> usize {
    text.split_whitespace().count()
}

/// A node paired with a backend-specific relevance score.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredNode {
    pub node: ContentNode,
    pub score: f64,
}

/// A node returned by a query, tagged with its origin store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub id: String,
    pub source: StoreTag,
    pub node: ContentNode,
    pub score: f64,
}

impl SearchResult {
    pub fn from_scored(scored: ScoredNode, source: StoreTag) -> Self {
        Self {
            id: scored.node.id.clone(),
            source,
            node: scored.node,
            score: scored.score,
        }
    }
}

/// Which store(s) an operation should address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreTarget {
    Archive,
    Books,
    #[default]
    All,
}

impl StoreTarget {
    pub fn includes_archive(self) -> bool {
        matches!(self, StoreTarget::Archive | StoreTarget::All)
    }

    pub fn includes_books(self) -> bool {
        matches!(self, StoreTarget::Books | StoreTarget::All)
    }
}

impl fmt::Display for StoreTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreTarget::Archive => write!(f, "archive"),
            StoreTarget::Books => write!(f, "books"),
            StoreTarget::All => write!(f, "all"),
        }
    }
}

impl FromStr for StoreTarget {
    type Err = RetrievalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "archive" => Ok(StoreTarget::Archive),
            "books" => Ok(StoreTarget::Books),
            "all" => Ok(StoreTarget::All),
            other => Err(RetrievalError::Validation(format!(
                "unknown store target: {}. Use archive, books, or all.",
                other
            ))),
        }
    }
}

impl From<StoreTag> for StoreTarget {
    fn from(tag: StoreTag) -> Self {
        match tag {
            StoreTag::Archive => StoreTarget::Archive,
            StoreTag::Books => StoreTarget::Books,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_counts_words() {
        let node = ContentNode::new("n1", "  three little\twords \n");
        assert_eq!(node.word_count, 3);
        assert_eq!(count_words(""), 0);
    }

    #[test]
    fn test_stored_quality_score_keys() {
        let mut node = ContentNode::new("n1", "text");
        assert_eq!(node.stored_quality_score(), None);

        node.source_metadata = json!({ "qualityScore": 0.8 });
        assert_eq!(node.stored_quality_score(), Some(0.8));

        node.source_metadata = json!({ "quality_score": 0.25 });
        assert_eq!(node.stored_quality_score(), Some(0.25));

        node.source_metadata = json!({ "qualityScore": "high" });
        assert_eq!(node.stored_quality_score(), None);
    }

    #[test]
    fn test_parent_start_detection() {
        let mut node = ContentNode::new("n1", "text");
        assert!(!node.is_parent_start());
        node.chunk_index = Some(0);
        assert!(node.is_parent_start());
        node.chunk_index = Some(2);
        node.chunk_start_offset = Some(0);
        assert!(node.is_parent_start());
    }

    #[test]
    fn test_store_target_parse() {
        assert_eq!("books".parse::<StoreTarget>().unwrap(), StoreTarget::Books);
        assert_eq!(StoreTarget::All.to_string(), "all");
        assert!("library".parse::<StoreTarget>().is_err());
        assert_eq!(StoreTarget::from(StoreTag::Archive), StoreTarget::Archive);
    }

    #[test]
    fn test_store_tag_serializes_lowercase() {
        let json = serde_json::to_string(&StoreTag::Books).unwrap();
        assert_eq!(json, "\"books\"");
    }
}
