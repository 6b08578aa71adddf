//! In-memory [`ContentStore`] implementation for tests and embedded use.
//!
//! Uses `HashMap` behind `std::sync::RwLock` for thread safety.
//! Dense search is brute-force cosine similarity over all stored vectors;
//! keyword search scores nodes by the number of query terms they contain.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::RwLock;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::embedding::cosine_similarity;
use crate::models::{ContentNode, ScoredNode};

use super::{ContentStore, NodeFilter, NodePage, SearchOptions};

/// In-memory store. Insertion order is kept for deterministic listings.
pub struct InMemoryStore {
    nodes: RwLock<HashMap<String, ContentNode>>,
    order: RwLock<Vec<String>>,
    vectors: RwLock<HashMap<String, Vec<f32>>>,
    available: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
            order: RwLock::new(Vec::new()),
            vectors: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Insert or replace a node, optionally with its embedding.
    pub fn insert(&self, node: ContentNode, vector: Option<Vec<f32>>) -> Result<()> {
        let id = node.id.clone();
        {
            let mut nodes = self.nodes.write().map_err(|_| anyhow!("node map poisoned"))?;
            if nodes.insert(id.clone(), node).is_none() {
                self.order
                    .write()
                    .map_err(|_| anyhow!("order list poisoned"))?
                    .push(id.clone());
            }
        }
        let mut vectors = self.vectors.write().map_err(|_| anyhow!("vector map poisoned"))?;
        match vector {
            Some(v) => {
                vectors.insert(id, v);
            }
            None => {
                vectors.remove(&id);
            }
        }
        Ok(())
    }

    /// Toggle the availability reported to the unified adapter.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, AtomicOrdering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.nodes.read().map(|n| n.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn sort_desc(candidates: &mut [ScoredNode]) {
    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.node.id.cmp(&b.node.id))
    });
}

#[async_trait]
impl ContentStore for InMemoryStore {
    async fn search_by_embedding(
        &self,
        vector: &[f32],
        opts: &SearchOptions,
    ) -> Result<Vec<ScoredNode>> {
        let nodes = self.nodes.read().map_err(|_| anyhow!("node map poisoned"))?;
        let vectors = self.vectors.read().map_err(|_| anyhow!("vector map poisoned"))?;
        let threshold = opts.threshold.unwrap_or(f64::NEG_INFINITY);

        let mut candidates: Vec<ScoredNode> = vectors
            .iter()
            .filter_map(|(id, v)| {
                let node = nodes.get(id)?;
                if !opts.accepts(node) {
                    return None;
                }
                let sim = cosine_similarity(vector, v) as f64;
                (sim >= threshold).then(|| ScoredNode {
                    node: node.clone(),
                    score: sim,
                })
            })
            .collect();
        sort_desc(&mut candidates);
        candidates.truncate(opts.limit);
        Ok(candidates)
    }

    async fn search_by_keyword(
        &self,
        text: &str,
        opts: &SearchOptions,
    ) -> Result<Vec<ScoredNode>> {
        let query_lower = text.to_lowercase();
        let terms: Vec<&str> = query_lower.split_whitespace().collect();
        if terms.is_empty() {
            return Ok(Vec::new());
        }
        let nodes = self.nodes.read().map_err(|_| anyhow!("node map poisoned"))?;
        let mut candidates: Vec<ScoredNode> = nodes
            .values()
            .filter(|node| opts.accepts(node))
            .filter_map(|node| {
                let text_lower = node.text.to_lowercase();
                let matches = terms.iter().filter(|t| text_lower.contains(*t)).count();
                (matches > 0).then(|| ScoredNode {
                    node: node.clone(),
                    score: matches as f64,
                })
            })
            .collect();
        sort_desc(&mut candidates);
        candidates.truncate(opts.limit);
        Ok(candidates)
    }

    async fn get_node(&self, id: &str) -> Result<Option<ContentNode>> {
        let nodes = self.nodes.read().map_err(|_| anyhow!("node map poisoned"))?;
        Ok(nodes.get(id).cloned())
    }

    async fn get_embedding(&self, id: &str) -> Result<Option<Vec<f32>>> {
        let vectors = self.vectors.read().map_err(|_| anyhow!("vector map poisoned"))?;
        Ok(vectors.get(id).cloned())
    }

    async fn query_nodes(&self, filter: &NodeFilter) -> Result<NodePage> {
        let nodes = self.nodes.read().map_err(|_| anyhow!("node map poisoned"))?;
        let order = self.order.read().map_err(|_| anyhow!("order list poisoned"))?;
        let matching: Vec<&ContentNode> = order
            .iter()
            .filter_map(|id| nodes.get(id))
            .filter(|node| filter.matches(node))
            .collect();
        let total = matching.len();
        let limit = filter.limit.unwrap_or(usize::MAX);
        let page = matching
            .into_iter()
            .skip(filter.offset)
            .take(limit)
            .cloned()
            .collect();
        Ok(NodePage { nodes: page, total })
    }

    fn is_available(&self) -> bool {
        self.available.load(AtomicOrdering::SeqCst)
    }
}
