//! Target-aware adapter over the archive store and the optional books store.
//!
//! # Targets
//!
//! | Target | Behavior |
//! |--------|----------|
//! | `archive` | Primary store only |
//! | `books` | Secondary store only, if configured and available; otherwise empty |
//! | `all` | Both stores, tagged, merged by score (desc), truncated to `limit` |
//!
//! Lookups by id (`get_node`, `get_embedding`, ...) with target `all` try
//! the archive first and fall back to books only for ids it does not have.
//!
//! With no books store configured the adapter holds a [`NullStore`], so
//! every `all` call behaves exactly like the matching `archive` call.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use crate::models::{ContentNode, ScoredNode, SearchResult, StoreTag, StoreTarget};

use super::{ContentStore, NodeFilter, NodeLookup, NullStore, SearchOptions};

/// A node tagged with the store it was read from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredNode {
    pub store: StoreTag,
    pub node: ContentNode,
}

/// Result of [`UnifiedStore::query_nodes`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UnifiedNodePage {
    pub nodes: Vec<StoredNode>,
    pub total: usize,
}

/// Unified view over the archive and books stores.
#[derive(Clone)]
pub struct UnifiedStore {
    archive: Arc<dyn ContentStore>,
    books: Arc<dyn ContentStore>,
    books_configured: bool,
}

impl UnifiedStore {
    /// Adapter with only the archive store; books queries return nothing.
    pub fn new(archive: Arc<dyn ContentStore>) -> Self {
        Self {
            archive,
            books: Arc::new(NullStore),
            books_configured: false,
        }
    }

    /// Adapter over both stores.
    pub fn with_books(archive: Arc<dyn ContentStore>, books: Arc<dyn ContentStore>) -> Self {
        Self {
            archive,
            books,
            books_configured: true,
        }
    }

    /// True when a books store is configured and reports itself available.
    pub fn has_books_store(&self) -> bool {
        self.books_configured && self.books.is_available()
    }

    /// True when `target` asks for a configured books store that is
    /// currently unavailable, so results come from the archive alone.
    pub fn is_degraded(&self, target: StoreTarget) -> bool {
        target.includes_books() && self.books_configured && !self.books.is_available()
    }

    /// Stores addressed by `target`, in query priority order.
    fn stores_for(&self, target: StoreTarget) -> Vec<(StoreTag, &dyn ContentStore)> {
        let mut stores: Vec<(StoreTag, &dyn ContentStore)> = Vec::with_capacity(2);
        if target.includes_archive() {
            stores.push((StoreTag::Archive, self.archive.as_ref()));
        }
        if target.includes_books() && self.has_books_store() {
            stores.push((StoreTag::Books, self.books.as_ref()));
        }
        stores
    }

    pub async fn search_by_embedding(
        &self,
        vector: &[f32],
        opts: &SearchOptions,
        target: StoreTarget,
    ) -> Result<Vec<SearchResult>> {
        let mut merged = Vec::new();
        for (tag, store) in self.stores_for(target) {
            let hits = store.search_by_embedding(vector, opts).await?;
            tracing::debug!(store = %tag, hits = hits.len(), "dense search");
            merged.extend(tag_all(hits, tag));
        }
        Ok(merge_by_score(merged, opts.limit))
    }

    pub async fn search_by_keyword(
        &self,
        text: &str,
        opts: &SearchOptions,
        target: StoreTarget,
    ) -> Result<Vec<SearchResult>> {
        let mut merged = Vec::new();
        for (tag, store) in self.stores_for(target) {
            let hits = store.search_by_keyword(text, opts).await?;
            tracing::debug!(store = %tag, hits = hits.len(), "sparse search");
            merged.extend(tag_all(hits, tag));
        }
        Ok(merge_by_score(merged, opts.limit))
    }

    /// Filtered listing. Totals are summed across the addressed stores;
    /// `filter.limit` bounds the concatenated page.
    pub async fn query_nodes(
        &self,
        filter: &NodeFilter,
        target: StoreTarget,
    ) -> Result<UnifiedNodePage> {
        let mut page = UnifiedNodePage::default();
        for (tag, store) in self.stores_for(target) {
            let part = store.query_nodes(filter).await?;
            page.total += part.total;
            page.nodes.extend(part.nodes.into_iter().map(|node| StoredNode { store: tag, node }));
        }
        if let Some(limit) = filter.limit {
            page.nodes.truncate(limit);
        }
        Ok(page)
    }

    pub async fn get_node(&self, id: &str, target: StoreTarget) -> Result<Option<StoredNode>> {
        for (tag, store) in self.stores_for(target) {
            if let Some(node) = store.get_node(id).await? {
                return Ok(Some(StoredNode { store: tag, node }));
            }
        }
        Ok(None)
    }

    /// Fetch many nodes, in `ids` order, skipping unknown ids.
    pub async fn get_nodes(&self, ids: &[String], target: StoreTarget) -> Result<Vec<StoredNode>> {
        let mut found: HashMap<&str, StoredNode> = HashMap::new();
        for (tag, store) in self.stores_for(target) {
            for id in ids {
                if found.contains_key(id.as_str()) {
                    continue;
                }
                if let Some(node) = store.get_node(id).await? {
                    found.insert(id.as_str(), StoredNode { store: tag, node });
                }
            }
        }
        let mut seen = HashSet::new();
        Ok(ids
            .iter()
            .filter(|id| seen.insert(id.as_str()))
            .filter_map(|id| found.remove(id.as_str()))
            .collect())
    }

    pub async fn get_embedding(&self, id: &str, target: StoreTarget) -> Result<Option<Vec<f32>>> {
        for (_, store) in self.stores_for(target) {
            if let Some(v) = store.get_embedding(id).await? {
                return Ok(Some(v));
            }
        }
        Ok(None)
    }

    /// Fetch stored vectors for `ids`. Ids without a vector are absent.
    pub async fn get_embeddings(
        &self,
        ids: &[String],
        target: StoreTarget,
    ) -> Result<HashMap<String, Vec<f32>>> {
        let mut found: HashMap<String, Vec<f32>> = HashMap::new();
        for (_, store) in self.stores_for(target) {
            for id in ids {
                if found.contains_key(id) {
                    continue;
                }
                if let Some(v) = store.get_embedding(id).await? {
                    found.insert(id.clone(), v);
                }
            }
        }
        Ok(found)
    }
}

#[async_trait]
impl NodeLookup for UnifiedStore {
    async fn lookup_node(&self, id: &str) -> Result<Option<ContentNode>> {
        Ok(self.get_node(id, StoreTarget::All).await?.map(|s| s.node))
    }
}

fn tag_all(hits: Vec<ScoredNode>, tag: StoreTag) -> impl Iterator<Item = SearchResult> {
    hits.into_iter().map(move |h| SearchResult::from_scored(h, tag))
}

/// Stable sort by score (desc) so archive hits win ties, then truncate.
fn merge_by_score(mut results: Vec<SearchResult>, limit: usize) -> Vec<SearchResult> {
    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    results.truncate(limit);
    results
}
