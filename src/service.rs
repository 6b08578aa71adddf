//! Retrieval service: the `search` / `refine` / anchor / session surface.
//!
//! # Pipeline
//!
//! ```text
//! snapshot session ─▶ embed query ─▶ dense ∥ sparse ─▶ fuse ─▶ drop excluded
//!     ─▶ anchor rerank ─▶ quality gate ─▶ pinned carry-over ─▶ truncate ─▶ commit
//! ```
//!
//! Every upstream call (embedding, store queries, embedding lookups,
//! parent fetches) runs under a per-call timeout and races the caller's
//! [`CancellationToken`]. The session is written exactly once, after all
//! I/O has finished, so a cancelled, timed-out or failed request leaves it
//! untouched. Dropping the returned future has the same effect.
//!
//! Session results keep the fused score from before anchor adjustment, so
//! refining the same set twice does not apply the anchors twice. Candidates
//! the store holds no vector for are embedded before anchor scoring.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use archive_retrieval_core::anchors::{rerank, AnchorConfig, AnchorPolarity, SemanticAnchor};
use archive_retrieval_core::embedding::Embedder;
use archive_retrieval_core::fusion::{fuse_results, FusedResult, FusionParams};
use archive_retrieval_core::models::{ContentNode, SearchResult, StoreTarget};
use archive_retrieval_core::quality::{
    apply_gate, quality_score, EnrichedResult, GateStats, QualityGateConfig, QualityIndicators,
};
use archive_retrieval_core::store::unified::{StoredNode, UnifiedStore};
use archive_retrieval_core::store::{NodeLookup, SearchOptions as StoreSearchOptions};
use archive_retrieval_core::RetrievalError;

use crate::config::Config;
use crate::session::{
    HistoryKind, SearchCommit, SearchHistoryEntry, SearchSession, SessionManager,
};

/// Per-call options for [`RetrievalService::search`]. Unset fields fall
/// back to the `[retrieval]` configuration.
#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub target: StoreTarget,
    pub limit: Option<usize>,
    /// Minimum dense similarity.
    pub threshold: Option<f64>,
    pub dense_weight: Option<f64>,
    pub sparse_weight: Option<f64>,
    pub source_type: Option<String>,
    pub hierarchy_level: Option<u32>,
    /// Bound on each upstream call.
    pub timeout: Option<Duration>,
    pub cancel: Option<CancellationToken>,
}

/// Options for [`RetrievalService::refine`].
///
/// With a `query` the search pipeline runs again; without one the
/// session's current results are re-ranked in place.
#[derive(Debug, Clone, Default)]
pub struct RefineOptions {
    pub query: Option<String>,
    pub min_score: Option<f64>,
    pub min_word_count: Option<usize>,
    pub limit: Option<usize>,
    pub target: Option<StoreTarget>,
    pub timeout: Option<Duration>,
    pub cancel: Option<CancellationToken>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SearchStats {
    pub query: Option<String>,
    pub target: StoreTarget,
    pub dense_candidates: usize,
    pub sparse_candidates: usize,
    pub fused_count: usize,
    pub excluded_count: usize,
    pub anchor_filtered: usize,
    pub anchor_adjusted: usize,
    /// Candidates embedded on demand for anchor scoring.
    pub anchor_embedded: usize,
    pub gate: GateStats,
    pub pinned_carried: usize,
    pub returned: usize,
    /// The books store was requested but unavailable.
    pub degraded: bool,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub session_id: String,
    pub results: Vec<EnrichedResult>,
    pub stats: SearchStats,
}

/// A failed search or refine, with what is known about the attempt.
#[derive(Debug, thiserror::Error)]
#[error("search failed after {elapsed_ms}ms: {error}")]
pub struct SearchFailure {
    pub session_id: String,
    pub query: Option<String>,
    pub elapsed_ms: u64,
    #[source]
    pub error: RetrievalError,
}

/// Timeout and cancellation applied to every upstream call of a request.
#[derive(Debug, Clone)]
struct Deadline {
    per_call: Duration,
    cancel: CancellationToken,
}

impl Deadline {
    fn new(per_call: Duration, cancel: Option<CancellationToken>) -> Self {
        Self {
            per_call,
            cancel: cancel.unwrap_or_default(),
        }
    }

    fn check(&self) -> Result<(), RetrievalError> {
        if self.cancel.is_cancelled() {
            return Err(RetrievalError::Cancelled);
        }
        Ok(())
    }

    async fn run<T, F>(&self, operation: &'static str, fut: F) -> Result<T, RetrievalError>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        self.check()?;
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(RetrievalError::Cancelled),
            res = tokio::time::timeout(self.per_call, fut) => match res {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(RetrievalError::upstream(operation, e)),
                Err(_) => Err(RetrievalError::Timeout {
                    operation,
                    after_ms: self.per_call.as_millis() as u64,
                }),
            },
        }
    }
}

/// Parent lookup for the quality gate, bounded by the request's deadline.
struct GuardedLookup<'a> {
    store: &'a UnifiedStore,
    deadline: &'a Deadline,
}

#[async_trait]
impl<'a> NodeLookup for GuardedLookup<'a> {
    async fn lookup_node(&self, id: &str) -> Result<Option<ContentNode>> {
        Ok(self
            .deadline
            .run("parent fetch", self.store.lookup_node(id))
            .await?)
    }
}

/// Everything one pipeline run needs besides the candidates.
struct Pass<'a> {
    session: &'a SearchSession,
    gate: QualityGateConfig,
    min_score: Option<f64>,
    limit: usize,
    deadline: &'a Deadline,
}

struct Ranked {
    results: Vec<EnrichedResult>,
    /// Fused scores before anchor adjustment, keyed by id.
    base_scores: HashMap<String, f64>,
}

pub struct RetrievalService {
    config: Config,
    fusion: FusionParams,
    anchors: AnchorConfig,
    store: UnifiedStore,
    embedder: Arc<dyn Embedder>,
    sessions: Arc<SessionManager>,
}

impl RetrievalService {
    pub fn new(
        config: Config,
        store: UnifiedStore,
        embedder: Arc<dyn Embedder>,
        sessions: Arc<SessionManager>,
    ) -> Result<Self> {
        config.validate()?;
        let fusion = config.retrieval.fusion_params()?;
        let anchors = config.anchors.anchor_config();
        Ok(Self {
            config,
            fusion,
            anchors,
            store,
            embedder,
            sessions,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn store(&self) -> &UnifiedStore {
        &self.store
    }

    /// Run a search and record it on `session_id`.
    ///
    /// An unknown session id is created on commit when
    /// `sessions.create_on_search` is set; otherwise it is `SessionNotFound`.
    pub async fn search(
        &self,
        session_id: &str,
        query: &str,
        opts: SearchOptions,
    ) -> Result<SearchResponse, SearchFailure> {
        let started = Instant::now();
        let deadline = Deadline::new(
            opts.timeout.unwrap_or_else(|| self.config.retrieval.upstream_timeout()),
            opts.cancel.clone(),
        );
        let outcome = async {
            let (session, is_new) = self.snapshot_for_search(session_id)?;
            let fusion = self.fusion_for(&opts)?;
            let limit = self.limit_for(opts.limit)?;
            let pass = Pass {
                session: &session,
                gate: self.config.quality.gate_config(),
                min_score: None,
                limit,
                deadline: &deadline,
            };
            let store_opts = StoreSearchOptions {
                limit: limit.saturating_mul(self.config.retrieval.candidate_multiplier),
                threshold: Some(
                    opts.threshold
                        .unwrap_or(self.config.retrieval.relevance_threshold),
                ),
                source_type: opts.source_type.clone(),
                hierarchy_level: opts.hierarchy_level,
            };
            let mut stats = SearchStats {
                query: Some(query.to_string()),
                target: opts.target,
                ..Default::default()
            };
            let candidates = self
                .retrieve(query, opts.target, &store_opts, &fusion, &deadline, &mut stats)
                .await?;
            let ranked = self.rank(candidates, &pass, &mut stats).await?;

            deadline.check()?;
            let entry = SearchHistoryEntry {
                query: Some(query.to_string()),
                timestamp: Utc::now(),
                result_count: ranked.results.len(),
                target: opts.target,
                kind: HistoryKind::Search,
                min_score: None,
                min_word_count: None,
            };
            self.commit(session_id, is_new, &ranked, entry)?;
            stats.elapsed_ms = started.elapsed().as_millis() as u64;
            Ok::<_, RetrievalError>(SearchResponse {
                session_id: session_id.to_string(),
                results: ranked.results,
                stats,
            })
        }
        .await;

        self.finish(session_id, Some(query), started, outcome)
    }

    /// Narrow or re-rank a session's results.
    pub async fn refine(
        &self,
        session_id: &str,
        opts: RefineOptions,
    ) -> Result<SearchResponse, SearchFailure> {
        let started = Instant::now();
        let deadline = Deadline::new(
            opts.timeout.unwrap_or_else(|| self.config.retrieval.upstream_timeout()),
            opts.cancel.clone(),
        );
        let outcome = async {
            let session = self
                .sessions
                .get_session(session_id)
                .ok_or_else(|| RetrievalError::SessionNotFound(session_id.to_string()))?;
            if let Some(min) = opts.min_score {
                if !min.is_finite() {
                    return Err(RetrievalError::Validation(
                        "min_score must be finite".to_string(),
                    ));
                }
            }
            let target = opts
                .target
                .or_else(|| session.history.last().map(|e| e.target))
                .unwrap_or_default();
            let limit = self.limit_for(opts.limit)?;
            let mut gate = self.config.quality.gate_config();
            if let Some(words) = opts.min_word_count {
                gate.min_word_count = words;
            }
            let pass = Pass {
                session: &session,
                gate,
                min_score: opts.min_score,
                limit,
                deadline: &deadline,
            };
            let mut stats = SearchStats {
                query: opts.query.clone(),
                target,
                ..Default::default()
            };

            let candidates = match opts.query.as_deref() {
                Some(query) => {
                    let store_opts = StoreSearchOptions {
                        limit: limit.saturating_mul(self.config.retrieval.candidate_multiplier),
                        threshold: Some(self.config.retrieval.relevance_threshold),
                        source_type: None,
                        hierarchy_level: None,
                    };
                    self.retrieve(query, target, &store_opts, &self.fusion, &deadline, &mut stats)
                        .await?
                }
                None => {
                    let carried: Vec<FusedResult> = session
                        .results
                        .iter()
                        .cloned()
                        .map(FusedResult::carried)
                        .collect();
                    stats.fused_count = carried.len();
                    carried
                }
            };
            let ranked = self.rank(candidates, &pass, &mut stats).await?;

            deadline.check()?;
            let entry = SearchHistoryEntry {
                query: opts.query.clone(),
                timestamp: Utc::now(),
                result_count: ranked.results.len(),
                target,
                kind: HistoryKind::Refine,
                min_score: opts.min_score,
                min_word_count: opts.min_word_count,
            };
            self.commit(session_id, false, &ranked, entry)?;
            stats.elapsed_ms = started.elapsed().as_millis() as u64;
            Ok::<_, RetrievalError>(SearchResponse {
                session_id: session_id.to_string(),
                results: ranked.results,
                stats,
            })
        }
        .await;

        self.finish(session_id, opts.query.as_deref(), started, outcome)
    }

    /// Turn one of the session's current results into an anchor.
    ///
    /// The vector comes from the store when it has one, otherwise the
    /// result text is embedded on demand.
    pub async fn add_anchor(
        &self,
        session_id: &str,
        result_id: &str,
        polarity: AnchorPolarity,
    ) -> Result<SemanticAnchor, RetrievalError> {
        let session = self
            .sessions
            .get_session(session_id)
            .ok_or_else(|| RetrievalError::SessionNotFound(session_id.to_string()))?;
        let result = session
            .find_result(result_id)
            .ok_or_else(|| RetrievalError::ResultNotInSession {
                session_id: session_id.to_string(),
                result_id: result_id.to_string(),
            })?;

        let deadline = Deadline::new(self.config.retrieval.upstream_timeout(), None);
        let stored = deadline
            .run(
                "fetch embedding",
                self.store.get_embedding(result_id, result.source.into()),
            )
            .await?;
        let embedding = match stored {
            Some(v) => v,
            None => {
                tracing::debug!(result_id, "no stored vector, embedding anchor text");
                deadline
                    .run("embed anchor", self.embedder.embed(&result.node.text))
                    .await?
            }
        };

        let anchor = SemanticAnchor::new(
            result_id,
            result.source,
            polarity,
            embedding,
            &result.node.text,
            Utc::now(),
        );
        self.sessions.add_anchor(session_id, anchor.clone())?;
        tracing::info!(session_id, result_id, %polarity, "anchor added");
        Ok(anchor)
    }

    pub fn remove_anchor(&self, session_id: &str, anchor_id: &str) -> Result<bool, RetrievalError> {
        self.sessions.remove_anchor(session_id, anchor_id)
    }

    pub fn exclude(&self, session_id: &str, ids: &[String]) -> Result<usize, RetrievalError> {
        self.sessions.exclude_results(session_id, ids)
    }

    pub fn pin(&self, session_id: &str, ids: &[String]) -> Result<usize, RetrievalError> {
        self.sessions.pin_results(session_id, ids)
    }

    pub fn create_session(&self, name: Option<String>) -> SearchSession {
        match name {
            Some(name) => self.sessions.create_session_named(name),
            None => self.sessions.create_session(),
        }
    }

    pub fn get_session(&self, session_id: &str) -> Result<SearchSession, RetrievalError> {
        self.sessions
            .get_session(session_id)
            .ok_or_else(|| RetrievalError::SessionNotFound(session_id.to_string()))
    }

    pub fn delete_session(&self, session_id: &str) -> bool {
        self.sessions.delete_session(session_id)
    }

    pub fn list_sessions(&self) -> Vec<SearchSession> {
        self.sessions.list_sessions()
    }

    /// Fetch one node directly, archive first for [`StoreTarget::All`].
    pub async fn get_node(&self, id: &str, target: StoreTarget) -> Result<StoredNode, RetrievalError> {
        let deadline = Deadline::new(self.config.retrieval.upstream_timeout(), None);
        deadline
            .run("fetch node", self.store.get_node(id, target))
            .await?
            .ok_or_else(|| RetrievalError::NodeNotFound(id.to_string()))
    }

    fn snapshot_for_search(&self, session_id: &str) -> Result<(SearchSession, bool), RetrievalError> {
        if let Some(session) = self.sessions.get_session(session_id) {
            return Ok((session, false));
        }
        if !self.config.sessions.create_on_search || session_id.trim().is_empty() {
            return Err(RetrievalError::SessionNotFound(session_id.to_string()));
        }
        // Not stored until commit.
        let blank = SearchSession::new(session_id, Utc::now(), self.config.sessions.timeout());
        Ok((blank, true))
    }

    fn fusion_for(&self, opts: &SearchOptions) -> Result<FusionParams, RetrievalError> {
        if opts.dense_weight.is_none() && opts.sparse_weight.is_none() {
            return Ok(self.fusion);
        }
        FusionParams::new(
            opts.dense_weight.unwrap_or(self.fusion.dense_weight()),
            opts.sparse_weight.unwrap_or(self.fusion.sparse_weight()),
            self.fusion.k(),
        )
    }

    fn limit_for(&self, requested: Option<usize>) -> Result<usize, RetrievalError> {
        match requested.unwrap_or(self.config.retrieval.result_limit) {
            0 => Err(RetrievalError::Validation("limit must be >= 1".to_string())),
            n => Ok(n),
        }
    }

    /// Embed, query both modalities concurrently, and fuse.
    async fn retrieve(
        &self,
        query: &str,
        target: StoreTarget,
        store_opts: &StoreSearchOptions,
        fusion: &FusionParams,
        deadline: &Deadline,
        stats: &mut SearchStats,
    ) -> Result<Vec<FusedResult>, RetrievalError> {
        if query.trim().is_empty() {
            return Err(RetrievalError::Validation("query must not be empty".to_string()));
        }
        let vector = deadline.run("embed query", self.embedder.embed(query)).await?;

        let (dense, sparse) = tokio::try_join!(
            deadline.run(
                "dense search",
                self.store.search_by_embedding(&vector, store_opts, target)
            ),
            deadline.run(
                "sparse search",
                self.store.search_by_keyword(query, store_opts, target)
            ),
        )?;

        stats.degraded = self.store.is_degraded(target);
        if stats.degraded {
            tracing::warn!(%target, "books store unavailable, searching archive only");
        }
        stats.dense_candidates = dense.len();
        stats.sparse_candidates = sparse.len();

        let fused = fuse_results(dense, sparse, fusion);
        stats.fused_count = fused.len();
        tracing::debug!(
            dense = stats.dense_candidates,
            sparse = stats.sparse_candidates,
            fused = stats.fused_count,
            "fused candidates"
        );
        Ok(fused)
    }

    /// Exclusions, anchors, gate, min score, pins and truncation.
    async fn rank(
        &self,
        mut candidates: Vec<FusedResult>,
        pass: &Pass<'_>,
        stats: &mut SearchStats,
    ) -> Result<Ranked, RetrievalError> {
        let session = pass.session;

        let before = candidates.len();
        candidates.retain(|r| !session.excluded_ids.contains(r.id()));
        stats.excluded_count = before - candidates.len();

        let base_scores: HashMap<String, f64> = candidates
            .iter()
            .map(|r| (r.id().to_string(), r.score()))
            .collect();

        let candidates = if session.anchor_count() > 0 && !candidates.is_empty() {
            let ids: Vec<String> = candidates.iter().map(|r| r.id().to_string()).collect();
            let mut embeddings = pass
                .deadline
                .run(
                    "fetch embeddings",
                    self.store.get_embeddings(&ids, StoreTarget::All),
                )
                .await?;
            // Keyword-only hits have no stored vector; embed their text so the
            // negative filter still sees them.
            for candidate in &candidates {
                if embeddings.contains_key(candidate.id()) {
                    continue;
                }
                let vector = pass
                    .deadline
                    .run("embed result", self.embedder.embed(&candidate.result.node.text))
                    .await?;
                embeddings.insert(candidate.id().to_string(), vector);
                stats.anchor_embedded += 1;
            }
            let outcome = rerank(
                candidates,
                &embeddings,
                &session.positive_anchors,
                &session.negative_anchors,
                &self.anchors,
            );
            stats.anchor_filtered = outcome.filtered_by_negative;
            stats.anchor_adjusted = outcome.adjusted;
            outcome.results
        } else {
            candidates
        };

        let lookup = GuardedLookup {
            store: &self.store,
            deadline: pass.deadline,
        };
        let gated = apply_gate(candidates, &lookup, &pass.gate).await;
        stats.gate = gated.stats;
        let mut results = gated.results;

        if let Some(min) = pass.min_score {
            results.retain(|r| r.score() >= min);
        }

        let pinned_carried = carry_pinned(&mut results, session, &pass.gate);
        stats.pinned_carried = pinned_carried;
        results.truncate(pass.limit);
        stats.returned = results.len();

        Ok(Ranked {
            results,
            base_scores,
        })
    }

    fn commit(
        &self,
        session_id: &str,
        is_new: bool,
        ranked: &Ranked,
        entry: SearchHistoryEntry,
    ) -> Result<(), RetrievalError> {
        if is_new {
            self.sessions.create_session_with_id(session_id)?;
        }
        let results: Vec<SearchResult> = ranked
            .results
            .iter()
            .map(|r| {
                let mut result = r.fused.result.clone();
                if let Some(base) = ranked.base_scores.get(&result.id) {
                    result.score = *base;
                }
                result
            })
            .collect();
        self.sessions
            .commit_search(session_id, SearchCommit { results, entry })?;
        Ok(())
    }

    fn finish(
        &self,
        session_id: &str,
        query: Option<&str>,
        started: Instant,
        outcome: Result<SearchResponse, RetrievalError>,
    ) -> Result<SearchResponse, SearchFailure> {
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(response) => {
                tracing::debug!(
                    session_id,
                    returned = response.stats.returned,
                    elapsed_ms,
                    "search complete"
                );
                Ok(response)
            }
            Err(error) => {
                tracing::warn!(session_id, elapsed_ms, error = %error, "search failed");
                Err(SearchFailure {
                    session_id: session_id.to_string(),
                    query: query.map(str::to_string),
                    elapsed_ms,
                    error,
                })
            }
        }
    }
}

/// Move pinned results to the front, bringing back pinned results from
/// the session that the current pass did not return. Returns how many
/// were brought back.
fn carry_pinned(
    results: &mut Vec<EnrichedResult>,
    session: &SearchSession,
    gate: &QualityGateConfig,
) -> usize {
    if session.pinned_ids.is_empty() {
        return 0;
    }
    let (mut pinned, rest): (Vec<_>, Vec<_>) = std::mem::take(results)
        .into_iter()
        .partition(|r| session.pinned_ids.contains(r.id()));

    let mut carried = 0;
    for result in &session.results {
        if !session.pinned_ids.contains(&result.id) || pinned.iter().any(|p| p.id() == result.id) {
            continue;
        }
        let score = quality_score(&result.node);
        pinned.push(EnrichedResult {
            fused: FusedResult::carried(result.clone()),
            context_expanded: false,
            parent_node: None,
            context_text: None,
            quality_score: score,
            indicators: QualityIndicators::evaluate(&result.node, score, gate),
        });
        carried += 1;
    }

    pinned.extend(rest);
    *results = pinned;
    carried
}
