//! Search sessions: per-user refinement state with LRU + TTL eviction.
//!
//! A [`SearchSession`] holds the current result set, the query history and
//! the user's feedback (anchors, exclusions, pins). Sessions live in a
//! [`SessionManager`] backed by a `DashMap`, so writes to one session are
//! serialized by its shard lock while other sessions proceed in parallel.
//!
//! # Lifecycle
//!
//! ```text
//! create ──▶ active ──(now > expires_at)──▶ expired ──▶ removed
//!              │                                     (lazy on access, or sweep)
//!              └──(delete / LRU eviction)──▶ removed
//! ```
//!
//! Every mutation "touches" the session: `updated_at` moves forward and
//! `expires_at = updated_at + timeout`. Reads never touch.
//!
//! The manager never holds a session lock across I/O. Callers take a
//! snapshot with [`SessionManager::get_session`], do their work, and
//! commit with a single mutator call.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use uuid::Uuid;

use archive_retrieval_core::anchors::{AnchorPolarity, SemanticAnchor};
use archive_retrieval_core::models::{SearchResult, StoreTarget};
use archive_retrieval_core::RetrievalError;

use crate::clock::{Clock, SystemClock};
use crate::config::SessionConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryKind {
    Search,
    Refine,
}

/// One search or refine call recorded on a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHistoryEntry {
    /// `None` for a refine that re-ranked the current results.
    pub query: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub result_count: usize,
    pub target: StoreTarget,
    pub kind: HistoryKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_word_count: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub search_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_query: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchSession {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub results: Vec<SearchResult>,
    pub history: Vec<SearchHistoryEntry>,
    pub positive_anchors: Vec<SemanticAnchor>,
    pub negative_anchors: Vec<SemanticAnchor>,
    pub excluded_ids: BTreeSet<String>,
    pub pinned_ids: BTreeSet<String>,
    pub metadata: SessionMetadata,
}

impl SearchSession {
    pub fn new(id: impl Into<String>, now: DateTime<Utc>, timeout: Duration) -> Self {
        Self {
            id: id.into(),
            name: None,
            notes: None,
            results: Vec::new(),
            history: Vec::new(),
            positive_anchors: Vec::new(),
            negative_anchors: Vec::new(),
            excluded_ids: BTreeSet::new(),
            pinned_ids: BTreeSet::new(),
            metadata: SessionMetadata {
                created_at: now,
                updated_at: now,
                expires_at: expiry(now, timeout),
                search_count: 0,
                last_query: None,
            },
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.metadata.expires_at
    }

    /// Advance `updated_at` (strictly) and extend the expiry.
    pub fn touch(&mut self, now: DateTime<Utc>, timeout: Duration) {
        let next = if now > self.metadata.updated_at {
            now
        } else {
            expiry(self.metadata.updated_at, Duration::milliseconds(1))
        };
        self.metadata.updated_at = next;
        self.metadata.expires_at = expiry(next, timeout);
    }

    /// Exclude `ids`, skipping pinned ones. Returns how many were added.
    pub fn exclude<I, S>(&mut self, ids: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut added = 0;
        for id in ids {
            let id = id.into();
            if self.pinned_ids.contains(&id) {
                continue;
            }
            if self.excluded_ids.insert(id) {
                added += 1;
            }
        }
        added
    }

    pub fn unexclude<I, S>(&mut self, ids: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        ids.into_iter()
            .filter(|id| self.excluded_ids.remove(id.as_ref()))
            .count()
    }

    /// Pin `ids`, lifting any exclusion on them. Returns how many were added.
    pub fn pin<I, S>(&mut self, ids: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut added = 0;
        for id in ids {
            let id = id.into();
            self.excluded_ids.remove(&id);
            if self.pinned_ids.insert(id) {
                added += 1;
            }
        }
        added
    }

    pub fn unpin<I, S>(&mut self, ids: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        ids.into_iter()
            .filter(|id| self.pinned_ids.remove(id.as_ref()))
            .count()
    }

    /// Add an anchor. An existing anchor with the same id is replaced,
    /// whichever list it was in.
    pub fn add_anchor(&mut self, anchor: SemanticAnchor) {
        self.remove_anchor(&anchor.id);
        match anchor.polarity {
            AnchorPolarity::Positive => self.positive_anchors.push(anchor),
            AnchorPolarity::Negative => self.negative_anchors.push(anchor),
        }
    }

    /// Remove the anchor with `id` from both lists.
    pub fn remove_anchor(&mut self, id: &str) -> bool {
        let before = self.positive_anchors.len() + self.negative_anchors.len();
        self.positive_anchors.retain(|a| a.id != id);
        self.negative_anchors.retain(|a| a.id != id);
        before != self.positive_anchors.len() + self.negative_anchors.len()
    }

    /// Append to history, dropping the oldest entries beyond `max_entries`.
    pub fn push_history(&mut self, entry: SearchHistoryEntry, max_entries: usize) {
        self.history.push(entry);
        if self.history.len() > max_entries {
            let overflow = self.history.len() - max_entries;
            self.history.drain(..overflow);
        }
    }

    /// Merge `results` into the current set, replacing entries with the
    /// same id in place.
    pub fn add_results(&mut self, results: Vec<SearchResult>) {
        for result in results {
            match self.results.iter_mut().find(|r| r.id == result.id) {
                Some(existing) => *existing = result,
                None => self.results.push(result),
            }
        }
    }

    pub fn find_result(&self, id: &str) -> Option<&SearchResult> {
        self.results.iter().find(|r| r.id == id)
    }

    pub fn anchor_count(&self) -> usize {
        self.positive_anchors.len() + self.negative_anchors.len()
    }
}

/// `at + timeout`, saturating at the latest representable instant.
fn expiry(at: DateTime<Utc>, timeout: Duration) -> DateTime<Utc> {
    at.checked_add_signed(timeout)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// The write a finished search or refine makes to its session.
#[derive(Debug, Clone)]
pub struct SearchCommit {
    pub results: Vec<SearchResult>,
    pub entry: SearchHistoryEntry,
}

/// Concurrent session store with capacity and TTL eviction.
pub struct SessionManager {
    sessions: DashMap<String, SearchSession>,
    /// Serializes creation so capacity checks and eviction are atomic.
    create_lock: Mutex<()>,
    config: SessionConfig,
    clock: Arc<dyn Clock>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl SessionManager {
    pub fn new(config: SessionConfig) -> anyhow::Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Fails if `config` is out of range.
    pub fn with_clock(config: SessionConfig, clock: Arc<dyn Clock>) -> anyhow::Result<Self> {
        config.validate()?;
        Ok(Self {
            sessions: DashMap::new(),
            create_lock: Mutex::new(()),
            config,
            clock,
            sweeper: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Create a session with a random id.
    pub fn create_session(&self) -> SearchSession {
        self.insert_new(Uuid::new_v4().to_string(), None)
    }

    pub fn create_session_named(&self, name: impl Into<String>) -> SearchSession {
        self.insert_new(Uuid::new_v4().to_string(), Some(name.into()))
    }

    /// Create a session under a caller-chosen id.
    ///
    /// A live session with that id is returned unchanged; an expired one is
    /// replaced.
    pub fn create_session_with_id(&self, id: &str) -> Result<SearchSession, RetrievalError> {
        if id.trim().is_empty() {
            return Err(RetrievalError::Validation(
                "session id must not be empty".to_string(),
            ));
        }
        if let Some(existing) = self.get_session(id) {
            return Ok(existing);
        }
        Ok(self.insert_new(id.to_string(), None))
    }

    fn insert_new(&self, id: String, name: Option<String>) -> SearchSession {
        let _guard = self.create_lock.lock().unwrap_or_else(|e| e.into_inner());
        let now = self.clock.now();

        if let Some(existing) = self.sessions.get(&id) {
            if !existing.is_expired(now) {
                return existing.clone();
            }
        }
        self.sessions.remove(&id);

        if self.sessions.len() >= self.config.max_sessions {
            self.purge_expired(now);
        }
        while self.sessions.len() >= self.config.max_sessions {
            let Some(oldest) = self.oldest_session_id() else {
                break;
            };
            self.sessions.remove(&oldest);
            tracing::info!(session_id = %oldest, "evicted least recently updated session");
        }

        let mut session = SearchSession::new(id.clone(), now, self.config.timeout());
        session.name = name;
        self.sessions.insert(id, session.clone());
        tracing::info!(session_id = %session.id, "created session");
        session
    }

    fn oldest_session_id(&self) -> Option<String> {
        self.sessions
            .iter()
            .min_by(|a, b| {
                a.metadata
                    .updated_at
                    .cmp(&b.metadata.updated_at)
                    .then_with(|| a.key().cmp(b.key()))
            })
            .map(|entry| entry.key().clone())
    }

    /// Snapshot of a live session. An expired entry is removed.
    pub fn get_session(&self, id: &str) -> Option<SearchSession> {
        let now = self.clock.now();
        if self
            .sessions
            .remove_if(id, |_, s| s.is_expired(now))
            .is_some()
        {
            tracing::debug!(session_id = %id, "session expired on access");
            return None;
        }
        self.sessions.get(id).map(|s| s.clone())
    }

    /// Resolve a live session, apply `f`, then touch it.
    fn update<T>(
        &self,
        id: &str,
        f: impl FnOnce(&mut SearchSession) -> T,
    ) -> Result<T, RetrievalError> {
        let now = self.clock.now();
        let not_found = || RetrievalError::SessionNotFound(id.to_string());
        {
            let mut session = self.sessions.get_mut(id).ok_or_else(not_found)?;
            if !session.is_expired(now) {
                let out = f(&mut session);
                session.touch(now, self.config.timeout());
                return Ok(out);
            }
        }
        self.sessions.remove_if(id, |_, s| s.is_expired(now));
        Err(not_found())
    }

    pub fn add_results(&self, id: &str, results: Vec<SearchResult>) -> Result<(), RetrievalError> {
        self.update(id, |s| s.add_results(results))
    }

    pub fn set_results(&self, id: &str, results: Vec<SearchResult>) -> Result<(), RetrievalError> {
        self.update(id, |s| s.results = results)
    }

    pub fn add_history_entry(
        &self,
        id: &str,
        entry: SearchHistoryEntry,
    ) -> Result<(), RetrievalError> {
        let max = self.config.max_history_entries;
        self.update(id, |s| s.push_history(entry, max))
    }

    pub fn add_positive_anchor(
        &self,
        id: &str,
        mut anchor: SemanticAnchor,
    ) -> Result<(), RetrievalError> {
        anchor.polarity = AnchorPolarity::Positive;
        self.update(id, |s| s.add_anchor(anchor))
    }

    pub fn add_negative_anchor(
        &self,
        id: &str,
        mut anchor: SemanticAnchor,
    ) -> Result<(), RetrievalError> {
        anchor.polarity = AnchorPolarity::Negative;
        self.update(id, |s| s.add_anchor(anchor))
    }

    /// Store `anchor` under its own polarity.
    pub fn add_anchor(&self, id: &str, anchor: SemanticAnchor) -> Result<(), RetrievalError> {
        self.update(id, |s| s.add_anchor(anchor))
    }

    pub fn remove_anchor(&self, id: &str, anchor_id: &str) -> Result<bool, RetrievalError> {
        self.update(id, |s| s.remove_anchor(anchor_id))
    }

    /// Exclude result ids. Pinned ids are skipped.
    pub fn exclude_results(&self, id: &str, ids: &[String]) -> Result<usize, RetrievalError> {
        self.update(id, |s| s.exclude(ids.iter().cloned()))
    }

    pub fn unexclude_results(&self, id: &str, ids: &[String]) -> Result<usize, RetrievalError> {
        self.update(id, |s| s.unexclude(ids))
    }

    /// Pin result ids, removing them from the exclusion set.
    pub fn pin_results(&self, id: &str, ids: &[String]) -> Result<usize, RetrievalError> {
        self.update(id, |s| s.pin(ids.iter().cloned()))
    }

    pub fn unpin_results(&self, id: &str, ids: &[String]) -> Result<usize, RetrievalError> {
        self.update(id, |s| s.unpin(ids))
    }

    pub fn rename_session(&self, id: &str, name: Option<String>) -> Result<(), RetrievalError> {
        self.update(id, |s| s.name = name)
    }

    pub fn set_notes(&self, id: &str, notes: Option<String>) -> Result<(), RetrievalError> {
        self.update(id, |s| s.notes = notes)
    }

    /// Replace the results and record the history entry in one write.
    pub fn commit_search(
        &self,
        id: &str,
        commit: SearchCommit,
    ) -> Result<SearchSession, RetrievalError> {
        let max = self.config.max_history_entries;
        self.update(id, |s| {
            if let Some(query) = &commit.entry.query {
                s.metadata.search_count += 1;
                s.metadata.last_query = Some(query.clone());
            }
            s.results = commit.results;
            s.push_history(commit.entry, max);
        })?;
        self.sessions
            .get(id)
            .map(|s| s.clone())
            .ok_or_else(|| RetrievalError::SessionNotFound(id.to_string()))
    }

    /// Live sessions, most recently updated first.
    pub fn list_sessions(&self) -> Vec<SearchSession> {
        let now = self.clock.now();
        let mut sessions: Vec<SearchSession> = self
            .sessions
            .iter()
            .filter(|s| !s.is_expired(now))
            .map(|s| s.clone())
            .collect();
        sessions.sort_by(|a, b| {
            b.metadata
                .updated_at
                .cmp(&a.metadata.updated_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        sessions
    }

    pub fn delete_session(&self, id: &str) -> bool {
        let removed = self.sessions.remove(id).is_some();
        if removed {
            tracing::info!(session_id = %id, "deleted session");
        }
        removed
    }

    /// Remove every session. Returns how many were removed.
    pub fn clear_all_sessions(&self) -> usize {
        let mut removed = 0;
        self.sessions.retain(|_, _| {
            removed += 1;
            false
        });
        tracing::info!(removed, "cleared all sessions");
        removed
    }

    /// Remove expired sessions. Returns how many were removed.
    pub fn cleanup_expired(&self) -> usize {
        self.purge_expired(self.clock.now())
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let mut removed = 0;
        self.sessions.retain(|_, s| {
            let keep = !s.is_expired(now);
            if !keep {
                removed += 1;
            }
            keep
        });
        removed
    }

    /// Entries currently held, including expired ones not yet swept.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Start the periodic expiry sweep on the current tokio runtime.
    ///
    /// The task holds a weak reference and exits once the manager is
    /// dropped. Calling `start` twice is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut slot = self.sweeper.lock().unwrap_or_else(|e| e.into_inner());
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let weak = Arc::downgrade(self);
        let period = self.config.cleanup_interval();
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                let removed = manager.cleanup_expired();
                if removed > 0 {
                    tracing::info!(removed, "swept expired sessions");
                }
            }
        }));
        tracing::debug!(interval_ms = period.as_millis() as u64, "session sweeper started");
    }

    /// Stop the background sweep, if running.
    pub fn stop(&self) {
        let handle = self
            .sweeper
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.abort();
            tracing::debug!("session sweeper stopped");
        }
    }

    pub fn is_sweeping(&self) -> bool {
        self.sweeper
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use archive_retrieval_core::models::{ContentNode, StoreTag};

    fn config(max_sessions: usize, timeout_ms: u64) -> SessionConfig {
        SessionConfig {
            max_sessions,
            timeout_ms,
            max_history_entries: 3,
            ..Default::default()
        }
    }

    fn manager(max_sessions: usize, timeout_ms: u64) -> (SessionManager, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let mgr = SessionManager::with_clock(config(max_sessions, timeout_ms), clock.clone()).unwrap();
        (mgr, clock)
    }

    fn anchor(id: &str, polarity: AnchorPolarity) -> SemanticAnchor {
        SemanticAnchor::new(id, StoreTag::Archive, polarity, vec![1.0, 0.0], "text", Utc::now())
    }

    fn entry(query: &str) -> SearchHistoryEntry {
        SearchHistoryEntry {
            query: Some(query.to_string()),
            timestamp: Utc::now(),
            result_count: 0,
            target: StoreTarget::All,
            kind: HistoryKind::Search,
            min_score: None,
            min_word_count: None,
        }
    }

    #[test]
    fn test_capacity_evicts_least_recently_updated() {
        let (mgr, clock) = manager(2, 60_000);
        let s1 = mgr.create_session();
        clock.advance_ms(10);
        let s2 = mgr.create_session();
        clock.advance_ms(10);
        let s3 = mgr.create_session();

        assert!(mgr.get_session(&s1.id).is_none());
        assert!(mgr.get_session(&s2.id).is_some());
        assert!(mgr.get_session(&s3.id).is_some());
        assert_eq!(mgr.session_count(), 2);
    }

    #[test]
    fn test_write_refreshes_lru_position() {
        let (mgr, clock) = manager(2, 60_000);
        let s1 = mgr.create_session();
        clock.advance_ms(10);
        let s2 = mgr.create_session();
        clock.advance_ms(10);
        mgr.pin_results(&s1.id, &["r".to_string()]).unwrap();
        clock.advance_ms(10);
        mgr.create_session();

        assert!(mgr.get_session(&s1.id).is_some());
        assert!(mgr.get_session(&s2.id).is_none());
    }

    #[test]
    fn test_eviction_prefers_expired_sessions() {
        let (mgr, clock) = manager(2, 1000);
        let s1 = mgr.create_session();
        clock.advance_ms(900);
        let s2 = mgr.create_session();
        clock.advance_ms(200);
        // s1 has expired; s2 is older than the new one but still live.
        let s3 = mgr.create_session();
        assert!(mgr.get_session(&s2.id).is_some());
        assert!(mgr.get_session(&s3.id).is_some());
        assert!(mgr.get_session(&s1.id).is_none());
    }

    #[test]
    fn test_ttl_expiry_on_access() {
        let (mgr, clock) = manager(10, 1000);
        let s = mgr.create_session();
        clock.advance_ms(1001);
        assert!(mgr.get_session(&s.id).is_none());
        assert_eq!(mgr.session_count(), 0);
    }

    #[test]
    fn test_session_alive_at_exact_expiry() {
        let (mgr, clock) = manager(10, 1000);
        let s = mgr.create_session();
        clock.advance_ms(1000);
        assert!(mgr.get_session(&s.id).is_some());
    }

    #[test]
    fn test_mutating_expired_session_fails() {
        let (mgr, clock) = manager(10, 1000);
        let s = mgr.create_session();
        clock.advance_ms(1500);
        let err = mgr.exclude_results(&s.id, &["a".to_string()]).unwrap_err();
        assert!(matches!(err, RetrievalError::SessionNotFound(_)));
        assert_eq!(mgr.session_count(), 0);
    }

    #[test]
    fn test_unknown_session_is_not_found() {
        let (mgr, _) = manager(10, 1000);
        let err = mgr.set_notes("missing", Some("x".into())).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_touch_extends_ttl_and_is_strictly_increasing() {
        let (mgr, clock) = manager(10, 1000);
        let s = mgr.create_session();
        mgr.rename_session(&s.id, Some("first".into())).unwrap();
        mgr.rename_session(&s.id, Some("second".into())).unwrap();
        let after = mgr.get_session(&s.id).unwrap();
        assert!(after.metadata.updated_at > s.metadata.updated_at);
        assert_eq!(after.name.as_deref(), Some("second"));

        clock.advance_ms(800);
        mgr.set_notes(&s.id, Some("keep".into())).unwrap();
        clock.advance_ms(800);
        let alive = mgr.get_session(&s.id).unwrap();
        assert_eq!(alive.notes.as_deref(), Some("keep"));
        assert_eq!(
            alive.metadata.expires_at - alive.metadata.updated_at,
            Duration::milliseconds(1000)
        );
    }

    #[test]
    fn test_pin_and_exclude_are_disjoint() {
        let (mgr, _) = manager(10, 60_000);
        let s = mgr.create_session();
        let ids = vec!["a".to_string(), "b".to_string()];
        assert_eq!(mgr.exclude_results(&s.id, &ids).unwrap(), 2);
        assert_eq!(mgr.pin_results(&s.id, &["a".to_string()]).unwrap(), 1);
        // "a" is pinned, excluding it again is skipped
        assert_eq!(mgr.exclude_results(&s.id, &ids).unwrap(), 0);

        let snap = mgr.get_session(&s.id).unwrap();
        assert!(snap.pinned_ids.contains("a"));
        assert!(!snap.excluded_ids.contains("a"));
        assert!(snap.excluded_ids.contains("b"));

        mgr.unpin_results(&s.id, &["a".to_string()]).unwrap();
        mgr.unexclude_results(&s.id, &["b".to_string()]).unwrap();
        let snap = mgr.get_session(&s.id).unwrap();
        assert!(snap.pinned_ids.is_empty());
        assert!(snap.excluded_ids.is_empty());
    }

    #[test]
    fn test_anchor_polarity_switch_dedups() {
        let (mgr, _) = manager(10, 60_000);
        let s = mgr.create_session();
        mgr.add_positive_anchor(&s.id, anchor("x", AnchorPolarity::Positive)).unwrap();
        mgr.add_positive_anchor(&s.id, anchor("x", AnchorPolarity::Positive)).unwrap();
        mgr.add_negative_anchor(&s.id, anchor("x", AnchorPolarity::Positive)).unwrap();

        let snap = mgr.get_session(&s.id).unwrap();
        assert!(snap.positive_anchors.is_empty());
        assert_eq!(snap.negative_anchors.len(), 1);
        assert_eq!(snap.negative_anchors[0].polarity, AnchorPolarity::Negative);

        assert!(mgr.remove_anchor(&s.id, "x").unwrap());
        assert!(!mgr.remove_anchor(&s.id, "x").unwrap());
    }

    #[test]
    fn test_history_is_bounded_fifo() {
        let (mgr, _) = manager(10, 60_000);
        let s = mgr.create_session();
        for q in ["q1", "q2", "q3", "q4", "q5"] {
            mgr.add_history_entry(&s.id, entry(q)).unwrap();
        }
        let snap = mgr.get_session(&s.id).unwrap();
        let queries: Vec<_> = snap.history.iter().filter_map(|e| e.query.as_deref()).collect();
        assert_eq!(queries, vec!["q3", "q4", "q5"]);
    }

    #[test]
    fn test_commit_search_updates_metadata() {
        let (mgr, _) = manager(10, 60_000);
        let s = mgr.create_session();
        let result = SearchResult {
            id: "r1".into(),
            source: StoreTag::Archive,
            node: ContentNode::new("r1", "hello world"),
            score: 0.5,
        };
        let committed = mgr
            .commit_search(
                &s.id,
                SearchCommit {
                    results: vec![result],
                    entry: entry("hello"),
                },
            )
            .unwrap();
        assert_eq!(committed.results.len(), 1);
        assert_eq!(committed.metadata.search_count, 1);
        assert_eq!(committed.metadata.last_query.as_deref(), Some("hello"));
        assert_eq!(committed.history.len(), 1);
    }

    #[test]
    fn test_add_results_replaces_same_id() {
        let (mgr, _) = manager(10, 60_000);
        let s = mgr.create_session();
        let mk = |id: &str, score: f64| SearchResult {
            id: id.into(),
            source: StoreTag::Archive,
            node: ContentNode::new(id, "text"),
            score,
        };
        mgr.add_results(&s.id, vec![mk("a", 0.1), mk("b", 0.2)]).unwrap();
        mgr.add_results(&s.id, vec![mk("a", 0.9)]).unwrap();
        let snap = mgr.get_session(&s.id).unwrap();
        assert_eq!(snap.results.len(), 2);
        assert_eq!(snap.results[0].score, 0.9);
    }

    #[test]
    fn test_create_with_id_reuses_live_session() {
        let (mgr, _) = manager(10, 60_000);
        let a = mgr.create_session_with_id("mine").unwrap();
        mgr.set_notes("mine", Some("n".into())).unwrap();
        let b = mgr.create_session_with_id("mine").unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(b.notes.as_deref(), Some("n"));
        assert!(mgr.create_session_with_id("  ").is_err());
    }

    #[test]
    fn test_list_sessions_orders_by_update_and_skips_expired() {
        let (mgr, clock) = manager(10, 1000);
        let old = mgr.create_session();
        clock.advance_ms(600);
        let a = mgr.create_session_named("a");
        clock.advance_ms(10);
        let b = mgr.create_session_named("b");
        clock.advance_ms(10);
        mgr.set_notes(&a.id, Some("bump".into())).unwrap();
        clock.advance_ms(400);

        let ids: Vec<String> = mgr.list_sessions().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![a.id, b.id]);
        assert!(!mgr.list_sessions().iter().any(|s| s.id == old.id));
    }

    #[test]
    fn test_cleanup_and_clear() {
        let (mgr, clock) = manager(10, 1000);
        mgr.create_session();
        mgr.create_session();
        clock.advance_ms(2000);
        mgr.create_session();
        assert_eq!(mgr.cleanup_expired(), 2);
        assert_eq!(mgr.session_count(), 1);
        assert!(mgr.delete_session(&mgr.list_sessions()[0].id));
        mgr.create_session();
        mgr.create_session();
        assert_eq!(mgr.clear_all_sessions(), 2);
        assert_eq!(mgr.session_count(), 0);
    }

    #[tokio::test]
    async fn test_background_sweep_removes_expired() {
        let clock = Arc::new(ManualClock::default());
        let cfg = SessionConfig {
            timeout_ms: 1000,
            cleanup_interval_ms: 10,
            ..Default::default()
        };
        let mgr = Arc::new(SessionManager::with_clock(cfg, clock.clone()).unwrap());
        mgr.create_session();
        mgr.start();
        assert!(mgr.is_sweeping());

        clock.advance_ms(5000);
        for _ in 0..100 {
            if mgr.session_count() == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(mgr.session_count(), 0);

        mgr.stop();
        assert!(!mgr.is_sweeping());
    }

    #[test]
    fn test_expiry_saturates_for_huge_timeouts() {
        let now = Utc::now();
        let mut session = SearchSession::new("s", now, Duration::MAX);
        assert_eq!(session.metadata.expires_at, DateTime::<Utc>::MAX_UTC);
        assert!(!session.is_expired(now));

        session.touch(now + Duration::seconds(1), Duration::MAX);
        assert_eq!(session.metadata.expires_at, DateTime::<Utc>::MAX_UTC);

        session.metadata.updated_at = DateTime::<Utc>::MAX_UTC;
        session.touch(now, Duration::milliseconds(1));
        assert_eq!(session.metadata.updated_at, DateTime::<Utc>::MAX_UTC);
    }

    #[test]
    fn test_constructor_rejects_invalid_config() {
        let clock = Arc::new(ManualClock::default());
        let zero_interval = SessionConfig {
            cleanup_interval_ms: 0,
            ..Default::default()
        };
        assert!(SessionManager::with_clock(zero_interval, clock.clone()).is_err());

        let huge_timeout = SessionConfig {
            timeout_ms: u64::MAX,
            ..Default::default()
        };
        assert!(SessionManager::with_clock(huge_timeout, clock.clone()).is_err());
        assert!(SessionManager::new(config(0, 1000)).is_err());
    }
}
