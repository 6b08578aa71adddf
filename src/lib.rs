//! # Archive Retrieval
//!
//! Retrieval and session-refinement engine for a personal content archive.
//!
//! A query is answered by fusing dense (vector) and sparse (keyword) hits
//! with weighted reciprocal rank fusion, re-ranking them against the
//! session's anchors, and passing them through a quality gate that drops
//! thin fragments and expands short ones with parent context. Sessions
//! remember results, history, anchors, exclusions and pins so a user can
//! refine the set across calls.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌───────────────────┐   ┌──────────────┐
//! │  Retrieval   │──▶│   Unified store   │──▶│   archive    │
//! │   service    │   │  (target-aware)   │──▶│ books (opt.) │
//! └──────┬───────┘   └───────────────────┘   └──────────────┘
//!        │
//!        ├──▶ fusion ─▶ anchors ─▶ quality gate      (core crate)
//!        │
//!        └──▶ session manager  (DashMap, LRU + TTL, sweeper)
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`clock`] | Injectable time source for session expiry |
//! | [`session`] | Sessions and the session manager |
//! | [`service`] | `search`, `refine`, anchors and session operations |
//!
//! Pure logic (content model, fusion, quality gate, anchors, store traits)
//! lives in `archive-retrieval-core`; its modules are re-exported here.

pub mod clock;
pub mod config;
pub mod service;
pub mod session;

pub use archive_retrieval_core::{
    anchors, embedding, error, fusion, models, quality, store, RetrievalError,
};
