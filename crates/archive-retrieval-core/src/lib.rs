//! # Archive Retrieval Core
//!
//! Shared, runtime-agnostic logic for Archive Retrieval: the content model,
//! weighted reciprocal rank fusion, the quality gate, anchor re-ranking,
//! and the store abstraction that merges the archive and books stores.
//!
//! This crate contains no tokio, filesystem I/O, or other native-only
//! dependencies. Timeouts, cancellation and session state live in the
//! `archive-retrieval` app crate.
//!
//! ## Pipeline
//!
//! ```text
//!  dense hits ─┐
//!              ├─▶ fusion ─▶ anchors ─▶ quality gate ─▶ enriched results
//! sparse hits ─┘                              │
//!                                             └─▶ parent lookup (store)
//! ```

pub mod anchors;
pub mod embedding;
pub mod error;
pub mod fusion;
pub mod models;
pub mod quality;
pub mod store;

pub use error::RetrievalError;
