//! Error taxonomy for retrieval and session operations.
//!
//! Store and embedding backends return `anyhow::Result`; the service maps
//! their failures into [`RetrievalError::Upstream`], [`RetrievalError::Timeout`]
//! or [`RetrievalError::Cancelled`] so callers can match on the kind.

/// Errors surfaced by the retrieval engine.
#[derive(Debug, thiserror::Error)]
pub enum RetrievalError {
    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("result {result_id} is not part of session {session_id}")]
    ResultNotInSession {
        session_id: String,
        result_id: String,
    },

    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("invalid configuration: {0}")]
    Validation(String),

    #[error("{operation} failed: {source}")]
    Upstream {
        operation: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("{operation} timed out after {after_ms}ms")]
    Timeout {
        operation: &'static str,
        after_ms: u64,
    },

    #[error("request cancelled")]
    Cancelled,
}

impl RetrievalError {
    /// True for the "no such session" and "no such node" conditions.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            RetrievalError::SessionNotFound(_)
                | RetrievalError::ResultNotInSession { .. }
                | RetrievalError::NodeNotFound(_)
        )
    }

    pub fn upstream(operation: &'static str, source: anyhow::Error) -> Self {
        RetrievalError::Upstream { operation, source }
    }
}
