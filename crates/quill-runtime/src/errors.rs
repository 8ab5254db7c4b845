//! Error types for the runtime subsystem.

use quill_core::ServiceError;
use quill_store::StoreError;
use thiserror::Error;

/// Errors surfaced by managers, loops, and the registry.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Persistence failure.
    #[error("persistence error: {0}")]
    Store(#[from] StoreError),

    /// JSON serialization failure.
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Subprocess or pipe failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// LLM service failure.
    #[error("llm service error: {0}")]
    Service(#[from] ServiceError),

    /// The operation's cancellation context fired.
    #[error("operation cancelled")]
    Cancelled,

    /// The sub-agent bridge could not materialize a child conversation.
    #[error("subagent bridge error: {0}")]
    Bridge(String),

    /// Internal invariant failure.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Convenience alias for runtime results.
pub type Result<T> = std::result::Result<T, RuntimeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancelled_display() {
        assert_eq!(RuntimeError::Cancelled.to_string(), "operation cancelled");
    }

    #[test]
    fn store_error_wraps() {
        let err: RuntimeError = StoreError::ConversationNotFound("c1".into()).into();
        assert!(err.to_string().contains("conversation not found: c1"));
    }
}
