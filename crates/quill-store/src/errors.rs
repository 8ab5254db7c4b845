//! Error types for the store subsystem.
//!
//! [`StoreError`] distinguishes the kinds the rest of the system branches
//! on: configuration failures are fatal at construction, busy/locked is
//! separate from logical SQL errors so callers can retry with backoff, and
//! not-found carries the missing ID. Constraint violations stay inside the
//! `Sqlite` variant verbatim; the slug-collision retry path inspects the
//! driver message.

use thiserror::Error;

/// Errors returned by pool and store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Invalid configuration, fatal at construction (empty path,
    /// `:memory:`, too few readers).
    #[error("store configuration error: {0}")]
    Config(String),

    /// `SQLite` driver error, surfaced verbatim.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The database was busy or locked; retryable.
    #[error("database busy: {0}")]
    Busy(rusqlite::Error),

    /// Reader pool error.
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// JSON serialization error.
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Schema migration failed.
    #[error("migration error: {message}")]
    Migration {
        /// Which migration failed and why.
        message: String,
    },

    /// Requested conversation does not exist.
    #[error("conversation not found: {0}")]
    ConversationNotFound(String),

    /// Requested message does not exist.
    #[error("message not found: {0}")]
    MessageNotFound(String),

    /// Internal invariant failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl StoreError {
    /// Reclassify a wrapped driver error as [`StoreError::Busy`] when the
    /// underlying code is busy/locked. Applied at the pool boundary so
    /// every scope reports busy uniformly.
    #[must_use]
    pub(crate) fn remap_busy(self) -> Self {
        match self {
            Self::Sqlite(e) if is_busy(&e) => Self::Busy(e),
            other => other,
        }
    }

    /// Whether this error is a uniqueness constraint violation, judged by
    /// driver message substring as the store returns driver errors
    /// verbatim.
    #[must_use]
    pub fn is_unique_violation(&self) -> bool {
        let text = self.to_string().to_lowercase();
        text.contains("unique constraint") || text.contains("duplicate")
    }
}

fn is_busy(e: &rusqlite::Error) -> bool {
    matches!(
        e.sqlite_error_code(),
        Some(rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked)
    )
}

/// Convenience alias for store results.
pub type Result<T> = std::result::Result<T, StoreError>;

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
