//! Core error type for the Conductor platform.
//!
//! `CoreError` is used throughout the domain (stores, engine, sessions,
//! event bus). Callers always receive one of these variants — raw backend
//! errors never cross the session controller boundary.

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    /// Cooperative cancellation was observed mid-call. Carries the last
    /// continuation token seen before the abort (if any) so the caller can
    /// resume the session instead of restarting it.
    #[error("Aborted (continuation token: {})", continuation_token.as_deref().unwrap_or("none"))]
    Aborted {
        continuation_token: Option<String>,
    },

    /// Wrapped failure from the underlying AI backend.
    #[error("Provider error: {0}")]
    Provider(String),

    /// Event bus transport failure (initialize or emit).
    #[error("Transport error: {0}")]
    Transport(String),
}

impl CoreError {
    /// Whether this error is a cooperative abort (as opposed to a crash).
    pub fn is_abort(&self) -> bool {
        matches!(self, CoreError::Aborted { .. })
    }

    /// The continuation token carried by an abort, if any.
    pub fn abort_token(&self) -> Option<&str> {
        match self {
            CoreError::Aborted { continuation_token } => continuation_token.as_deref(),
            _ => None,
        }
    }
}
