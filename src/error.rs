use thiserror::Error;

/// Failures surfaced by fetch and sync operations.
///
/// `Display` is what lands in [`SyncState::error`](crate::models::SyncState),
/// so `AuthExpired` renders as the bare `AUTH_EXPIRED` code the UI keys on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// The access token was rejected. Never retried.
    #[error("AUTH_EXPIRED")]
    AuthExpired,
    /// Network or API failure after retries were exhausted.
    #[error("{0}")]
    Transport(String),
    /// The local cache could not be read or written.
    #[error("{0}")]
    Store(String),
    /// A reset happened while the operation was in flight.
    #[error("operation cancelled")]
    Cancelled,
    /// Another operation already owns the state machine.
    #[error("sync already in progress")]
    Busy,
}

impl SyncError {
    pub fn is_auth_expired(&self) -> bool {
        matches!(self, Self::AuthExpired)
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        SyncError::Transport(format!("request failed: {e}"))
    }
}
