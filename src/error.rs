use thiserror::Error;

/// Failures of the relay core: storage, dispatch and push.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Dispatch attempted before any LINE user has written in
    #[error("No LINE user to send to. Wait for a message from LINE first.")]
    NoRecipient,

    /// Operator text was empty or whitespace only
    #[error("message text must not be empty")]
    EmptyMessage,

    /// File or network I/O against the store failed or timed out
    #[error("{backend} backend unavailable: {reason}")]
    BackendUnavailable {
        backend: &'static str,
        reason: String,
    },

    /// Persisted state exists but does not parse
    #[error("{backend} backend holds malformed state: {reason}")]
    MalformedState {
        backend: &'static str,
        reason: String,
    },

    /// Concurrent writers kept replacing the log under us
    #[error("{backend} backend lost an update after {attempts} attempts")]
    LostUpdate {
        backend: &'static str,
        attempts: u32,
    },

    /// The push API rejected the message or could not be reached
    #[error("push failed: {reason}")]
    PushFailed { reason: String },
}

impl RelayError {
    pub fn unavailable(backend: &'static str, reason: impl ToString) -> Self {
        RelayError::BackendUnavailable {
            backend,
            reason: reason.to_string(),
        }
    }

    pub fn malformed(backend: &'static str, reason: impl ToString) -> Self {
        RelayError::MalformedState {
            backend,
            reason: reason.to_string(),
        }
    }

    /// Errors caused by the request rather than by the service.
    pub fn is_client_error(&self) -> bool {
        matches!(self, RelayError::NoRecipient | RelayError::EmptyMessage)
    }
}
