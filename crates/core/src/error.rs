//! Error types for the Elowen domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Backend failures live in their own bounded-context enum so the session
//! can match on them without string inspection.

use thiserror::Error;

/// The top-level error type for all Elowen operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Inbound payload errors ---
    #[error("Validation error: {0}")]
    Validation(String),

    // --- Connection identity errors; the reason goes to the client verbatim ---
    #[error("{0}")]
    Auth(String),

    // --- Internal invariant breach: history reached assembly unsanitized ---
    #[error("History alternation error: {0}")]
    Alternation(String),

    // --- Backend errors ---
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("Generation cancelled")]
    Cancelled,
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Failures surfaced by a text-generation backend.
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    /// Connection or transport failure, or a server-side error response.
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    /// The backend refused the request as malformed.
    #[error("Backend rejected request (status {status_code}): {reason}")]
    Rejected { status_code: u16, reason: String },

    #[error("Backend timed out: {0}")]
    Timeout(String),
}

impl BackendError {
    /// Whether this is a rejection caused by the backend's chat template
    /// refusing a turn list that does not alternate user/assistant.
    pub fn is_alternation_violation(&self) -> bool {
        match self {
            Self::Rejected { reason, .. } => {
                let reason = reason.to_lowercase();
                reason.contains("alternate") || reason.contains("alternation")
            }
            _ => false,
        }
    }
}
