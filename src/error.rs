use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PacerError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Item not tracked: {0}")]
    ItemNotFound(String),

    #[error("Queue is shut down")]
    QueueClosed,

    #[error("Admission error: {0}")]
    Admission(#[from] AdmissionError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Why a single transfer attempt did not succeed.
///
/// This is the only error surface a work item carries: resolver and transport
/// failures are translated into one of these variants at the driver loop and
/// stored as the item's last error.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum TransferError {
    /// Network or storage hiccup. Retried with backoff.
    #[error("transient failure: {0}")]
    Transient(String),

    /// The write authorization lapsed before the bytes went out. Re-resolved,
    /// and counts as a retry.
    #[error("write authorization expired")]
    AuthorizationExpired,

    /// Malformed identity or a request the issuer will never accept.
    #[error("validation failed: {0}")]
    PermanentValidation(String),

    /// Caller-initiated. Terminal, distinct from a failure.
    #[error("cancelled")]
    Cancelled,

    /// The admission grace period expired under memory pressure. Logged only.
    #[error("resource pressure persisted for {waited_ms}ms, admitting anyway")]
    ResourceExhausted { waited_ms: u64 },
}

impl TransferError {
    /// Whether the queue may re-enter resolution after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransferError::Transient(_) | TransferError::AuthorizationExpired
        )
    }
}

impl From<reqwest::Error> for TransferError {
    fn from(err: reqwest::Error) -> Self {
        TransferError::Transient(err.to_string())
    }
}

impl From<std::io::Error> for TransferError {
    fn from(err: std::io::Error) -> Self {
        TransferError::Transient(format!("io: {err}"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError {
    #[error("acquisition cancelled before a slot freed")]
    Cancelled,

    #[error("requested weight {weight} exceeds pool capacity {capacity}")]
    WeightExceedsCapacity { weight: usize, capacity: usize },

    #[error("slot pool closed")]
    Closed,
}

impl From<AdmissionError> for TransferError {
    fn from(err: AdmissionError) -> Self {
        match err {
            AdmissionError::Cancelled => TransferError::Cancelled,
            AdmissionError::Closed => TransferError::Transient(err.to_string()),
            AdmissionError::WeightExceedsCapacity { .. } => {
                TransferError::PermanentValidation(err.to_string())
            }
        }
    }
}
