#![forbid(unsafe_code)]

use fleet_contracts::ContractViolation;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StorageError {
    #[error("{table}: duplicate key {key}")]
    DuplicateKey { table: &'static str, key: String },
    #[error("{table}: no row for key {key}")]
    NotFound { table: &'static str, key: String },
    #[error("queue io failed at {path}: {message}")]
    Io { path: String, message: String },
    #[error("queue file {path} is not a JSON entry array: {message}")]
    Corrupt { path: String, message: String },
    #[error("contract violation: {0}")]
    ContractViolation(#[from] ContractViolation),
}

/// Submission failed in transit; the event stays queued and is retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("transient network error: {message}")]
pub struct TransientNetworkError {
    pub message: String,
    pub retry_after_ms: Option<u32>,
}

impl TransientNetworkError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: bounded_message(message.into()),
            retry_after_ms: None,
        }
    }

    pub fn with_retry_after(message: impl Into<String>, retry_after_ms: u32) -> Self {
        Self {
            message: bounded_message(message.into()),
            retry_after_ms: Some(retry_after_ms.clamp(1_000, 300_000)),
        }
    }
}

/// Rejected by the ingestion boundary. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed event payload: {reason}")]
pub struct MalformedEventPayload {
    pub reason: String,
}

impl From<ContractViolation> for MalformedEventPayload {
    fn from(v: ContractViolation) -> Self {
        Self {
            reason: v.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IngestError {
    #[error(transparent)]
    Transient(#[from] TransientNetworkError),
    #[error(transparent)]
    Malformed(#[from] MalformedEventPayload),
}

impl IngestError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, IngestError::Transient(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueryError {
    #[error(transparent)]
    Transient(#[from] TransientNetworkError),
    #[error("invalid query: {0}")]
    InvalidQuery(String),
}

fn bounded_message(msg: String) -> String {
    if msg.len() > 256 {
        msg.chars().take(256).collect()
    } else {
        msg
    }
}
