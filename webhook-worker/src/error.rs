//! Error taxonomy for the ingestion and processing pipeline.
//!
//! Each boundary has its own error type so callers can decide on the
//! response (HTTP status on ingestion, ack/nack on the worker) without
//! string matching.

use thiserror::Error;

/// Failures raised while verifying an inbound webhook.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum VerifyError {
    /// The external installation identifier has no integration on file.
    #[error("no integration found for identifier {0}")]
    UnknownIntegration(String),

    /// The provider signature is missing, stale, or does not match.
    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    /// The body could not be parsed into the shape dispatch needs.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
}

/// Failures raised by the persistence layer.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached or rejected the query.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A store call exceeded its time budget.
    #[error("store call timed out after {0}ms")]
    Timeout(u64),

    /// An optimistic-concurrency check failed.
    #[error("version conflict on {entity} {id}")]
    Conflict { entity: &'static str, id: String },

    /// A write would break a uniqueness rule, e.g. one subscription per tenant.
    #[error("duplicate {entity}: {detail}")]
    Duplicate { entity: &'static str, detail: String },
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            if db.is_unique_violation() {
                return StoreError::Duplicate {
                    entity: "row",
                    detail: db.message().to_string(),
                };
            }
        }
        StoreError::Unavailable(err.to_string())
    }
}

/// The work queue did not accept a message.
#[derive(Debug, Error)]
#[error("enqueue failed: {0}")]
pub struct EnqueueError(pub String);

/// The pub/sub fabric did not accept a notification.
#[derive(Debug, Error)]
#[error("notification publish failed: {0}")]
pub struct NotifyError(pub String);

/// Errors surfaced by the ingestion path (verify, record, enqueue).
#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Verification(#[from] VerifyError),

    #[error(transparent)]
    Persistence(#[from] StoreError),

    #[error(transparent)]
    Enqueue(#[from] EnqueueError),
}

/// Errors surfaced while processing a queued event.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The event references data that does not line up with what is on file.
    /// Retrying cannot fix it; an operator has to look.
    #[error("data integrity failure: {0}")]
    DataIntegrity(String),

    /// Network, timeout or storage trouble. Safe to redeliver.
    #[error("transient failure: {0}")]
    Transient(String),
}

impl From<StoreError> for ProcessError {
    fn from(err: StoreError) -> Self {
        match err {
            // Retrying cannot make a taken key free again.
            StoreError::Duplicate { .. } => ProcessError::DataIntegrity(err.to_string()),
            _ => ProcessError::Transient(err.to_string()),
        }
    }
}

impl From<EnqueueError> for ProcessError {
    fn from(err: EnqueueError) -> Self {
        ProcessError::Transient(err.to_string())
    }
}
