//! Error taxonomy for the scoring pipeline.
//!
//! Each stage owns its error enum. The processor decides per variant whether
//! an event is skipped, retried, dead-lettered or whether ingestion halts.

use std::time::Duration;
use thiserror::Error;

/// Malformed input. Never retryable: the event is skipped and committed.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransformError {
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),
    #[error("Malformed timestamp in field `{field}`: {value:?}")]
    MalformedTimestamp { field: &'static str, value: String },
    #[error("Invalid amount: {0}")]
    InvalidAmount(f64),
    #[error("Invalid coordinates in field `{field}`: {value}")]
    InvalidCoordinates { field: &'static str, value: f64 },
    #[error("Missing required field `{0}`")]
    MissingField(&'static str),
}

/// Scoring failures.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScoreError {
    /// No model loaded, or the classifier did not answer in time. Retryable.
    #[error("Model unavailable: {0}")]
    ModelUnavailable(String),
    /// The loaded model was trained on a different feature layout. Fatal.
    #[error("Feature schema mismatch: model {model_version} expects {expected}, transformer produces {found}")]
    SchemaMismatch {
        model_version: String,
        expected: String,
        found: String,
    },
    /// The classifier failed or produced an out-of-range probability.
    #[error("Inference failed: {0}")]
    Inference(String),
}

impl ScoreError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, ScoreError::SchemaMismatch { .. })
    }
}

/// Destination store failures.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RouteError {
    /// Transient failure or timeout; the caller retries.
    #[error("Sink unavailable: {0}")]
    SinkUnavailable(String),
    #[error("Failed to encode outcome record: {0}")]
    Encode(String),
}

impl RouteError {
    pub fn timed_out(after: Duration) -> Self {
        RouteError::SinkUnavailable(format!("timed out after {after:?}"))
    }
}

/// Notification failures. Logged, never fatal to the event.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NotifyError {
    #[error("Notification channel unavailable: {0}")]
    ChannelUnavailable(String),
    #[error("Alert ledger unavailable: {0}")]
    LedgerUnavailable(String),
}

/// Failures of the ingress stream itself.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Ingress stream error: {0}")]
    Stream(String),
    #[error("Failed to acknowledge delivery at position {position}: {reason}")]
    Ack { position: u64, reason: String },
}

/// Failures of the dead-letter sink.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Dead-letter sink unavailable: {0}")]
pub struct DeadLetterError(pub String);

/// Reasons the stream processor stops.
#[derive(Error, Debug)]
pub enum ProcessorError {
    #[error("Ingestion halted: {0}")]
    Score(#[from] ScoreError),
    #[error("Ingestion halted: event {transaction_id} could not be dead-lettered: {source}")]
    DeadLetter {
        transaction_id: String,
        #[source]
        source: DeadLetterError,
    },
    #[error(transparent)]
    Source(#[from] SourceError),
}
