//! Fraud Scoring Pipeline Library
//!
//! Real-time transaction fraud scoring: events are pulled from a JetStream
//! stream, turned into the model's feature vector, scored by an ONNX
//! classifier, written to a positive or negative store and, for fraud,
//! announced once on an alert subject.

pub mod alerting;
pub mod config;
pub mod consumer;
pub mod errors;
pub mod metrics;
pub mod models;
pub mod processor;
pub mod producer;
pub mod router;
pub mod sinks;
pub mod transformer;
pub mod types;

pub use alerting::{AlertDispatcher, Notifier, NotifyOutcome};
pub use config::AppConfig;
pub use consumer::{Delivery, EventSource, MemorySource, TransactionConsumer};
pub use errors::{NotifyError, ProcessorError, RouteError, ScoreError, TransformError};
pub use models::{ModelRegistry, RiskScorer};
pub use processor::{ConsumptionPosition, EventPipeline, ProcessorSettings, StreamProcessor};
pub use producer::AlertProducer;
pub use router::OutcomeRouter;
pub use transformer::FeatureTransformer;
pub use types::{
    alert::FraudAlert, features::FeatureVector, scored::ScoredTransaction,
    transaction::TransactionEvent,
};
