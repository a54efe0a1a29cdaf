//! Type definitions for the scoring pipeline

pub mod alert;
pub mod features;
pub mod scored;
pub mod transaction;

pub use alert::{FraudAlert, RiskLevel, RiskLevelThresholds};
pub use features::{FeatureKind, FeatureSpec, FeatureValue, FeatureVector, FEATURE_SCHEMA_VERSION};
pub use scored::{
    DeadLetter, Destination, FailureStage, OutcomeRecord, ScoreOutcome, ScoredTransaction,
};
pub use transaction::TransactionEvent;
