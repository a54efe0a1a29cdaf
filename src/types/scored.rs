//! Scoring results and the records written downstream

use crate::types::features::FeatureVector;
use crate::types::transaction::TransactionEvent;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Result of one classifier call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreOutcome {
    /// Fraud probability in [0, 1]
    pub probability: f64,
    /// `probability >= threshold`
    pub decision: bool,
    /// Version of the model that produced the score
    pub model_version: String,
}

/// A transaction together with its features and score.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredTransaction {
    pub event: TransactionEvent,
    pub features: FeatureVector,
    pub outcome: ScoreOutcome,
}

impl ScoredTransaction {
    pub fn new(event: TransactionEvent, features: FeatureVector, outcome: ScoreOutcome) -> Self {
        Self {
            event,
            features,
            outcome,
        }
    }

    pub fn transaction_id(&self) -> &str {
        &self.event.transaction_id
    }

    pub fn is_fraud(&self) -> bool {
        self.outcome.decision
    }

    pub fn probability(&self) -> f64 {
        self.outcome.probability
    }
}

/// Which store a scored transaction lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Destination {
    Positive,
    Negative,
}

impl Destination {
    pub fn for_decision(decision: bool) -> Self {
        if decision {
            Destination::Positive
        } else {
            Destination::Negative
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Positive => write!(f, "positive"),
            Destination::Negative => write!(f, "negative"),
        }
    }
}

/// Document stored in the positive or negative store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeRecord {
    #[serde(flatten)]
    pub event: TransactionEvent,
    pub is_fraud: bool,
    pub fraud_probability: f64,
    pub model_version: String,
    pub scored_at: DateTime<Utc>,
}

impl From<&ScoredTransaction> for OutcomeRecord {
    fn from(scored: &ScoredTransaction) -> Self {
        Self {
            event: scored.event.clone(),
            is_fraud: scored.outcome.decision,
            fraud_probability: scored.outcome.probability,
            model_version: scored.outcome.model_version.clone(),
            scored_at: Utc::now(),
        }
    }
}

/// Pipeline stage at which an event reached a terminal failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureStage {
    Transform,
    Score,
    Route,
    /// Routed, but the fraud alert could not be delivered
    Alert,
}

/// Forensic record of an event that was skipped or exhausted its retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// Transaction id when the payload could be decoded
    pub transaction_id: Option<String>,
    /// Position of the delivery on the ingress stream
    pub position: u64,
    pub stage: FailureStage,
    pub reason: String,
    pub attempts: u32,
    /// Raw payload as received, for replay
    pub payload: String,
    pub recorded_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(
        transaction_id: Option<String>,
        position: u64,
        stage: FailureStage,
        reason: impl Into<String>,
        attempts: u32,
        payload: &[u8],
    ) -> Self {
        Self {
            transaction_id,
            position,
            stage,
            reason: reason.into(),
            attempts,
            payload: String::from_utf8_lossy(payload).into_owned(),
            recorded_at: Utc::now(),
        }
    }
}
