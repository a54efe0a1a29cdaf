//! Risk scoring against the current model

use crate::errors::ScoreError;
use crate::models::registry::ModelRegistry;
use crate::types::features::FeatureVector;
use crate::types::scored::ScoreOutcome;
use std::sync::Arc;
use tracing::debug;

/// Default decision threshold: the classifier's native 0/1 boundary
pub const DEFAULT_THRESHOLD: f64 = 0.5;

/// Scores feature vectors and applies the decision threshold.
///
/// A probability exactly equal to the threshold is classified as fraud.
#[derive(Clone)]
pub struct RiskScorer {
    registry: Arc<ModelRegistry>,
    threshold: f64,
}

impl RiskScorer {
    pub fn new(registry: Arc<ModelRegistry>, threshold: f64) -> Self {
        Self {
            registry,
            threshold,
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn score(&self, features: &FeatureVector) -> Result<ScoreOutcome, ScoreError> {
        let model = self
            .registry
            .current()
            .ok_or_else(|| ScoreError::ModelUnavailable("no model loaded".to_string()))?;

        let probability = model.predict(features)?;
        if !(0.0..=1.0).contains(&probability) {
            return Err(ScoreError::Inference(format!(
                "model {} returned probability {probability} outside [0, 1]",
                model.version()
            )));
        }

        let decision = probability >= self.threshold;
        debug!(
            model = %model.version(),
            probability = probability,
            decision = decision,
            "Scored feature vector"
        );

        Ok(ScoreOutcome {
            probability,
            decision,
            model_version: model.version().to_string(),
        })
    }
}
