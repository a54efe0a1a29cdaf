//! Loaded model and the process-wide handle to the current version.
//!
//! A [`Model`] never changes after construction. New versions are installed
//! by swapping the `Arc` held by [`ModelRegistry`]; a scoring call clones the
//! `Arc` once and keeps using that version even if a swap happens mid-call.

use crate::errors::ScoreError;
use crate::models::inference::Classifier;
use crate::models::manifest::{FeatureEncoder, ModelManifest};
use crate::types::features::FeatureVector;
use std::sync::{Arc, RwLock};
use tracing::info;

/// An immutable, versioned model
pub struct Model {
    manifest: ModelManifest,
    encoder: FeatureEncoder,
    classifier: Box<dyn Classifier>,
    schema_check: Result<(), ScoreError>,
}

impl Model {
    pub fn new(manifest: ModelManifest, classifier: Box<dyn Classifier>) -> Self {
        let encoder = FeatureEncoder::from_manifest(&manifest);
        let schema_check = manifest.check_schema();
        Self {
            manifest,
            encoder,
            classifier,
            schema_check,
        }
    }

    pub fn version(&self) -> &str {
        &self.manifest.version
    }

    pub fn manifest(&self) -> &ModelManifest {
        &self.manifest
    }

    /// Result of comparing the manifest with the transformer's feature layout
    pub fn check_schema(&self) -> Result<(), ScoreError> {
        self.schema_check.clone()
    }

    /// Raw classifier probability for a feature vector
    pub fn predict(&self, features: &FeatureVector) -> Result<f64, ScoreError> {
        self.check_schema()?;
        let input = self.encoder.encode(features);
        self.classifier
            .predict_proba(&input)
            .map_err(|e| ScoreError::Inference(format!("model {}: {e:#}", self.version())))
    }
}

impl std::fmt::Debug for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Model")
            .field("version", &self.manifest.version)
            .field("schema_version", &self.manifest.schema_version)
            .finish()
    }
}

/// Holder of the current model. Single writer, many readers.
#[derive(Default)]
pub struct ModelRegistry {
    current: RwLock<Option<Arc<Model>>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model(model: Model) -> Self {
        let registry = Self::new();
        registry.install(model);
        registry
    }

    /// Snapshot of the current model, if any
    pub fn current(&self) -> Option<Arc<Model>> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Replace the current model, returning the previous one
    pub fn install(&self, model: Model) -> Option<Arc<Model>> {
        let model = Arc::new(model);
        let version = model.version().to_string();
        let previous = {
            let mut guard = match self.current.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.replace(model)
        };

        info!(
            version = %version,
            previous = previous.as_ref().map(|m| m.version()).unwrap_or("none"),
            "Model installed"
        );
        previous
    }

    pub fn current_version(&self) -> Option<String> {
        self.current().map(|m| m.version().to_string())
    }
}
