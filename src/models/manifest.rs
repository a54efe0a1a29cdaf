//! Model manifest: the feature contract shipped next to each ONNX artifact

use crate::errors::ScoreError;
use crate::types::features::{self, FeatureKind, FeatureValue, FeatureVector};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// One input column as recorded by the training pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestFeature {
    pub name: String,
    pub kind: FeatureKind,
}

/// Description of a trained model artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelManifest {
    /// Version/identity of the artifact, logged on load
    pub version: String,
    /// Feature schema version the model was trained against
    pub schema_version: u32,
    /// Input columns in tensor order
    pub features: Vec<ManifestFeature>,
    /// Category values per categorical column; a value's code is its index
    #[serde(default)]
    pub vocabularies: HashMap<String, Vec<String>>,
    /// Code used for categories not present in the vocabulary
    #[serde(default = "default_unknown_category")]
    pub unknown_category: f32,
}

fn default_unknown_category() -> f32 {
    -1.0
}

impl ModelManifest {
    /// Read a manifest from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read(path)
            .with_context(|| format!("Failed to read model manifest {}", path.display()))?;
        serde_json::from_slice(&raw)
            .with_context(|| format!("Failed to parse model manifest {}", path.display()))
    }

    /// Manifest describing exactly the current feature layout.
    pub fn for_current_schema(version: &str) -> Self {
        Self {
            version: version.to_string(),
            schema_version: features::FEATURE_SCHEMA_VERSION,
            features: FeatureVector::SCHEMA
                .iter()
                .map(|spec| ManifestFeature {
                    name: spec.name.to_string(),
                    kind: spec.kind,
                })
                .collect(),
            vocabularies: HashMap::new(),
            unknown_category: default_unknown_category(),
        }
    }

    pub fn describe_schema(&self) -> String {
        features::describe(
            self.schema_version,
            self.features.iter().map(|f| (f.name.as_str(), f.kind)),
        )
    }

    /// Verify the model was trained on the layout the transformer produces.
    pub fn check_schema(&self) -> Result<(), ScoreError> {
        let layout_matches = self.features.len() == FeatureVector::SCHEMA.len()
            && self
                .features
                .iter()
                .zip(FeatureVector::SCHEMA.iter())
                .all(|(ours, theirs)| ours.name == theirs.name && ours.kind == theirs.kind);

        if self.schema_version == features::FEATURE_SCHEMA_VERSION && layout_matches {
            Ok(())
        } else {
            Err(ScoreError::SchemaMismatch {
                model_version: self.version.clone(),
                expected: self.describe_schema(),
                found: FeatureVector::describe_schema(),
            })
        }
    }
}

/// Turns a feature vector into the numeric input tensor.
#[derive(Debug, Clone)]
pub struct FeatureEncoder {
    /// Per column: category code lookup, `None` for numeric columns
    codes: Vec<Option<HashMap<String, f32>>>,
    unknown_category: f32,
}

impl FeatureEncoder {
    pub fn from_manifest(manifest: &ModelManifest) -> Self {
        let codes = manifest
            .features
            .iter()
            .map(|feature| match feature.kind {
                FeatureKind::Numeric => None,
                FeatureKind::Categorical => Some(
                    manifest
                        .vocabularies
                        .get(&feature.name)
                        .map(|values| {
                            values
                                .iter()
                                .enumerate()
                                .map(|(code, value)| (value.clone(), code as f32))
                                .collect()
                        })
                        .unwrap_or_default(),
                ),
            })
            .collect();

        Self {
            codes,
            unknown_category: manifest.unknown_category,
        }
    }

    /// Encode in schema order. Callers check the schema first.
    pub fn encode(&self, features: &FeatureVector) -> Vec<f32> {
        features
            .values()
            .iter()
            .zip(self.codes.iter())
            .map(|(value, codes)| match (value, codes) {
                (FeatureValue::Numeric(v), _) => *v as f32,
                (FeatureValue::Categorical(v), Some(codes)) => {
                    codes.get(*v).copied().unwrap_or(self.unknown_category)
                }
                (FeatureValue::Categorical(_), None) => self.unknown_category,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transformer::FeatureTransformer;
    use crate::types::transaction::sample_event;
    use std::io::Write;

    #[test]
    fn test_current_schema_is_accepted() {
        let manifest = ModelManifest::for_current_schema("m1");
        assert!(manifest.check_schema().is_ok());
    }

    #[test]
    fn test_reordered_columns_are_rejected() {
        let mut manifest = ModelManifest::for_current_schema("m2");
        manifest.features.swap(0, 1);
        assert!(matches!(
            manifest.check_schema(),
            Err(ScoreError::SchemaMismatch { model_version, .. }) if model_version == "m2"
        ));
    }

    #[test]
    fn test_schema_version_is_checked() {
        let mut manifest = ModelManifest::for_current_schema("m3");
        manifest.schema_version += 1;
        assert!(manifest.check_schema().is_err());
    }

    #[test]
    fn test_encode_categories_by_vocabulary_index() {
        let mut manifest = ModelManifest::for_current_schema("m4");
        manifest.vocabularies.insert(
            "category".to_string(),
            vec!["grocery_pos".to_string(), "shopping_net".to_string()],
        );
        manifest
            .vocabularies
            .insert("gender".to_string(), vec!["F".to_string(), "M".to_string()]);

        let features = FeatureTransformer::new()
            .transform(&sample_event("tx_1"))
            .unwrap();
        let encoded = FeatureEncoder::from_manifest(&manifest).encode(&features);

        assert_eq!(encoded.len(), FeatureVector::feature_count());
        assert_eq!(encoded[0], 1.0); // shopping_net
        assert_eq!(encoded[1], -1.0); // job has no vocabulary
        assert_eq!(encoded[2], 0.0); // F
        assert_eq!(encoded[3], 120_000.0);
    }

    #[test]
    fn test_load_from_file() {
        let manifest = ModelManifest::for_current_schema("2024.03-catboost");
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&serde_json::to_vec(&manifest).unwrap())
            .unwrap();

        let loaded = ModelManifest::load(file.path()).unwrap();
        assert_eq!(loaded.version, "2024.03-catboost");
        assert_eq!(loaded.unknown_category, -1.0);
        assert!(loaded.check_schema().is_ok());
    }
}
