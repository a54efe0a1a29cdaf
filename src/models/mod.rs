//! ML model loading, versioning and scoring

pub mod inference;
pub mod loader;
pub mod manifest;
pub mod registry;
pub mod scorer;

pub use inference::{Classifier, OnnxClassifier};
pub use loader::{FileModelSource, ModelLoader, ModelPaths, ModelReloader, ModelSource};
pub use manifest::ModelManifest;
pub use registry::{Model, ModelRegistry};
pub use scorer::RiskScorer;
