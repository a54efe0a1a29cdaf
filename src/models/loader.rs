//! ONNX model loader and hot reloader

use crate::models::inference::OnnxClassifier;
use crate::models::manifest::ModelManifest;
use crate::models::registry::{Model, ModelRegistry};
use anyhow::{Context, Result};
use ort::session::{builder::GraphOptimizationLevel, Session};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Location of a model artifact and its manifest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelPaths {
    pub onnx: PathBuf,
    pub manifest: PathBuf,
}

impl ModelPaths {
    /// Manifest defaults to the artifact path with a `.json` extension
    pub fn new(onnx: impl Into<PathBuf>, manifest: Option<PathBuf>) -> Self {
        let onnx = onnx.into();
        let manifest = manifest.unwrap_or_else(|| onnx.with_extension("json"));
        Self { onnx, manifest }
    }

    /// Latest modification time of either file
    pub fn modified(&self) -> Result<SystemTime> {
        let onnx = std::fs::metadata(&self.onnx)
            .and_then(|m| m.modified())
            .with_context(|| format!("Failed to stat {}", self.onnx.display()))?;
        let manifest = std::fs::metadata(&self.manifest)
            .and_then(|m| m.modified())
            .with_context(|| format!("Failed to stat {}", self.manifest.display()))?;
        Ok(onnx.max(manifest))
    }
}

/// Builds [`Model`]s from ONNX artifacts
#[derive(Debug, Clone)]
pub struct ModelLoader {
    /// Number of threads for ONNX inference
    onnx_threads: usize,
}

impl ModelLoader {
    /// Create a new model loader with specified number of threads
    pub fn with_threads(onnx_threads: usize) -> Result<Self> {
        ort::init().commit()?;
        info!(onnx_threads = onnx_threads, "ONNX Runtime initialized");
        Ok(Self { onnx_threads })
    }

    /// Load the artifact and manifest into a model
    pub fn load(&self, paths: &ModelPaths) -> Result<Model> {
        let manifest = ModelManifest::load(&paths.manifest)?;
        let name = paths
            .onnx
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("model")
            .to_string();

        info!(
            model = %name,
            version = %manifest.version,
            schema_version = manifest.schema_version,
            path = %paths.onnx.display(),
            threads = self.onnx_threads,
            "Loading ONNX model"
        );

        let session = self.open_session(&paths.onnx)?;
        let classifier = OnnxClassifier::new(&name, session);

        info!(
            model = %name,
            version = %manifest.version,
            input = %classifier.input_name(),
            output = %classifier.output_name(),
            "Model loaded successfully"
        );

        Ok(Model::new(manifest, Box::new(classifier)))
    }

    fn open_session(&self, path: &Path) -> Result<Session> {
        Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(self.onnx_threads)?
            .commit_from_file(path)
            .with_context(|| format!("Failed to load model from {:?}", path))
    }
}

/// Source of new model versions for the reloader
pub trait ModelSource: Send + Sync + 'static {
    fn modified(&self) -> Result<SystemTime>;
    fn load(&self) -> Result<Model>;
}

/// ONNX artifact on disk
pub struct FileModelSource {
    loader: ModelLoader,
    paths: ModelPaths,
}

impl FileModelSource {
    pub fn new(loader: ModelLoader, paths: ModelPaths) -> Self {
        Self { loader, paths }
    }
}

impl ModelSource for FileModelSource {
    fn modified(&self) -> Result<SystemTime> {
        self.paths.modified()
    }

    fn load(&self) -> Result<Model> {
        self.loader.load(&self.paths)
    }
}

/// Polls a model source and swaps new versions into the registry.
///
/// A new version whose schema does not match the transformer is rejected and
/// the running version keeps serving.
pub struct ModelReloader<S: ModelSource> {
    source: Arc<S>,
    registry: Arc<ModelRegistry>,
    interval: Duration,
    shutdown: CancellationToken,
    last_modified: Option<SystemTime>,
}

impl<S: ModelSource> ModelReloader<S> {
    pub fn new(
        source: S,
        registry: Arc<ModelRegistry>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        let last_modified = source.modified().ok();
        Self {
            source: Arc::new(source),
            registry,
            interval,
            shutdown,
            last_modified,
        }
    }

    pub async fn run(mut self) {
        info!(interval_secs = self.interval.as_secs(), "Model reloader started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("Model reloader: shutdown requested");
                    break;
                }
                _ = ticker.tick() => {
                    self.poll().await;
                }
            }
        }
    }

    /// Check the source once; returns true when a new version was installed
    pub async fn poll(&mut self) -> bool {
        let modified = match self.source.modified() {
            Ok(modified) => modified,
            Err(e) => {
                error!(error = %e, "Failed to check model artifact");
                return false;
            }
        };
        if self.last_modified == Some(modified) {
            debug!("Model artifact unchanged");
            return false;
        }

        let source = self.source.clone();
        let loaded = tokio::task::spawn_blocking(move || source.load()).await;
        let model = match loaded {
            Ok(Ok(model)) => model,
            Ok(Err(e)) => {
                error!(error = %format!("{e:#}"), "Failed to reload model, keeping current version");
                return false;
            }
            Err(e) => {
                error!(error = %e, "Model reload task panicked");
                return false;
            }
        };
        self.last_modified = Some(modified);

        if let Err(e) = model.check_schema() {
            error!(
                version = %model.version(),
                current = self.registry.current_version().as_deref().unwrap_or("none"),
                error = %e,
                "Rejected new model version"
            );
            return false;
        }

        self.registry.install(model);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::inference::tests::FixedClassifier;
    use std::sync::Mutex;

    struct StubSource {
        state: Mutex<(SystemTime, ModelManifest)>,
    }

    impl StubSource {
        fn new(version: &str) -> Self {
            Self {
                state: Mutex::new((SystemTime::UNIX_EPOCH, ModelManifest::for_current_schema(version))),
            }
        }

        fn publish(&self, manifest: ModelManifest) {
            let mut state = self.state.lock().unwrap();
            state.0 += Duration::from_secs(1);
            state.1 = manifest;
        }
    }

    impl ModelSource for Arc<StubSource> {
        fn modified(&self) -> Result<SystemTime> {
            Ok(self.state.lock().unwrap().0)
        }

        fn load(&self) -> Result<Model> {
            let manifest = self.state.lock().unwrap().1.clone();
            Ok(Model::new(manifest, Box::new(FixedClassifier::new(0.3))))
        }
    }

    #[test]
    fn test_manifest_path_defaults_next_to_artifact() {
        let paths = ModelPaths::new("saved_models/catboost.onnx", None);
        assert_eq!(paths.manifest, PathBuf::from("saved_models/catboost.json"));
    }

    #[tokio::test]
    async fn test_reloader_installs_new_versions() {
        let source = Arc::new(StubSource::new("v1"));
        let registry = Arc::new(ModelRegistry::with_model(source.load().unwrap()));
        let mut reloader = ModelReloader::new(
            source.clone(),
            registry.clone(),
            Duration::from_secs(60),
            CancellationToken::new(),
        );

        assert!(!reloader.poll().await);

        source.publish(ModelManifest::for_current_schema("v2"));
        assert!(reloader.poll().await);
        assert_eq!(registry.current_version().as_deref(), Some("v2"));
    }

    #[tokio::test]
    async fn test_reloader_rejects_schema_drift() {
        let source = Arc::new(StubSource::new("v1"));
        let registry = Arc::new(ModelRegistry::with_model(source.load().unwrap()));
        let mut reloader = ModelReloader::new(
            source.clone(),
            registry.clone(),
            Duration::from_secs(60),
            CancellationToken::new(),
        );

        let mut drifted = ModelManifest::for_current_schema("v2");
        drifted.features.truncate(3);
        source.publish(drifted);

        assert!(!reloader.poll().await);
        assert_eq!(registry.current_version().as_deref(), Some("v1"));
    }
}
