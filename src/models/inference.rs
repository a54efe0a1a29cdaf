//! Classifier abstraction and its ONNX Runtime implementation

use anyhow::{Context, Result};
use ort::memory::Allocator;
use ort::session::Session;
use ort::value::{DynMapValueType, DynSequenceValueType, DowncastableTarget};
use std::sync::Mutex;
use tracing::{debug, warn};

/// A trained binary classifier. Returns the probability of the positive class.
pub trait Classifier: Send + Sync {
    fn predict_proba(&self, input: &[f32]) -> Result<f64>;
}

/// Classifier backed by an ONNX Runtime session
pub struct OnnxClassifier {
    /// Model name, for logs
    name: String,
    /// `Session::run` needs exclusive access
    session: Mutex<Session>,
    /// Input name for the model
    input_name: String,
    /// Output name for probabilities
    output_name: String,
}

impl OnnxClassifier {
    pub fn new(name: &str, session: Session) -> Self {
        let input_name = session
            .inputs
            .first()
            .map(|i| i.name.clone())
            .unwrap_or_else(|| "float_input".to_string());

        let output_name = session
            .outputs
            .iter()
            .find(|o| o.name.contains("prob") || o.name.contains("output"))
            .map(|o| o.name.clone())
            .unwrap_or_else(|| {
                session
                    .outputs
                    .last()
                    .map(|o| o.name.clone())
                    .unwrap_or_else(|| "probabilities".to_string())
            });

        Self {
            name: name.to_string(),
            session: Mutex::new(session),
            input_name,
            output_name,
        }
    }

    pub fn input_name(&self) -> &str {
        &self.input_name
    }

    pub fn output_name(&self) -> &str {
        &self.output_name
    }

    /// Extract fraud probability from model output.
    /// Handles tensor outputs (XGBoost, RandomForest) and seq(map) outputs (CatBoost, LightGBM)
    fn extract_probability(&self, outputs: &ort::session::SessionOutputs) -> Result<f64> {
        if let Some(output) = outputs.get(self.output_name.as_str()) {
            let dtype = output.dtype();

            if let Ok((shape, data)) = output.try_extract_tensor::<f32>() {
                let prob = fraud_prob_from_tensor(shape, data)?;
                debug!(model = %self.name, prob = prob, "Extracted from tensor");
                return Ok(prob);
            }

            if DynSequenceValueType::can_downcast(&dtype) {
                if let Ok(prob) = self.extract_from_sequence_map(output) {
                    return Ok(prob);
                }
            }
        }

        // Fallback: any non-label output we know how to read
        for (name, output) in outputs.iter() {
            if name.contains("label") {
                continue;
            }

            let dtype = output.dtype();

            if let Ok((shape, data)) = output.try_extract_tensor::<f32>() {
                let prob = fraud_prob_from_tensor(shape, data)?;
                debug!(model = %self.name, output = %name, prob = prob, "Extracted from tensor (fallback)");
                return Ok(prob);
            }

            if DynSequenceValueType::can_downcast(&dtype) {
                if let Ok(prob) = self.extract_from_sequence_map(&output) {
                    return Ok(prob);
                }
            }
        }

        warn!(model = %self.name, "Model produced no readable probability output");
        anyhow::bail!("no probability output found for model {}", self.name)
    }

    /// Extract probability from seq(map(int64, float)) format
    fn extract_from_sequence_map(&self, output: &ort::value::DynValue) -> Result<f64> {
        let allocator = Allocator::default();

        let sequence = output
            .downcast_ref::<DynSequenceValueType>()
            .map_err(|e| anyhow::anyhow!("Failed to downcast to sequence: {}", e))?;

        let maps = sequence.try_extract_sequence::<DynMapValueType>(&allocator)?;
        let map_value = maps
            .first()
            .ok_or_else(|| anyhow::anyhow!("Empty sequence"))?;

        let kv_pairs = map_value.try_extract_key_values::<i64, f32>()?;

        if let Some((_, prob)) = kv_pairs.iter().find(|(class_id, _)| *class_id == 1) {
            debug!(model = %self.name, prob = *prob, "Extracted from seq(map)");
            return Ok(*prob as f64);
        }
        if let Some((_, prob)) = kv_pairs.iter().find(|(class_id, _)| *class_id == 0) {
            return Ok(1.0 - *prob as f64);
        }

        Err(anyhow::anyhow!("No probability found in map"))
    }
}

impl Classifier for OnnxClassifier {
    fn predict_proba(&self, input: &[f32]) -> Result<f64> {
        use ort::value::Tensor;

        // Shape [1, num_features]
        let shape = vec![1_i64, input.len() as i64];
        let input_tensor =
            Tensor::from_array((shape, input.to_vec())).context("Failed to create input tensor")?;

        let mut session = self
            .session
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        let outputs = session.run(ort::inputs![self.input_name.as_str() => input_tensor])?;

        self.extract_probability(&outputs)
    }
}

/// Class-1 probability from `[batch, classes]`, `[classes]` or `[batch, 1]` data
fn fraud_prob_from_tensor(shape: &ort::tensor::Shape, data: &[f32]) -> Result<f64> {
    let dims: Vec<i64> = shape.iter().copied().collect();
    let classes = dims.last().copied().unwrap_or(0);

    let value = match (dims.len(), classes) {
        (1 | 2, c) if c >= 2 => data.get(1),
        (1 | 2, 1) => data.first(),
        _ => data.last(),
    };

    value
        .map(|&v| v as f64)
        .ok_or_else(|| anyhow::anyhow!("empty output tensor with shape {:?}", dims))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Classifier returning a fixed probability
    pub(crate) struct FixedClassifier {
        pub probability: f64,
        pub calls: AtomicUsize,
    }

    impl FixedClassifier {
        pub(crate) fn new(probability: f64) -> Self {
            Self {
                probability,
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl Classifier for FixedClassifier {
        fn predict_proba(&self, _input: &[f32]) -> Result<f64> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.probability)
        }
    }

    /// Classifier that blocks for a while and tracks how many calls overlap
    pub(crate) struct SlowClassifier {
        pub probability: f64,
        pub delay: std::time::Duration,
        pub calls: Arc<AtomicUsize>,
        pub active: Arc<AtomicUsize>,
        pub peak: Arc<AtomicUsize>,
    }

    impl SlowClassifier {
        pub(crate) fn new(probability: f64, delay: std::time::Duration) -> Self {
            Self {
                probability,
                delay,
                calls: Arc::new(AtomicUsize::new(0)),
                active: Arc::new(AtomicUsize::new(0)),
                peak: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl Classifier for SlowClassifier {
        fn predict_proba(&self, _input: &[f32]) -> Result<f64> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(self.probability)
        }
    }

    #[test]
    fn test_fixed_classifier_counts_calls() {
        let classifier = FixedClassifier::new(0.25);
        assert_eq!(classifier.predict_proba(&[0.0; 3]).unwrap(), 0.25);
        assert_eq!(classifier.calls.load(Ordering::SeqCst), 1);
    }
}
