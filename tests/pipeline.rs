//! End-to-end processor runs over in-memory collaborators

use async_trait::async_trait;
use fraud_scoring_pipeline::alerting::{AlertDispatcher, Notifier};
use fraud_scoring_pipeline::consumer::MemorySource;
use fraud_scoring_pipeline::errors::NotifyError;
use fraud_scoring_pipeline::metrics::PipelineMetrics;
use fraud_scoring_pipeline::models::{Classifier, Model, ModelManifest, ModelRegistry, RiskScorer};
use fraud_scoring_pipeline::processor::{
    EventPipeline, ProcessorSettings, RetryPolicy, StreamProcessor,
};
use fraud_scoring_pipeline::router::OutcomeRouter;
use fraud_scoring_pipeline::sinks::{MemoryDeadLetters, MemoryLedger, MemoryStore};
use fraud_scoring_pipeline::types::{FraudAlert, OutcomeRecord, RiskLevelThresholds};
use serde_json::json;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Index of `log_amt` in the encoded input
const LOG_AMT: usize = 8;

/// Flags transactions above the large-amount cutoff
struct AmountClassifier;

impl Classifier for AmountClassifier {
    fn predict_proba(&self, input: &[f32]) -> anyhow::Result<f64> {
        Ok(if input[LOG_AMT] > 201f32.ln() { 0.92 } else { 0.08 })
    }
}

struct ConstantClassifier(f64);

impl Classifier for ConstantClassifier {
    fn predict_proba(&self, _input: &[f32]) -> anyhow::Result<f64> {
        Ok(self.0)
    }
}

/// Constant score that takes a moment per call
struct PacedClassifier {
    probability: f64,
    pause: Duration,
}

impl Classifier for PacedClassifier {
    fn predict_proba(&self, _input: &[f32]) -> anyhow::Result<f64> {
        std::thread::sleep(self.pause);
        Ok(self.probability)
    }
}

#[derive(Default)]
struct CollectingNotifier {
    alerts: Mutex<Vec<FraudAlert>>,
}

#[async_trait]
impl Notifier for CollectingNotifier {
    async fn send(&self, alert: &FraudAlert) -> Result<(), NotifyError> {
        self.alerts.lock().unwrap().push(alert.clone());
        Ok(())
    }
}

struct Harness {
    processor: StreamProcessor,
    registry: Arc<ModelRegistry>,
    positive: Arc<MemoryStore>,
    negative: Arc<MemoryStore>,
    dead_letters: Arc<MemoryDeadLetters>,
    notifier: Arc<CollectingNotifier>,
    metrics: Arc<PipelineMetrics>,
}

fn harness(classifier: Box<dyn Classifier>, version: &str) -> Harness {
    let registry = Arc::new(ModelRegistry::with_model(Model::new(
        ModelManifest::for_current_schema(version),
        classifier,
    )));
    let positive = Arc::new(MemoryStore::new("fraud_alerts"));
    let negative = Arc::new(MemoryStore::new("non_fraud"));
    let dead_letters = Arc::new(MemoryDeadLetters::new());
    let notifier = Arc::new(CollectingNotifier::default());
    let metrics = Arc::new(PipelineMetrics::new());
    let retry = RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(4));

    let pipeline = EventPipeline::new(
        Arc::new(RiskScorer::new(registry.clone(), 0.5)),
        OutcomeRouter::new(positive.clone(), negative.clone(), Duration::from_secs(1)),
        AlertDispatcher::new(
            notifier.clone(),
            Arc::new(MemoryLedger::new()),
            RiskLevelThresholds::default(),
            retry,
            Duration::from_secs(1),
        ),
        dead_letters.clone(),
        metrics.clone(),
    )
    .with_scoring_limits(2, Duration::from_secs(1))
    .with_model_retry(retry)
    .with_route_retry(retry);

    Harness {
        processor: StreamProcessor::new(
            pipeline,
            ProcessorSettings {
                workers: 4,
                queue_capacity: 8,
                ..Default::default()
            },
            CancellationToken::new(),
        ),
        registry,
        positive,
        negative,
        dead_letters,
        notifier,
        metrics,
    }
}

fn payload(tx_id: &str, card: &str, amount: f64) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "transaction_id": tx_id,
        "trans_date_trans_time": "2024-03-15 14:30:00",
        "cc_num": card,
        "amt": amount,
        "category": "grocery_pos",
        "job": "Surveyor, land",
        "gender": "M",
        "merchant": "fraud_Rippin, Kub and Mann",
        "lat": 40.0,
        "long": -75.0,
        "merch_lat": 40.1,
        "merch_long": -75.1,
        "city_pop": 3495,
        "dob": "1985-07-21",
        "street": "351 Darlene Green",
        "city": "Columbia",
        "state": "SC"
    }))
    .unwrap()
}

fn stored(store: &MemoryStore, key: &str) -> OutcomeRecord {
    serde_json::from_slice(&store.get(key).unwrap()).unwrap()
}

#[tokio::test]
async fn scores_routes_and_alerts_a_mixed_stream() {
    let h = harness(Box::new(AmountClassifier), "amount-v1");
    let mut payloads = Vec::new();
    for i in 0..30 {
        let amount = if i % 5 == 0 { 950.0 } else { 42.5 };
        payloads.push(payload(&format!("tx_{i}"), &format!("card_{}", i % 7), amount));
    }
    payloads.push(b"not json at all".to_vec());
    let source = MemorySource::new(payloads);
    let acked = source.acked();

    let position = h.processor.run(source).await.unwrap();

    assert_eq!(position.position, 31);
    assert_eq!(*acked.lock().unwrap(), (1..=31).collect::<Vec<u64>>());
    assert_eq!(h.positive.len(), 6);
    assert_eq!(h.negative.len(), 24);
    assert_eq!(h.dead_letters.letters().len(), 1);

    let record = stored(&h.positive, "tx_5");
    assert!(record.is_fraud);
    assert_eq!(record.model_version, "amount-v1");
    assert_eq!(record.event.amt, 950.0);

    let mut alerted: Vec<String> = h
        .notifier
        .alerts
        .lock()
        .unwrap()
        .iter()
        .map(|a| a.transaction_id.clone())
        .collect();
    alerted.sort();
    assert_eq!(alerted, vec!["tx_0", "tx_10", "tx_15", "tx_20", "tx_25", "tx_5"]);
    assert_eq!(h.metrics.skipped.load(Ordering::Relaxed), 1);
    assert_eq!(h.metrics.fraud.load(Ordering::Relaxed), 6);
}

#[tokio::test]
async fn redelivery_after_restart_is_idempotent() {
    let h = harness(Box::new(ConstantClassifier(0.97)), "v1");
    let batch: Vec<Vec<u8>> = (0..5).map(|i| payload(&format!("tx_{i}"), "card_1", 999.0)).collect();

    h.processor.run(MemorySource::new(batch.clone())).await.unwrap();
    // Same deliveries again, as after a crash before commit
    h.processor.run(MemorySource::new(batch)).await.unwrap();

    assert_eq!(h.positive.len(), 5);
    assert_eq!(h.positive.writes(), 10);
    assert_eq!(h.notifier.alerts.lock().unwrap().len(), 5);
}

#[tokio::test]
async fn model_swap_never_mixes_versions_within_an_event() {
    let pause = Duration::from_millis(1);
    let h = harness(
        Box::new(PacedClassifier {
            probability: 0.1,
            pause,
        }),
        "legit-model",
    );
    let payloads: Vec<Vec<u8>> = (0..200)
        .map(|i| payload(&format!("tx_{i}"), &format!("card_{}", i % 13), 10.0))
        .collect();

    // Swap once a quarter of the stream is committed
    let registry = h.registry.clone();
    let mut position = h.processor.position();
    let swapper = tokio::spawn(async move {
        loop {
            let committed = position.borrow().committed;
            if committed >= 50 {
                break;
            }
            if position.changed().await.is_err() {
                return;
            }
        }
        registry.install(Model::new(
            ModelManifest::for_current_schema("fraud-model"),
            Box::new(PacedClassifier {
                probability: 0.9,
                pause,
            }),
        ));
    });

    h.processor.run(MemorySource::new(payloads)).await.unwrap();
    swapper.await.unwrap();

    assert_eq!(h.positive.len() + h.negative.len(), 200);
    assert!(h.negative.len() >= 50, "swap happened too early");
    assert!(!h.positive.is_empty(), "swap never took effect");
    for i in 0..200 {
        let key = format!("tx_{i}");
        let record = match h.positive.get(&key) {
            Some(_) => stored(&h.positive, &key),
            None => stored(&h.negative, &key),
        };
        assert_eq!(record.is_fraud, record.model_version == "fraud-model");
        let expected_probability = if record.is_fraud { 0.9 } else { 0.1 };
        assert_eq!(record.fraud_probability, expected_probability);
    }
}
