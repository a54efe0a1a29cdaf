//! Fraud Scoring Pipeline - Main Entry Point
//!
//! Consumes transactions from JetStream, scores them with the ONNX model,
//! routes them to the outcome stores and publishes fraud alerts.

use anyhow::{Context, Result};
use fraud_scoring_pipeline::{
    alerting::AlertDispatcher,
    config::{AppConfig, LoggingConfig},
    consumer::{ensure_stream, TransactionConsumer},
    metrics::{MetricsReporter, PipelineMetrics},
    models::{FileModelSource, ModelLoader, ModelRegistry, ModelReloader, RiskScorer},
    processor::{EventPipeline, StreamProcessor},
    producer::AlertProducer,
    router::OutcomeRouter,
    sinks::{JetStreamDeadLetters, KvLedger, KvStore},
    transformer::FeatureTransformer,
    ProcessorError,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn init_logging(logging: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| {
        EnvFilter::try_new(format!("fraud_scoring_pipeline={}", logging.level))
    })?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.format == "pretty" {
        builder.pretty().init();
    } else {
        builder.json().init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = AppConfig::load()?;
    init_logging(&config.logging)?;

    info!("Starting Fraud Scoring Pipeline");
    info!(
        "Detection threshold: {:.2}, Alert levels: medium>={:.2}, high>={:.2}, critical>={:.2}",
        config.detection.threshold,
        config.detection.risk_levels.medium,
        config.detection.risk_levels.high,
        config.detection.risk_levels.critical
    );

    let shutdown = CancellationToken::new();
    let metrics = Arc::new(PipelineMetrics::new());

    info!(
        "Feature transformer initialized ({} features)",
        FeatureTransformer::new().feature_count()
    );

    // Load the model; a schema mismatch here surfaces on the first event
    let loader = ModelLoader::with_threads(config.model.onnx_threads)?;
    let paths = config.model.paths();
    let registry = Arc::new(ModelRegistry::new());
    match loader.load(&paths) {
        Ok(model) => {
            if let Err(e) = model.check_schema() {
                warn!(error = %e, "Loaded model does not match the feature schema");
            }
            registry.install(model);
        }
        Err(e) if config.model.reload_interval_secs > 0 => {
            error!(
                error = %format!("{e:#}"),
                path = %paths.onnx.display(),
                "Model not loaded, events wait until the reloader installs one"
            );
        }
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to load model from {}", paths.onnx.display()))
        }
    }
    let scorer = Arc::new(RiskScorer::new(registry.clone(), config.detection.threshold));

    // Connect to NATS
    let client = async_nats::connect(&config.nats.url)
        .await
        .with_context(|| format!("Failed to connect to NATS at {}", config.nats.url))?;
    info!("Connected to NATS at {}", config.nats.url);
    let js = async_nats::jetstream::new(client.clone());

    let sink_timeout = config.pipeline.sink_timeout();
    let positive = Arc::new(KvStore::open(&js, &config.stores.positive_bucket).await?);
    let negative = Arc::new(KvStore::open(&js, &config.stores.negative_bucket).await?);
    let ledger = Arc::new(
        KvLedger::open(&js, &config.stores.alert_ledger_bucket)
            .await?
            .with_claim_ttl(config.alerts.claim_ttl()),
    );
    ensure_stream(
        &js,
        &config.nats.dead_letter_stream,
        vec![config.nats.dead_letter_subject.clone()],
    )
    .await?;
    let dead_letters = Arc::new(JetStreamDeadLetters::new(
        js.clone(),
        &config.nats.dead_letter_subject,
    ));
    let producer = Arc::new(AlertProducer::new(client.clone(), &config.nats.alert_subject));
    info!("Publishing alerts to: {}", producer.subject());

    let pipeline = EventPipeline::new(
        scorer,
        OutcomeRouter::new(positive, negative, sink_timeout),
        AlertDispatcher::new(
            producer,
            ledger,
            config.detection.risk_levels.clone(),
            config.alerts.retry_policy(),
            config.alerts.timeout(),
        ),
        dead_letters,
        metrics.clone(),
    )
    .with_scoring_limits(
        config.pipeline.max_concurrent_scoring,
        config.pipeline.score_timeout(),
    )
    .with_model_retry(config.pipeline.model_retry())
    .with_route_retry(config.pipeline.route_retry())
    .with_sink_timeout(sink_timeout);

    // Background tasks
    let mut background = Vec::new();
    if config.model.reload_interval_secs > 0 {
        let reloader = ModelReloader::new(
            FileModelSource::new(loader, paths),
            registry.clone(),
            Duration::from_secs(config.model.reload_interval_secs),
            shutdown.clone(),
        );
        background.push(tokio::spawn(reloader.run()));
    }
    let reporter = MetricsReporter::new(
        metrics.clone(),
        config.pipeline.metrics_interval_secs,
        shutdown.clone(),
    );
    background.push(tokio::spawn(reporter.start()));

    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown requested"),
            Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
        }
        ctrl_c.cancel();
    });

    let consumer = TransactionConsumer::connect(&js, &config.nats).await?;
    info!("Consuming as durable consumer {}", consumer.durable_name());

    let processor = StreamProcessor::new(
        pipeline,
        config.pipeline.processor_settings(),
        shutdown.clone(),
    );
    let result = processor.run(consumer).await;

    shutdown.cancel();
    for task in background {
        if let Err(e) = task.await {
            warn!(error = %e, "Background task failed");
        }
    }

    info!("Pipeline shutting down...");
    metrics.print_summary();

    match result {
        Ok(position) => {
            info!(
                position = position.position,
                committed = position.committed,
                "Pipeline stopped"
            );
            Ok(())
        }
        Err(e @ ProcessorError::Score(_)) | Err(e @ ProcessorError::DeadLetter { .. }) => {
            error!(error = %e, "Ingestion halted");
            Err(e.into())
        }
        Err(e) => Err(anyhow::Error::new(e).context("Transaction stream failed")),
    }
}
