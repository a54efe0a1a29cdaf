//! Configuration management for the scoring pipeline.
//!
//! Settings come from a TOML file (`config/config.toml`, or the path in
//! `FRAUD_CONFIG`) overlaid with `FRAUD__SECTION__KEY` environment variables.

use crate::consumer::StartFrom;
use crate::models::loader::ModelPaths;
use crate::models::scorer::DEFAULT_THRESHOLD;
use crate::processor::{ProcessorSettings, RetryPolicy};
use crate::types::alert::RiskLevelThresholds;
use anyhow::{bail, Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable holding the configuration file path
pub const CONFIG_PATH_ENV: &str = "FRAUD_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config/config.toml";

/// Main application configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub nats: NatsConfig,
    pub model: ModelConfig,
    pub detection: DetectionConfig,
    pub stores: StoresConfig,
    pub alerts: AlertsConfig,
    pub pipeline: PipelineConfig,
    pub logging: LoggingConfig,
}

/// NATS and JetStream configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NatsConfig {
    /// NATS server URL
    pub url: String,
    /// JetStream stream holding incoming transactions
    pub stream: String,
    /// Subject for incoming transactions
    pub transaction_subject: String,
    /// Durable consumer name; the consumption position survives restarts
    pub durable_name: String,
    /// Where a newly created consumer starts: "all" or "new"
    pub start_from: StartFrom,
    /// Seconds before an unacknowledged delivery is redelivered
    pub ack_wait_secs: u64,
    /// Maximum deliveries in flight without acknowledgement
    pub max_ack_pending: i64,
    /// Subject for outgoing fraud alerts
    pub alert_subject: String,
    /// JetStream stream holding dead letters
    pub dead_letter_stream: String,
    pub dead_letter_subject: String,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            stream: "TRANSACTIONS".to_string(),
            transaction_subject: "transactions".to_string(),
            durable_name: "fraud-scorer".to_string(),
            start_from: StartFrom::All,
            ack_wait_secs: 60,
            max_ack_pending: 1024,
            alert_subject: "fraud.alerts".to_string(),
            dead_letter_stream: "TRANSACTIONS_DLQ".to_string(),
            dead_letter_subject: "transactions.dlq".to_string(),
        }
    }
}

/// Model artifact configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Path to the ONNX file
    pub path: PathBuf,
    /// Manifest path; defaults to the ONNX path with a `.json` extension
    pub manifest: Option<PathBuf>,
    /// Number of threads for ONNX inference (default: 1)
    pub onnx_threads: usize,
    /// Seconds between checks for a new artifact; 0 disables hot reload
    pub reload_interval_secs: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("models/fraud_model.onnx"),
            manifest: None,
            onnx_threads: 1,
            reload_interval_secs: 30,
        }
    }
}

impl ModelConfig {
    pub fn paths(&self) -> ModelPaths {
        ModelPaths::new(&self.path, self.manifest.clone())
    }
}

/// Detection configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Probabilities at or above this value are classified as fraud
    pub threshold: f64,
    /// Risk level classification thresholds
    pub risk_levels: RiskLevelThresholds,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            risk_levels: RiskLevelThresholds::default(),
        }
    }
}

/// Key-value buckets for outcomes and alert deduplication
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoresConfig {
    pub positive_bucket: String,
    pub negative_bucket: String,
    pub alert_ledger_bucket: String,
}

impl Default for StoresConfig {
    fn default() -> Self {
        Self {
            positive_bucket: "fraud_alerts".to_string(),
            negative_bucket: "non_fraud".to_string(),
            alert_ledger_bucket: "fraud_alerts_sent".to_string(),
        }
    }
}

/// Notification retry configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AlertsConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Timeout for each send and ledger call
    pub timeout_ms: u64,
    /// Age after which an unconfirmed claim may be taken over; 0 disables
    pub claim_ttl_secs: u64,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 200,
            max_backoff_ms: 2000,
            timeout_ms: 2000,
            claim_ttl_secs: 600,
        }
    }
}

impl AlertsConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.initial_backoff_ms),
            Duration::from_millis(self.max_backoff_ms),
        )
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn claim_ttl(&self) -> Option<Duration> {
        (self.claim_ttl_secs > 0).then(|| Duration::from_secs(self.claim_ttl_secs))
    }
}

/// Pipeline configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Number of worker lanes
    pub workers: usize,
    /// Capacity of each lane queue
    pub queue_capacity: usize,
    /// Maximum classifier calls in flight
    pub max_concurrent_scoring: usize,
    pub score_timeout_ms: u64,
    pub sink_timeout_ms: u64,
    /// Attempts per store write before the event is dead-lettered
    pub route_max_attempts: u32,
    /// Attempts per event on inference errors before it is dead-lettered
    pub inference_max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Backoff cap while waiting for a model to become available
    pub model_retry_max_backoff_ms: u64,
    pub metrics_interval_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 64,
            max_concurrent_scoring: 4,
            score_timeout_ms: 1000,
            sink_timeout_ms: 2000,
            route_max_attempts: 5,
            inference_max_attempts: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 5000,
            model_retry_max_backoff_ms: 10_000,
            metrics_interval_secs: 30,
        }
    }
}

impl PipelineConfig {
    pub fn processor_settings(&self) -> ProcessorSettings {
        ProcessorSettings {
            workers: self.workers,
            queue_capacity: self.queue_capacity,
            ack_timeout: self.sink_timeout(),
        }
    }

    pub fn route_retry(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.route_max_attempts,
            Duration::from_millis(self.initial_backoff_ms),
            Duration::from_millis(self.max_backoff_ms),
        )
    }

    pub fn model_retry(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.inference_max_attempts,
            Duration::from_millis(self.initial_backoff_ms),
            Duration::from_millis(self.model_retry_max_backoff_ms),
        )
    }

    pub fn score_timeout(&self) -> Duration {
        Duration::from_millis(self.score_timeout_ms)
    }

    pub fn sink_timeout(&self) -> Duration {
        Duration::from_millis(self.sink_timeout_ms)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (json, pretty)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "json".to_string(),
        }
    }
}

impl AppConfig {
    /// Load configuration from `FRAUD_CONFIG` or the default path
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from_path(path)
    }

    /// Load configuration from a specific path, overlaid with the environment
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let config = Config::builder()
            .add_source(File::from(path).required(false))
            .add_source(
                Environment::with_prefix("FRAUD")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("Failed to build configuration from {}", path.display()))?;

        let config: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let threshold = self.detection.threshold;
        if !(0.0..=1.0).contains(&threshold) {
            bail!("detection.threshold must be within [0, 1], got {threshold}");
        }
        if self.pipeline.workers == 0 {
            bail!("pipeline.workers must be at least 1");
        }
        if self.pipeline.max_concurrent_scoring == 0 {
            bail!("pipeline.max_concurrent_scoring must be at least 1");
        }
        if let Some(ttl) = self.alerts.claim_ttl() {
            let sending = self.alerts.timeout() * self.alerts.max_attempts.max(1);
            if ttl <= sending {
                bail!(
                    "alerts.claim_ttl_secs must exceed the time spent sending ({:?}), got {:?}",
                    sending,
                    ttl
                );
            }
        }
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            bail!("logging.format must be \"json\" or \"pretty\", got {:?}", self.logging.format);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.nats.url, "nats://localhost:4222");
        assert_eq!(config.detection.threshold, 0.5);
        assert_eq!(config.stores.positive_bucket, "fraud_alerts");
        assert_eq!(config.stores.negative_bucket, "non_fraud");
        assert_eq!(config.nats.start_from, StartFrom::All);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_partial_file_keeps_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[nats]
url = "nats://broker:4222"
start_from = "new"

[detection]
threshold = 0.61

[pipeline]
workers = 8
"#
        )
        .unwrap();

        let config = AppConfig::load_from_path(file.path()).unwrap();
        assert_eq!(config.nats.url, "nats://broker:4222");
        assert_eq!(config.nats.start_from, StartFrom::New);
        assert_eq!(config.nats.durable_name, "fraud-scorer");
        assert_eq!(config.detection.threshold, 0.61);
        assert_eq!(config.pipeline.workers, 8);
        assert_eq!(config.pipeline.queue_capacity, 64);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_invalid_threshold_is_rejected() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[detection]\nthreshold = 1.5").unwrap();

        let err = AppConfig::load_from_path(file.path()).unwrap_err();
        assert!(format!("{err:#}").contains("threshold"));
    }

    #[test]
    fn test_model_paths_default_manifest() {
        let model = ModelConfig::default();
        assert_eq!(model.paths().manifest, PathBuf::from("models/fraud_model.json"));
    }

    #[test]
    fn test_retry_policies_from_config() {
        let pipeline = PipelineConfig::default();
        assert_eq!(pipeline.route_retry().max_attempts, 5);
        assert_eq!(pipeline.model_retry().max_backoff, Duration::from_secs(10));
        assert_eq!(AlertsConfig::default().retry_policy().max_attempts, 3);
    }

    #[test]
    fn test_claim_ttl_must_outlast_sending() {
        let mut config = AppConfig::default();
        assert_eq!(config.alerts.claim_ttl(), Some(Duration::from_secs(600)));

        config.alerts.claim_ttl_secs = 5;
        config.alerts.timeout_ms = 2000;
        config.alerts.max_attempts = 3;
        assert!(config.validate().is_err());

        config.alerts.claim_ttl_secs = 0;
        assert_eq!(config.alerts.claim_ttl(), None);
        assert!(config.validate().is_ok());
    }
}
