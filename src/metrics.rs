//! Performance metrics and statistics tracking for the scoring pipeline.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Metrics collector for pipeline performance
pub struct PipelineMetrics {
    /// Events scored and routed
    pub transactions_processed: AtomicU64,
    pub legit: AtomicU64,
    pub fraud: AtomicU64,
    /// Malformed events skipped at the transform stage
    pub skipped: AtomicU64,
    /// Events parked after exhausting retries
    pub dead_lettered: AtomicU64,
    pub alerts_sent: AtomicU64,
    pub alerts_suppressed: AtomicU64,
    pub alerts_failed: AtomicU64,
    pub model_unavailable_retries: AtomicU64,
    pub inference_retries: AtomicU64,
    pub route_retries: AtomicU64,
    /// Alerts by risk level
    alerts_by_level: RwLock<HashMap<String, u64>>,
    /// End-to-end processing times (in microseconds)
    processing_times: RwLock<Vec<u64>>,
    /// Inference times per model version (in microseconds)
    model_times: RwLock<HashMap<String, Vec<u64>>>,
    /// Fraud probability distribution buckets
    score_buckets: RwLock<[u64; 10]>,
    /// Start time for rate calculation
    start_time: Instant,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self {
            transactions_processed: AtomicU64::new(0),
            legit: AtomicU64::new(0),
            fraud: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
            alerts_sent: AtomicU64::new(0),
            alerts_suppressed: AtomicU64::new(0),
            alerts_failed: AtomicU64::new(0),
            model_unavailable_retries: AtomicU64::new(0),
            inference_retries: AtomicU64::new(0),
            route_retries: AtomicU64::new(0),
            alerts_by_level: RwLock::new(HashMap::new()),
            processing_times: RwLock::new(Vec::with_capacity(1000)),
            model_times: RwLock::new(HashMap::new()),
            score_buckets: RwLock::new([0; 10]),
            start_time: Instant::now(),
        }
    }

    /// Record a scored and routed transaction
    pub fn record_transaction(&self, processing_time: Duration, probability: f64, is_fraud: bool) {
        self.transactions_processed.fetch_add(1, Ordering::Relaxed);
        if is_fraud {
            self.fraud.fetch_add(1, Ordering::Relaxed);
        } else {
            self.legit.fetch_add(1, Ordering::Relaxed);
        }

        if let Ok(mut times) = self.processing_times.write() {
            times.push(processing_time.as_micros() as u64);
            // Keep only last 10000 for memory efficiency
            if times.len() > 10000 {
                times.drain(0..5000);
            }
        }

        let bucket = (probability.clamp(0.0, 1.0) * 10.0).min(9.0) as usize;
        if let Ok(mut buckets) = self.score_buckets.write() {
            buckets[bucket] += 1;
        }
    }

    /// Record a sent alert
    pub fn record_alert(&self, risk_level: &str) {
        self.alerts_sent.fetch_add(1, Ordering::Relaxed);

        if let Ok(mut by_level) = self.alerts_by_level.write() {
            *by_level.entry(risk_level.to_string()).or_insert(0) += 1;
        }
    }

    pub fn record_alert_suppressed(&self) {
        self.alerts_suppressed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_alert_failed(&self) {
        self.alerts_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dead_letter(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_model_unavailable(&self) {
        self.model_unavailable_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_inference_retry(&self) {
        self.inference_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_route_retry(&self) {
        self.route_retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Record model inference time
    pub fn record_model_time(&self, model_version: &str, duration: Duration) {
        if let Ok(mut times) = self.model_times.write() {
            let model_times = times.entry(model_version.to_string()).or_default();
            model_times.push(duration.as_micros() as u64);
            // Keep only last 1000 per model
            if model_times.len() > 1000 {
                model_times.drain(0..500);
            }
        }
    }

    /// Get processing time statistics
    pub fn get_processing_stats(&self) -> ProcessingStats {
        let mut sorted: Vec<u64> = match self.processing_times.read() {
            Ok(times) => times.clone(),
            Err(_) => return ProcessingStats::default(),
        };
        if sorted.is_empty() {
            return ProcessingStats::default();
        }
        sorted.sort_unstable();

        let sum: u64 = sorted.iter().sum();
        let count = sorted.len();

        ProcessingStats {
            count: count as u64,
            mean_us: sum / count as u64,
            p50_us: sorted[count / 2],
            p95_us: sorted[(count as f64 * 0.95) as usize],
            p99_us: sorted[(count as f64 * 0.99) as usize],
            max_us: *sorted.last().unwrap_or(&0),
        }
    }

    /// Get inference stats per model version
    pub fn get_model_stats(&self) -> HashMap<String, ModelStats> {
        let mut stats = HashMap::new();
        let Ok(times) = self.model_times.read() else {
            return stats;
        };

        for (model, model_times) in times.iter() {
            if model_times.is_empty() {
                continue;
            }

            let mut sorted: Vec<u64> = model_times.clone();
            sorted.sort_unstable();

            let sum: u64 = sorted.iter().sum();
            let count = sorted.len();

            stats.insert(
                model.clone(),
                ModelStats {
                    calls: count as u64,
                    mean_us: sum / count as u64,
                    p50_us: sorted[count / 2],
                    p99_us: sorted[(count as f64 * 0.99) as usize],
                },
            );
        }

        stats
    }

    /// Get current throughput (transactions per second)
    pub fn get_throughput(&self) -> f64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.transactions_processed.load(Ordering::Relaxed) as f64 / elapsed
        } else {
            0.0
        }
    }

    pub fn get_score_distribution(&self) -> [u64; 10] {
        self.score_buckets.read().map(|b| *b).unwrap_or_default()
    }

    pub fn get_alerts_by_level(&self) -> HashMap<String, u64> {
        self.alerts_by_level
            .read()
            .map(|by_level| by_level.clone())
            .unwrap_or_default()
    }

    /// Print summary statistics
    pub fn print_summary(&self) {
        let tx_count = self.transactions_processed.load(Ordering::Relaxed);
        let fraud_count = self.fraud.load(Ordering::Relaxed);
        let legit_count = self.legit.load(Ordering::Relaxed);
        let alert_count = self.alerts_sent.load(Ordering::Relaxed);
        let fraud_rate = if tx_count > 0 {
            (fraud_count as f64 / tx_count as f64) * 100.0
        } else {
            0.0
        };

        let processing = self.get_processing_stats();
        let throughput = self.get_throughput();
        let alerts_by_level = self.get_alerts_by_level();
        let score_dist = self.get_score_distribution();

        info!("╔══════════════════════════════════════════════════════════════╗");
        info!("║          FRAUD SCORING PIPELINE - METRICS SUMMARY            ║");
        info!("╠══════════════════════════════════════════════════════════════╣");
        info!(
            "║ Transactions Scored:    {:>8}  │  Throughput: {:>6.1} tx/s ║",
            tx_count, throughput
        );
        info!(
            "║ Fraud / Legit:  {:>8} / {:>8}  │  Fraud Rate: {:>6.1}%     ║",
            fraud_count, legit_count, fraud_rate
        );
        info!(
            "║ Skipped: {:>6}  Dead-lettered: {:>6}                        ║",
            self.skipped.load(Ordering::Relaxed),
            self.dead_lettered.load(Ordering::Relaxed)
        );
        info!(
            "║ Alerts sent: {:>6}  suppressed: {:>6}  failed: {:>6}       ║",
            alert_count,
            self.alerts_suppressed.load(Ordering::Relaxed),
            self.alerts_failed.load(Ordering::Relaxed)
        );
        info!(
            "║ Retries: model={:>6} inference={:>6} route={:>6}            ║",
            self.model_unavailable_retries.load(Ordering::Relaxed),
            self.inference_retries.load(Ordering::Relaxed),
            self.route_retries.load(Ordering::Relaxed)
        );
        info!("╠══════════════════════════════════════════════════════════════╣");
        info!(
            "║ Processing Time (μs): mean={:>5} p50={:>5} p95={:>5} p99={:>5} ║",
            processing.mean_us, processing.p50_us, processing.p95_us, processing.p99_us
        );
        info!("╠══════════════════════════════════════════════════════════════╣");
        info!("║ Alerts by Risk Level:                                        ║");
        for (level, count) in &alerts_by_level {
            let pct = if alert_count > 0 {
                (*count as f64 / alert_count as f64) * 100.0
            } else {
                0.0
            };
            info!("║   {:10}: {:>6} ({:>5.1}%)                                ║", level, count, pct);
        }
        info!("╠══════════════════════════════════════════════════════════════╣");
        info!("║ Fraud Probability Distribution:                              ║");
        let total: u64 = score_dist.iter().sum();
        for (i, &count) in score_dist.iter().enumerate() {
            let pct = if total > 0 { (count as f64 / total as f64) * 100.0 } else { 0.0 };
            let bar_len = (pct / 2.0) as usize;
            let bar: String = "█".repeat(bar_len.min(20));
            info!(
                "║   {:.1}-{:.1}: {:>6} ({:>5.1}%) {}",
                i as f64 / 10.0,
                (i + 1) as f64 / 10.0,
                count,
                pct,
                bar
            );
        }
        info!("╚══════════════════════════════════════════════════════════════╝");

        let model_stats = self.get_model_stats();
        if !model_stats.is_empty() {
            info!("Model Inference Times (μs):");
            for (model, stats) in &model_stats {
                info!(
                    "  {}: mean={} p50={} p99={} (calls={})",
                    model, stats.mean_us, stats.p50_us, stats.p99_us, stats.calls
                );
            }
        }
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Processing time statistics
#[derive(Debug, Default)]
pub struct ProcessingStats {
    pub count: u64,
    pub mean_us: u64,
    pub p50_us: u64,
    pub p95_us: u64,
    pub p99_us: u64,
    pub max_us: u64,
}

/// Model-specific statistics
#[derive(Debug)]
pub struct ModelStats {
    pub calls: u64,
    pub mean_us: u64,
    pub p50_us: u64,
    pub p99_us: u64,
}

/// Periodic metrics summary, stopped by the shutdown token
pub struct MetricsReporter {
    metrics: Arc<PipelineMetrics>,
    interval: Duration,
    shutdown: CancellationToken,
}

impl MetricsReporter {
    pub fn new(metrics: Arc<PipelineMetrics>, interval_secs: u64, shutdown: CancellationToken) -> Self {
        Self {
            metrics,
            interval: Duration::from_secs(interval_secs.max(1)),
            shutdown,
        }
    }

    /// Start the periodic reporting task
    pub async fn start(self) {
        let mut interval = tokio::time::interval(self.interval);
        // The first tick completes immediately
        interval.tick().await;
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = interval.tick() => self.metrics.print_summary(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_recording() {
        let metrics = PipelineMetrics::new();

        metrics.record_transaction(Duration::from_micros(100), 0.2, false);
        metrics.record_transaction(Duration::from_micros(200), 0.8, true);
        metrics.record_alert("high");
        metrics.record_alert_suppressed();
        metrics.record_skipped();

        assert_eq!(metrics.transactions_processed.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.fraud.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.legit.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.alerts_sent.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.alerts_suppressed.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.skipped.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.get_alerts_by_level().get("high"), Some(&1));
    }

    #[test]
    fn test_score_distribution_edges() {
        let metrics = PipelineMetrics::new();

        metrics.record_transaction(Duration::from_micros(1), 0.0, false);
        metrics.record_transaction(Duration::from_micros(1), 1.0, true);
        metrics.record_transaction(Duration::from_micros(1), 0.55, true);

        let dist = metrics.get_score_distribution();
        assert_eq!(dist[0], 1);
        assert_eq!(dist[5], 1);
        assert_eq!(dist[9], 1);
    }

    #[test]
    fn test_processing_stats() {
        let metrics = PipelineMetrics::new();
        for us in 1..=100 {
            metrics.record_transaction(Duration::from_micros(us), 0.1, false);
        }

        let stats = metrics.get_processing_stats();
        assert_eq!(stats.count, 100);
        assert_eq!(stats.max_us, 100);
        assert_eq!(stats.p50_us, 51);
        assert_eq!(stats.p99_us, 100);
    }

    #[tokio::test]
    async fn test_reporter_stops_on_shutdown() {
        let shutdown = CancellationToken::new();
        let reporter = MetricsReporter::new(Arc::new(PipelineMetrics::new()), 60, shutdown.clone());
        let handle = tokio::spawn(reporter.start());

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
