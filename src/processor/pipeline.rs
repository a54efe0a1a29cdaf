//! Per-event pipeline: transform, score, route, alert.
//!
//! [`EventPipeline::process`] drives one delivery to a point where it may be
//! committed, or reports that it must stay uncommitted. It never acknowledges
//! anything itself; the caller hands the outcome to the commit tracker.

use crate::alerting::{AlertDispatcher, NotifyOutcome};
use crate::errors::{DeadLetterError, NotifyError, ProcessorError, RouteError, ScoreError, TransformError};
use crate::metrics::PipelineMetrics;
use crate::models::scorer::RiskScorer;
use crate::processor::retry::RetryPolicy;
use crate::router::OutcomeRouter;
use crate::sinks::DeadLetterSink;
use crate::transformer::FeatureTransformer;
use crate::types::features::FeatureVector;
use crate::types::scored::{DeadLetter, Destination, FailureStage, ScoreOutcome, ScoredTransaction};
use crate::types::transaction::TransactionEvent;
use bytes::Bytes;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// A delivery as handed to a worker lane
#[derive(Debug)]
pub struct Inbound {
    /// Arrival order within this process
    pub seq: u64,
    /// Position on the ingress stream
    pub position: u64,
    pub delivery_count: u64,
    pub payload: Bytes,
    /// Decoded payload, or the reason it could not be decoded
    pub event: Result<TransactionEvent, TransformError>,
}

impl Inbound {
    pub fn new(seq: u64, position: u64, delivery_count: u64, payload: Bytes) -> Self {
        let event = TransactionEvent::from_slice(&payload);
        Self {
            seq,
            position,
            delivery_count,
            payload,
            event,
        }
    }

    pub fn transaction_id(&self) -> Option<&str> {
        self.event.as_ref().ok().map(|e| e.transaction_id.as_str())
    }
}

/// Stages an event moves through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventState {
    Received,
    Transformed,
    Scored,
    Routed,
    Alerted,
    Skipped,
    DeadLettered,
    /// Handed to the commit tracker
    Committed,
}

/// How a committable event ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Routed(Destination),
    /// Routed to the positive store and an alert was sent
    Alerted,
    /// Malformed; recorded to the dead-letter sink
    Skipped,
    DeadLettered(FailureStage),
}

/// Result of processing one delivery
#[derive(Debug)]
pub enum EventOutcome {
    /// The event reached a terminal state and may be committed
    Committed(Disposition),
    /// Stopped while waiting for a model; leave uncommitted for redelivery
    Abandoned,
    /// Ingestion must halt
    Fatal(ProcessorError),
}

enum ScoreFailure {
    Abandoned,
    Fatal(ScoreError),
    Exhausted { error: ScoreError, attempts: u32 },
}

/// A classifier call that outlived its timeout. It keeps its scoring slot and
/// is awaited again on the next attempt instead of being started twice.
struct InFlight {
    call: JoinHandle<Result<ScoreOutcome, ScoreError>>,
    started: Instant,
}

/// Everything needed to take one event from payload to commit point
pub struct EventPipeline {
    transformer: FeatureTransformer,
    scorer: Arc<RiskScorer>,
    router: OutcomeRouter,
    dispatcher: AlertDispatcher,
    dead_letters: Arc<dyn DeadLetterSink>,
    metrics: Arc<PipelineMetrics>,
    scoring_permits: Arc<Semaphore>,
    score_timeout: Duration,
    sink_timeout: Duration,
    model_retry: RetryPolicy,
    route_retry: RetryPolicy,
}

impl EventPipeline {
    pub fn new(
        scorer: Arc<RiskScorer>,
        router: OutcomeRouter,
        dispatcher: AlertDispatcher,
        dead_letters: Arc<dyn DeadLetterSink>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            transformer: FeatureTransformer::new(),
            scorer,
            router,
            dispatcher,
            dead_letters,
            metrics,
            scoring_permits: Arc::new(Semaphore::new(4)),
            score_timeout: Duration::from_secs(1),
            sink_timeout: Duration::from_secs(5),
            model_retry: RetryPolicy::default(),
            route_retry: RetryPolicy::default(),
        }
    }

    /// Bound concurrent classifier calls and the time each may take
    pub fn with_scoring_limits(mut self, max_concurrent: usize, timeout: Duration) -> Self {
        self.scoring_permits = Arc::new(Semaphore::new(max_concurrent.max(1)));
        self.score_timeout = timeout;
        self
    }

    /// Backoff for an unavailable model; `max_attempts` bounds inference failures
    pub fn with_model_retry(mut self, policy: RetryPolicy) -> Self {
        self.model_retry = policy;
        self
    }

    pub fn with_route_retry(mut self, policy: RetryPolicy) -> Self {
        self.route_retry = policy;
        self
    }

    /// Time allowed for each dead-letter write
    pub fn with_sink_timeout(mut self, timeout: Duration) -> Self {
        self.sink_timeout = timeout;
        self
    }

    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    /// Process one delivery. `stop` interrupts waiting on an unavailable model.
    pub async fn process(&self, inbound: &Inbound, stop: &CancellationToken) -> EventOutcome {
        let started = Instant::now();
        let mut state = EventState::Received;

        let event = match &inbound.event {
            Ok(event) => event,
            Err(e) => return self.skip(inbound, e).await,
        };
        let tx_id = event.transaction_id.as_str();

        let features = match self.transformer.transform(event) {
            Ok(features) => features,
            Err(e) => return self.skip(inbound, &e).await,
        };
        advance(&mut state, EventState::Transformed, tx_id);

        let outcome = match self.score_with_retry(tx_id, &features, stop).await {
            Ok(outcome) => outcome,
            Err(ScoreFailure::Abandoned) => {
                debug!(
                    transaction_id = %tx_id,
                    position = inbound.position,
                    state = ?state,
                    "Abandoning event uncommitted"
                );
                return EventOutcome::Abandoned;
            }
            Err(ScoreFailure::Fatal(e)) => {
                error!(transaction_id = %tx_id, error = %e, "Halting ingestion");
                return EventOutcome::Fatal(ProcessorError::Score(e));
            }
            Err(ScoreFailure::Exhausted { error, attempts }) => {
                return self
                    .dead_letter(inbound, FailureStage::Score, error.to_string(), attempts)
                    .await;
            }
        };
        advance(&mut state, EventState::Scored, tx_id);

        let scored = ScoredTransaction::new(event.clone(), features, outcome);
        let destination = match self.route_with_retry(&scored).await {
            Ok(destination) => destination,
            Err((error, attempts)) => {
                return self
                    .dead_letter(inbound, FailureStage::Route, error.to_string(), attempts)
                    .await;
            }
        };
        advance(&mut state, EventState::Routed, tx_id);

        self.metrics
            .record_transaction(started.elapsed(), scored.probability(), scored.is_fraud());

        let disposition = if scored.is_fraud() {
            self.alert(inbound, &scored, destination).await
        } else {
            Disposition::Routed(destination)
        };
        if disposition == Disposition::Alerted {
            advance(&mut state, EventState::Alerted, tx_id);
        }

        debug!(
            transaction_id = %tx_id,
            position = inbound.position,
            probability = scored.probability(),
            destination = %destination,
            processing_time_us = started.elapsed().as_micros() as u64,
            "Transaction processed"
        );
        EventOutcome::Committed(disposition)
    }

    async fn score_once(
        &self,
        features: &FeatureVector,
        in_flight: &mut Option<InFlight>,
    ) -> Result<ScoreOutcome, ScoreError> {
        let mut pending = match in_flight.take() {
            Some(pending) => pending,
            None => {
                let acquired = tokio::time::timeout(
                    self.score_timeout,
                    self.scoring_permits.clone().acquire_owned(),
                )
                .await;
                let permit = match acquired {
                    Ok(Ok(permit)) => permit,
                    Ok(Err(e)) => return Err(ScoreError::ModelUnavailable(e.to_string())),
                    Err(_) => {
                        return Err(ScoreError::ModelUnavailable(format!(
                            "no scoring slot free within {:?}",
                            self.score_timeout
                        )))
                    }
                };

                let scorer = self.scorer.clone();
                let features = features.clone();
                InFlight {
                    call: tokio::task::spawn_blocking(move || {
                        let _permit = permit;
                        scorer.score(&features)
                    }),
                    started: Instant::now(),
                }
            }
        };

        let waited = tokio::time::timeout(self.score_timeout, &mut pending.call).await;
        let outcome = match waited {
            Ok(Ok(result)) => result?,
            Ok(Err(e)) => return Err(ScoreError::Inference(format!("scoring task failed: {e}"))),
            Err(_) => {
                *in_flight = Some(pending);
                return Err(ScoreError::ModelUnavailable(format!(
                    "scoring timed out after {:?}",
                    self.score_timeout
                )));
            }
        };
        self.metrics
            .record_model_time(&outcome.model_version, pending.started.elapsed());
        Ok(outcome)
    }

    async fn score_with_retry(
        &self,
        tx_id: &str,
        features: &FeatureVector,
        stop: &CancellationToken,
    ) -> Result<ScoreOutcome, ScoreFailure> {
        let mut waits: u32 = 0;
        let mut failures: u32 = 0;
        let mut in_flight = None;
        loop {
            let error = match self.score_once(features, &mut in_flight).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) => e,
            };

            match error {
                e if e.is_fatal() => return Err(ScoreFailure::Fatal(e)),
                ScoreError::ModelUnavailable(reason) => {
                    // Unbounded: the event must not be committed without a score
                    waits = waits.saturating_add(1);
                    self.metrics.record_model_unavailable();
                    let delay = self.model_retry.delay(waits);
                    warn!(
                        transaction_id = %tx_id,
                        attempt = waits,
                        retry_in_ms = delay.as_millis() as u64,
                        reason = %reason,
                        "Model unavailable, retrying"
                    );
                    tokio::select! {
                        _ = stop.cancelled() => return Err(ScoreFailure::Abandoned),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                e => {
                    failures += 1;
                    if failures >= self.model_retry.max_attempts {
                        return Err(ScoreFailure::Exhausted {
                            error: e,
                            attempts: failures,
                        });
                    }
                    self.metrics.record_inference_retry();
                    let delay = self.model_retry.delay(failures);
                    warn!(
                        transaction_id = %tx_id,
                        attempt = failures,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "Inference failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn route_with_retry(
        &self,
        scored: &ScoredTransaction,
    ) -> Result<Destination, (RouteError, u32)> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.router.route(scored).await {
                Ok(destination) => return Ok(destination),
                Err(e @ RouteError::Encode(_)) => return Err((e, attempt)),
                Err(e) if attempt >= self.route_retry.max_attempts => return Err((e, attempt)),
                Err(e) => {
                    self.metrics.record_route_retry();
                    let delay = self.route_retry.delay(attempt);
                    warn!(
                        transaction_id = %scored.transaction_id(),
                        attempt = attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "Store write failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn alert(
        &self,
        inbound: &Inbound,
        scored: &ScoredTransaction,
        destination: Destination,
    ) -> Disposition {
        let error = match self.dispatcher.notify(scored).await {
            Ok(NotifyOutcome::Sent(alert)) => {
                self.metrics.record_alert(alert.risk_level.as_str());
                return Disposition::Alerted;
            }
            Ok(NotifyOutcome::Suppressed) => {
                self.metrics.record_alert_suppressed();
                return Disposition::Routed(destination);
            }
            Ok(NotifyOutcome::NotApplicable) => return Disposition::Routed(destination),
            Err(e) => e,
        };

        // Routing already happened; the alert is parked for replay and the
        // event commits either way
        self.metrics.record_alert_failed();
        let attempts = match error {
            NotifyError::ChannelUnavailable(_) => self.dispatcher.max_attempts(),
            NotifyError::LedgerUnavailable(_) => 1,
        };
        let letter = DeadLetter::new(
            Some(scored.transaction_id().to_string()),
            inbound.position,
            FailureStage::Alert,
            error.to_string(),
            attempts,
            &inbound.payload,
        );
        match self.record(&letter).await {
            Ok(()) => {
                self.metrics.record_dead_letter();
                error!(
                    transaction_id = %scored.transaction_id(),
                    position = inbound.position,
                    attempts = attempts,
                    error = %error,
                    "Fraud alert not delivered, dead-lettered"
                );
                Disposition::DeadLettered(FailureStage::Alert)
            }
            Err(e) => {
                error!(
                    transaction_id = %scored.transaction_id(),
                    position = inbound.position,
                    error = %error,
                    dead_letter_error = %e,
                    "Fraud alert not delivered and not recorded"
                );
                Disposition::Routed(destination)
            }
        }
    }

    /// Write a dead letter within the sink timeout
    async fn record(&self, letter: &DeadLetter) -> Result<(), DeadLetterError> {
        tokio::time::timeout(self.sink_timeout, self.dead_letters.record(letter))
            .await
            .unwrap_or_else(|_| {
                Err(DeadLetterError(format!(
                    "timed out after {:?}",
                    self.sink_timeout
                )))
            })
    }

    /// Malformed input: record it and let the event commit
    async fn skip(&self, inbound: &Inbound, reason: &TransformError) -> EventOutcome {
        self.metrics.record_skipped();
        warn!(
            transaction_id = inbound.transaction_id().unwrap_or("unknown"),
            position = inbound.position,
            error = %reason,
            "Skipping malformed event"
        );

        let letter = DeadLetter::new(
            inbound.transaction_id().map(str::to_string),
            inbound.position,
            FailureStage::Transform,
            reason.to_string(),
            1,
            &inbound.payload,
        );
        if let Err(e) = self.record(&letter).await {
            error!(
                position = inbound.position,
                error = %e,
                "Failed to record skipped event"
            );
        }
        trace!(position = inbound.position, state = ?EventState::Skipped, "Event state");
        EventOutcome::Committed(Disposition::Skipped)
    }

    /// Retries exhausted: park the event, or halt if it cannot be parked
    async fn dead_letter(
        &self,
        inbound: &Inbound,
        stage: FailureStage,
        reason: String,
        attempts: u32,
    ) -> EventOutcome {
        let transaction_id = inbound.transaction_id().unwrap_or("unknown").to_string();
        let letter = DeadLetter::new(
            inbound.transaction_id().map(str::to_string),
            inbound.position,
            stage,
            reason,
            attempts,
            &inbound.payload,
        );

        match self.record(&letter).await {
            Ok(()) => {
                self.metrics.record_dead_letter();
                error!(
                    transaction_id = %transaction_id,
                    position = inbound.position,
                    stage = ?stage,
                    attempts = attempts,
                    reason = %letter.reason,
                    "Event dead-lettered"
                );
                trace!(position = inbound.position, state = ?EventState::DeadLettered, "Event state");
                EventOutcome::Committed(Disposition::DeadLettered(stage))
            }
            Err(e) => {
                error!(
                    transaction_id = %transaction_id,
                    position = inbound.position,
                    error = %e,
                    "Failed to dead-letter event"
                );
                EventOutcome::Fatal(ProcessorError::DeadLetter {
                    transaction_id,
                    source: e,
                })
            }
        }
    }
}

fn advance(state: &mut EventState, next: EventState, tx_id: &str) {
    trace!(transaction_id = %tx_id, from = ?state, to = ?next, "Event state");
    *state = next;
}

/// Log the pipeline's effective limits
pub(crate) fn log_limits(pipeline: &EventPipeline) {
    info!(
        score_timeout_ms = pipeline.score_timeout.as_millis() as u64,
        max_concurrent_scoring = pipeline.scoring_permits.available_permits(),
        route_max_attempts = pipeline.route_retry.max_attempts,
        inference_max_attempts = pipeline.model_retry.max_attempts,
        "Event pipeline ready"
    );
}
