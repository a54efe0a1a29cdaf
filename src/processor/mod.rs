//! Stream processor: pulls deliveries, fans them out to worker lanes and
//! commits them in arrival order.
//!
//! Events are assigned to a lane by their partition key, so two events for the
//! same card are processed in arrival order while lanes run in parallel. Lane
//! queues are bounded and give backpressure to the puller. A single commit
//! tracker owns the consumption position.

pub mod commit;
pub mod pipeline;
pub mod retry;

pub use commit::ConsumptionPosition;
pub use pipeline::{Disposition, EventOutcome, EventPipeline, EventState, Inbound};
pub use retry::RetryPolicy;

use crate::consumer::EventSource;
use crate::errors::{ProcessorError, SourceError};
use commit::{CommitMsg, CommitTracker};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Consecutive ingress errors tolerated before giving up
const MAX_CONSECUTIVE_SOURCE_ERRORS: u32 = 5;

#[derive(Debug, Clone, Copy)]
pub struct ProcessorSettings {
    /// Number of worker lanes
    pub workers: usize,
    /// Capacity of each lane queue
    pub queue_capacity: usize,
    /// Time allowed for each acknowledgement
    pub ack_timeout: Duration,
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 64,
            ack_timeout: Duration::from_secs(5),
        }
    }
}

/// Lane for a partition key
pub fn lane_for(key: &str, lanes: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % lanes.max(1) as u64) as usize
}

type FatalSlot = Arc<Mutex<Option<ProcessorError>>>;

pub struct StreamProcessor {
    pipeline: Arc<EventPipeline>,
    settings: ProcessorSettings,
    shutdown: CancellationToken,
    position: watch::Sender<ConsumptionPosition>,
}

impl StreamProcessor {
    pub fn new(pipeline: EventPipeline, settings: ProcessorSettings, shutdown: CancellationToken) -> Self {
        let (position, _) = watch::channel(ConsumptionPosition::default());
        Self {
            pipeline: Arc::new(pipeline),
            settings: ProcessorSettings {
                workers: settings.workers.max(1),
                queue_capacity: settings.queue_capacity.max(1),
                ack_timeout: settings.ack_timeout,
            },
            shutdown,
            position,
        }
    }

    /// Watch the committed consumption position
    pub fn position(&self) -> watch::Receiver<ConsumptionPosition> {
        self.position.subscribe()
    }

    /// Consume `source` until it ends, shutdown is requested or a fatal error
    /// occurs. Returns the final committed position.
    pub async fn run<S: EventSource>(&self, mut source: S) -> Result<ConsumptionPosition, ProcessorError> {
        let lanes = self.settings.workers;
        let stop_pulling = self.shutdown.child_token();
        let fatal: FatalSlot = Arc::new(Mutex::new(None));

        pipeline::log_limits(&self.pipeline);
        info!(
            workers = lanes,
            queue_capacity = self.settings.queue_capacity,
            "Stream processor started"
        );

        let (commit_tx, commit_rx) = mpsc::unbounded_channel();
        let committer = tokio::spawn(CommitTracker::new(self.position.clone(), self.settings.ack_timeout).run(commit_rx));

        let mut senders = Vec::with_capacity(lanes);
        let mut workers = Vec::with_capacity(lanes);
        for lane in 0..lanes {
            let (tx, rx) = mpsc::channel(self.settings.queue_capacity);
            senders.push(tx);
            workers.push(tokio::spawn(run_lane(
                lane,
                rx,
                self.pipeline.clone(),
                commit_tx.clone(),
                stop_pulling.clone(),
                fatal.clone(),
            )));
        }

        let mut seq: u64 = 0;
        let mut source_errors: u32 = 0;
        let pulled: Result<(), SourceError> = loop {
            let next = tokio::select! {
                biased;
                _ = stop_pulling.cancelled() => break Ok(()),
                next = source.next() => next,
            };

            let delivery = match next {
                None => {
                    info!("Ingress stream ended");
                    break Ok(());
                }
                Some(Err(e)) => {
                    source_errors += 1;
                    if source_errors >= MAX_CONSECUTIVE_SOURCE_ERRORS {
                        error!(error = %e, "Ingress stream failing, stopping");
                        break Err(e);
                    }
                    warn!(error = %e, attempt = source_errors, "Ingress stream error");
                    tokio::select! {
                        _ = stop_pulling.cancelled() => break Ok(()),
                        _ = tokio::time::sleep(Duration::from_millis(200 * source_errors as u64)) => continue,
                    }
                }
                Some(Ok(delivery)) => delivery,
            };
            source_errors = 0;

            let inbound = Inbound::new(seq, delivery.position, delivery.delivery_count, delivery.payload);
            let lane = match &inbound.event {
                Ok(event) => lane_for(event.partition_key(), lanes),
                Err(_) => (inbound.position % lanes as u64) as usize,
            };
            if delivery.delivery_count > 1 {
                debug!(
                    position = inbound.position,
                    delivery_count = delivery.delivery_count,
                    "Redelivered event"
                );
            }

            let tracked = commit_tx.send(CommitMsg::Track {
                seq,
                position: inbound.position,
                acker: delivery.acker,
            });
            if tracked.is_err() {
                error!("Commit tracker stopped unexpectedly");
                break Ok(());
            }
            seq += 1;

            tokio::select! {
                biased;
                _ = stop_pulling.cancelled() => break Ok(()),
                sent = senders[lane].send(inbound) => {
                    if sent.is_err() {
                        break Ok(());
                    }
                }
            }
        };

        info!(pulled = seq, "Stopped pulling, draining worker lanes");
        drop(senders);
        for worker in workers {
            if let Err(e) = worker.await {
                error!(error = %e, "Worker lane panicked");
            }
        }

        drop(commit_tx);
        let position = match committer.await {
            Ok(position) => position,
            Err(e) => {
                error!(error = %e, "Commit tracker panicked");
                *self.position.borrow()
            }
        };
        info!(
            position = position.position,
            committed = position.committed,
            "Stream processor stopped"
        );

        let fatal = match fatal.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(err) = fatal {
            return Err(err);
        }
        pulled?;
        Ok(position)
    }
}

async fn run_lane(
    lane: usize,
    mut rx: mpsc::Receiver<Inbound>,
    pipeline: Arc<EventPipeline>,
    commits: mpsc::UnboundedSender<CommitMsg>,
    stop_pulling: CancellationToken,
    fatal: FatalSlot,
) {
    // Once an event is left uncommitted, later events in the lane are too
    let mut halted = false;
    while let Some(inbound) = rx.recv().await {
        if halted {
            continue;
        }

        match pipeline.process(&inbound, &stop_pulling).await {
            EventOutcome::Committed(disposition) => {
                debug!(
                    lane = lane,
                    seq = inbound.seq,
                    disposition = ?disposition,
                    state = ?EventState::Committed,
                    "Event complete"
                );
                if commits.send(CommitMsg::Done { seq: inbound.seq }).is_err() {
                    halted = true;
                }
            }
            EventOutcome::Abandoned => {
                halted = true;
            }
            EventOutcome::Fatal(err) => {
                halted = true;
                let mut slot = match fatal.lock() {
                    Ok(slot) => slot,
                    Err(poisoned) => poisoned.into_inner(),
                };
                slot.get_or_insert(err);
                drop(slot);
                stop_pulling.cancel();
            }
        }
    }
    debug!(lane = lane, halted = halted, "Worker lane finished");
}
