//! Consumption position tracking.
//!
//! Workers finish events out of order; the tracker acknowledges deliveries
//! strictly in arrival order, and only once every earlier delivery has also
//! finished. It is the only writer of the consumption position.

use crate::consumer::Acknowledge;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

/// Durable cursor of the ingress stream as seen by this process
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumptionPosition {
    /// Stream position of the last committed delivery
    pub position: u64,
    /// Deliveries committed since start
    pub committed: u64,
}

pub(crate) enum CommitMsg {
    /// A delivery entered the pipeline
    Track {
        seq: u64,
        position: u64,
        acker: Box<dyn Acknowledge>,
    },
    /// The delivery with this sequence number may be committed
    Done { seq: u64 },
}

struct Pending {
    position: u64,
    acker: Box<dyn Acknowledge>,
    done: bool,
}

pub(crate) struct CommitTracker {
    next_seq: u64,
    pending: BTreeMap<u64, Pending>,
    current: ConsumptionPosition,
    publish: watch::Sender<ConsumptionPosition>,
    ack_timeout: Duration,
}

impl CommitTracker {
    pub(crate) fn new(publish: watch::Sender<ConsumptionPosition>, ack_timeout: Duration) -> Self {
        let current = *publish.borrow();
        Self {
            next_seq: 0,
            pending: BTreeMap::new(),
            current,
            publish,
            ack_timeout,
        }
    }

    /// Consume tracking messages until every sender is gone
    pub(crate) async fn run(mut self, mut rx: mpsc::UnboundedReceiver<CommitMsg>) -> ConsumptionPosition {
        while let Some(msg) = rx.recv().await {
            match msg {
                CommitMsg::Track {
                    seq,
                    position,
                    acker,
                } => {
                    self.pending.insert(
                        seq,
                        Pending {
                            position,
                            acker,
                            done: false,
                        },
                    );
                }
                CommitMsg::Done { seq } => {
                    if let Some(pending) = self.pending.get_mut(&seq) {
                        pending.done = true;
                    }
                    self.advance().await;
                }
            }
        }

        if !self.pending.is_empty() {
            debug!(
                uncommitted = self.pending.len(),
                position = self.current.position,
                "Leaving deliveries uncommitted for redelivery"
            );
        }
        self.current
    }

    /// Acknowledge the contiguous prefix of finished deliveries
    async fn advance(&mut self) {
        while let Some(entry) = self.pending.first_entry() {
            if *entry.key() != self.next_seq || !entry.get().done {
                break;
            }
            let pending = entry.remove();
            self.next_seq += 1;

            // Redelivery is harmless: every stage is idempotent
            match tokio::time::timeout(self.ack_timeout, pending.acker.ack()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(position = pending.position, error = %e, "Failed to acknowledge delivery");
                }
                Err(_) => {
                    warn!(
                        position = pending.position,
                        timeout_ms = self.ack_timeout.as_millis() as u64,
                        "Acknowledgement timed out"
                    );
                }
            }
            self.current.position = pending.position;
            self.current.committed += 1;
        }
        self.publish.send_replace(self.current);
    }
}
