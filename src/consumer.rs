//! Ingress stream of transaction events.
//!
//! Events are read from a JetStream durable pull consumer with explicit
//! acknowledgement. Acknowledging a delivery is what commits the consumption
//! position; unacknowledged deliveries are redelivered after a restart.

use crate::config::NatsConfig;
use crate::errors::SourceError;
use anyhow::{Context, Result};
use async_nats::jetstream::{self, consumer, stream};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::info;

/// Acknowledges one delivery back to the stream
#[async_trait]
pub trait Acknowledge: Send + Sync {
    async fn ack(&self) -> Result<(), SourceError>;
}

/// One event pulled from the ingress stream
pub struct Delivery {
    pub payload: Bytes,
    /// Position of this delivery on the stream
    pub position: u64,
    /// Times this event has been delivered, including this one
    pub delivery_count: u64,
    pub acker: Box<dyn Acknowledge>,
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("position", &self.position)
            .field("delivery_count", &self.delivery_count)
            .field("bytes", &self.payload.len())
            .finish()
    }
}

/// Ordered source of deliveries. `next` must be cancel-safe.
#[async_trait]
pub trait EventSource: Send {
    /// Next delivery; `None` once the stream has ended
    async fn next(&mut self) -> Option<Result<Delivery, SourceError>>;
}

/// Deliver policy for a fresh durable consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartFrom {
    /// Replay everything retained in the stream
    #[default]
    All,
    /// Only events published after the consumer is created
    New,
}

/// Create the stream if it does not exist yet
pub async fn ensure_stream(
    js: &jetstream::Context,
    name: &str,
    subjects: Vec<String>,
) -> Result<stream::Stream> {
    js.get_or_create_stream(stream::Config {
        name: name.to_string(),
        subjects,
        ..Default::default()
    })
    .await
    .with_context(|| format!("Failed to open stream {name}"))
}

/// Transaction events from a JetStream durable pull consumer
pub struct TransactionConsumer {
    messages: consumer::pull::Stream,
    durable: String,
}

impl TransactionConsumer {
    /// Bind the durable consumer described by the configuration
    pub async fn connect(js: &jetstream::Context, config: &NatsConfig) -> Result<Self> {
        let stream = ensure_stream(js, &config.stream, vec![config.transaction_subject.clone()]).await?;

        let deliver_policy = match config.start_from {
            StartFrom::All => consumer::DeliverPolicy::All,
            StartFrom::New => consumer::DeliverPolicy::New,
        };

        let consumer = stream
            .get_or_create_consumer(
                &config.durable_name,
                consumer::pull::Config {
                    durable_name: Some(config.durable_name.clone()),
                    filter_subject: config.transaction_subject.clone(),
                    deliver_policy,
                    ack_policy: consumer::AckPolicy::Explicit,
                    ack_wait: Duration::from_secs(config.ack_wait_secs),
                    max_ack_pending: config.max_ack_pending,
                    ..Default::default()
                },
            )
            .await
            .with_context(|| format!("Failed to bind consumer {}", config.durable_name))?;

        let messages = consumer
            .messages()
            .await
            .context("Failed to start message stream")?;

        info!(
            stream = %config.stream,
            subject = %config.transaction_subject,
            durable = %config.durable_name,
            start_from = ?config.start_from,
            "Subscribed to transaction stream"
        );

        Ok(Self {
            messages,
            durable: config.durable_name.clone(),
        })
    }

    pub fn durable_name(&self) -> &str {
        &self.durable
    }
}

struct JetStreamAck {
    message: jetstream::Message,
    position: u64,
}

#[async_trait]
impl Acknowledge for JetStreamAck {
    async fn ack(&self) -> Result<(), SourceError> {
        self.message.ack().await.map_err(|e| SourceError::Ack {
            position: self.position,
            reason: e.to_string(),
        })
    }
}

#[async_trait]
impl EventSource for TransactionConsumer {
    async fn next(&mut self) -> Option<Result<Delivery, SourceError>> {
        let message = match self.messages.next().await? {
            Ok(message) => message,
            Err(e) => return Some(Err(SourceError::Stream(e.to_string()))),
        };

        let (position, delivery_count) = match message.info() {
            Ok(info) => (info.stream_sequence, info.delivered.max(1) as u64),
            Err(e) => return Some(Err(SourceError::Stream(e.to_string()))),
        };

        Some(Ok(Delivery {
            payload: message.payload.clone(),
            position,
            delivery_count,
            acker: Box::new(JetStreamAck { message, position }),
        }))
    }
}

/// In-memory event source. Positions start at 1.
pub struct MemorySource {
    pending: VecDeque<(u64, Bytes)>,
    acked: Arc<Mutex<Vec<u64>>>,
    keep_open: bool,
}

impl MemorySource {
    pub fn new<I, P>(payloads: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Bytes>,
    {
        Self {
            pending: payloads
                .into_iter()
                .enumerate()
                .map(|(i, p)| (i as u64 + 1, p.into()))
                .collect(),
            acked: Arc::new(Mutex::new(Vec::new())),
            keep_open: false,
        }
    }

    /// Block instead of ending once all payloads are delivered
    pub fn keep_open(mut self) -> Self {
        self.keep_open = true;
        self
    }

    /// Positions acknowledged so far, in acknowledgement order
    pub fn acked(&self) -> Arc<Mutex<Vec<u64>>> {
        self.acked.clone()
    }
}

struct MemoryAck {
    position: u64,
    acked: Arc<Mutex<Vec<u64>>>,
}

#[async_trait]
impl Acknowledge for MemoryAck {
    async fn ack(&self) -> Result<(), SourceError> {
        self.acked
            .lock()
            .map_err(|e| SourceError::Ack {
                position: self.position,
                reason: e.to_string(),
            })?
            .push(self.position);
        Ok(())
    }
}

#[async_trait]
impl EventSource for MemorySource {
    async fn next(&mut self) -> Option<Result<Delivery, SourceError>> {
        match self.pending.pop_front() {
            Some((position, payload)) => Some(Ok(Delivery {
                payload,
                position,
                delivery_count: 1,
                acker: Box::new(MemoryAck {
                    position,
                    acked: self.acked.clone(),
                }),
            })),
            None if self.keep_open => futures::future::pending().await,
            None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_source_positions_and_acks() {
        let mut source = MemorySource::new(vec![b"a".to_vec(), b"b".to_vec()]);
        let acked = source.acked();

        let first = source.next().await.unwrap().unwrap();
        let second = source.next().await.unwrap().unwrap();
        assert!(source.next().await.is_none());

        assert_eq!((first.position, second.position), (1, 2));
        second.acker.ack().await.unwrap();
        first.acker.ack().await.unwrap();
        assert_eq!(*acked.lock().unwrap(), vec![2, 1]);
    }
}
