//! JetStream-backed sinks.
//!
//! Outcome stores and the dispatch ledger are key-value buckets: `put` is a
//! native upsert and `create` an atomic insert-if-absent. Dead letters are
//! published to a JetStream subject so they survive restarts.

use crate::errors::{DeadLetterError, NotifyError, RouteError};
use crate::sinks::{store_key, Claim, DeadLetterSink, DispatchLedger, DocumentStore};
use crate::types::scored::DeadLetter;
use anyhow::{Context as _, Result};
use async_nats::jetstream::{self, kv};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use std::time::Duration;
use tracing::{debug, info, warn};

const PENDING_PREFIX: &[u8] = b"pending:";
const SENT: &[u8] = b"sent";

/// Ledger value of a claim taken at `claimed_at_ms`
fn pending_value(claimed_at_ms: i64) -> Bytes {
    Bytes::from(format!("pending:{claimed_at_ms}"))
}

/// Claim time of a `pending` value, `None` for anything else
fn pending_since(value: &[u8]) -> Option<i64> {
    let millis = value.strip_prefix(PENDING_PREFIX)?;
    std::str::from_utf8(millis).ok()?.parse().ok()
}

/// Open a key-value bucket, creating it if it does not exist
pub async fn open_bucket(js: &jetstream::Context, bucket: &str) -> Result<kv::Store> {
    if let Ok(store) = js.get_key_value(bucket).await {
        debug!(bucket = %bucket, "Opened key-value bucket");
        return Ok(store);
    }

    let store = js
        .create_key_value(kv::Config {
            bucket: bucket.to_string(),
            history: 1,
            ..Default::default()
        })
        .await
        .with_context(|| format!("Failed to create key-value bucket {bucket}"))?;
    info!(bucket = %bucket, "Created key-value bucket");
    Ok(store)
}

/// Outcome store on a key-value bucket
#[derive(Clone)]
pub struct KvStore {
    bucket: String,
    store: kv::Store,
}

impl KvStore {
    pub async fn open(js: &jetstream::Context, bucket: &str) -> Result<Self> {
        Ok(Self {
            bucket: bucket.to_string(),
            store: open_bucket(js, bucket).await?,
        })
    }
}

#[async_trait]
impl DocumentStore for KvStore {
    async fn upsert(&self, key: &str, document: &[u8]) -> Result<(), RouteError> {
        self.store
            .put(store_key(key), Bytes::copy_from_slice(document))
            .await
            .map_err(|e| RouteError::SinkUnavailable(format!("{}: {e}", self.bucket)))?;
        Ok(())
    }

    fn name(&self) -> &str {
        &self.bucket
    }
}

/// Dispatch ledger on a key-value bucket.
///
/// A claim is a `pending:<millis>` entry created atomically; delivery turns
/// it into `sent`. Either state suppresses further notifications, until a
/// `pending` claim outlives the claim TTL. An expired claim is taken over with
/// a revision-checked update, so only one redelivery wins it.
#[derive(Clone)]
pub struct KvLedger {
    store: kv::Store,
    claim_ttl: Option<Duration>,
}

impl KvLedger {
    pub async fn open(js: &jetstream::Context, bucket: &str) -> Result<Self> {
        Ok(Self {
            store: open_bucket(js, bucket).await?,
            claim_ttl: None,
        })
    }

    /// Let `pending` claims older than `ttl` be taken over
    pub fn with_claim_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.claim_ttl = ttl;
        self
    }

    async fn take_over_expired(&self, key: &str, now_ms: i64) -> Result<Claim, NotifyError> {
        let ttl = match self.claim_ttl {
            Some(ttl) => ttl,
            None => return Ok(Claim::AlreadyClaimed),
        };
        let entry = match self
            .store
            .entry(key)
            .await
            .map_err(|e| NotifyError::LedgerUnavailable(e.to_string()))?
        {
            Some(entry) => entry,
            None => return Ok(Claim::AlreadyClaimed),
        };
        match pending_since(&entry.value) {
            Some(since) if now_ms.saturating_sub(since) >= ttl.as_millis() as i64 => {}
            _ => return Ok(Claim::AlreadyClaimed),
        }

        match self
            .store
            .update(key, pending_value(now_ms), entry.revision)
            .await
        {
            Ok(_) => {
                warn!(key = %key, "Took over an expired alert claim");
                Ok(Claim::Acquired)
            }
            Err(e) if e.kind() == kv::UpdateErrorKind::WrongLastRevision => Ok(Claim::AlreadyClaimed),
            Err(e) => Err(NotifyError::LedgerUnavailable(e.to_string())),
        }
    }
}

#[async_trait]
impl DispatchLedger for KvLedger {
    async fn claim(&self, transaction_id: &str) -> Result<Claim, NotifyError> {
        let key = store_key(transaction_id);
        let now_ms = Utc::now().timestamp_millis();
        match self.store.create(&key, pending_value(now_ms)).await {
            Ok(_) => Ok(Claim::Acquired),
            Err(e) if e.kind() == kv::CreateErrorKind::AlreadyExists => {
                self.take_over_expired(&key, now_ms).await
            }
            Err(e) => Err(NotifyError::LedgerUnavailable(e.to_string())),
        }
    }

    async fn confirm(&self, transaction_id: &str) -> Result<(), NotifyError> {
        self.store
            .put(store_key(transaction_id), Bytes::from_static(SENT))
            .await
            .map_err(|e| NotifyError::LedgerUnavailable(e.to_string()))?;
        Ok(())
    }

    async fn release(&self, transaction_id: &str) -> Result<(), NotifyError> {
        self.store
            .delete(store_key(transaction_id))
            .await
            .map_err(|e| NotifyError::LedgerUnavailable(e.to_string()))
    }
}

/// Dead letters published to a JetStream subject
#[derive(Clone)]
pub struct JetStreamDeadLetters {
    js: jetstream::Context,
    subject: String,
}

impl JetStreamDeadLetters {
    pub fn new(js: jetstream::Context, subject: &str) -> Self {
        Self {
            js,
            subject: subject.to_string(),
        }
    }
}

#[async_trait]
impl DeadLetterSink for JetStreamDeadLetters {
    async fn record(&self, letter: &DeadLetter) -> Result<(), DeadLetterError> {
        let payload = serde_json::to_vec(letter).map_err(|e| DeadLetterError(e.to_string()))?;

        self.js
            .publish(self.subject.clone(), payload.into())
            .await
            .map_err(|e| DeadLetterError(e.to_string()))?
            .await
            .map_err(|e| DeadLetterError(e.to_string()))?;

        debug!(
            transaction_id = letter.transaction_id.as_deref().unwrap_or("unknown"),
            stage = ?letter.stage,
            subject = %self.subject,
            "Published dead letter"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_value_records_claim_time() {
        let value = pending_value(1_710_513_000_123);
        assert_eq!(&value[..], b"pending:1710513000123");
        assert_eq!(pending_since(&value), Some(1_710_513_000_123));
    }

    #[test]
    fn test_other_values_have_no_claim_time() {
        assert_eq!(pending_since(SENT), None);
        assert_eq!(pending_since(b"pending"), None);
        assert_eq!(pending_since(b"pending:soon"), None);
    }
}
