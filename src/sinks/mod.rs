//! Downstream sinks: outcome stores, the alert dedup ledger and dead letters.
//!
//! Each sink is a trait so the pipeline can run against JetStream in
//! production and against in-memory implementations in tests.

pub mod memory;
pub mod nats;

use crate::errors::{DeadLetterError, NotifyError, RouteError};
use crate::types::scored::DeadLetter;
use async_trait::async_trait;

pub use memory::{MemoryDeadLetters, MemoryLedger, MemoryStore};
pub use nats::{JetStreamDeadLetters, KvLedger, KvStore};

/// Document store with upsert-by-key writes.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Insert or replace the document stored under `key`
    async fn upsert(&self, key: &str, document: &[u8]) -> Result<(), RouteError>;

    fn name(&self) -> &str;
}

/// Result of trying to reserve a notification for a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// This caller owns the notification and must send it
    Acquired,
    /// A notification was already sent, or is being sent, for this id
    AlreadyClaimed,
}

/// Durable record of which transactions already triggered a notification.
#[async_trait]
pub trait DispatchLedger: Send + Sync {
    /// Atomically reserve the notification for `transaction_id`
    async fn claim(&self, transaction_id: &str) -> Result<Claim, NotifyError>;

    /// Mark a reserved notification as delivered
    async fn confirm(&self, transaction_id: &str) -> Result<(), NotifyError>;

    /// Drop a reservation whose notification could not be delivered
    async fn release(&self, transaction_id: &str) -> Result<(), NotifyError>;
}

/// Terminal parking location for events that cannot be processed.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn record(&self, letter: &DeadLetter) -> Result<(), DeadLetterError>;
}

/// Store key for a transaction id.
///
/// Bytes outside `[A-Za-z0-9_/-]` are hex-escaped as `=XX`. `=` itself is
/// always escaped, so distinct ids never collide.
pub fn store_key(transaction_id: &str) -> String {
    let mut key = String::with_capacity(transaction_id.len());
    for byte in transaction_id.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'_' | b'-' | b'/' => key.push(byte as char),
            _ => key.push_str(&format!("={byte:02X}")),
        }
    }
    if key.is_empty() {
        key.push_str("=00");
    }
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_key_passes_uuid_through() {
        let id = "5f2b8c1e-7a44-4f0e-9b1d-3c2e8f6a9d10";
        assert_eq!(store_key(id), id);
    }

    #[test]
    fn test_store_key_escapes_unsafe_characters() {
        assert_eq!(store_key("a b"), "a=20b");
        assert_eq!(store_key("x=y"), "x=3Dy");
        assert_eq!(store_key(".lead"), "=2Elead");
        assert_eq!(store_key(""), "=00");
        assert_ne!(store_key("a b"), store_key("a_b"));
    }
}
