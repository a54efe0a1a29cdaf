//! In-memory sinks for tests and local runs

use crate::errors::{DeadLetterError, NotifyError, RouteError};
use crate::sinks::{Claim, DeadLetterSink, DispatchLedger, DocumentStore};
use crate::types::scored::DeadLetter;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Consume one unit of injected failure, if any is left
fn take_failure(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Key/value document store held in a `HashMap`
#[derive(Default)]
pub struct MemoryStore {
    name: String,
    documents: Mutex<HashMap<String, Vec<u8>>>,
    writes: AtomicUsize,
    failures: AtomicU32,
}

impl MemoryStore {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// Make the next `n` writes fail as unavailable
    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.documents.lock().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Successful writes, including overwrites
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.documents.lock().ok()?.get(key).cloned()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn upsert(&self, key: &str, document: &[u8]) -> Result<(), RouteError> {
        if take_failure(&self.failures) {
            return Err(RouteError::SinkUnavailable(format!("{} is unavailable", self.name)));
        }
        let mut documents = self
            .documents
            .lock()
            .map_err(|e| RouteError::SinkUnavailable(e.to_string()))?;
        documents.insert(key.to_string(), document.to_vec());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerEntry {
    Pending,
    Sent,
}

/// Dispatch ledger held in a `HashMap`
#[derive(Default)]
pub struct MemoryLedger {
    entries: Mutex<HashMap<String, (LedgerEntry, Instant)>>,
    failures: AtomicU32,
    claim_ttl: Option<Duration>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Let `pending` claims older than `ttl` be taken over
    pub fn with_claim_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.claim_ttl = ttl;
        self
    }

    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn entry(&self, transaction_id: &str) -> Option<LedgerEntry> {
        self.entries
            .lock()
            .ok()?
            .get(transaction_id)
            .map(|(entry, _)| *entry)
    }

    fn entries(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, (LedgerEntry, Instant)>>, NotifyError> {
        if take_failure(&self.failures) {
            return Err(NotifyError::LedgerUnavailable("ledger is unavailable".to_string()));
        }
        self.entries
            .lock()
            .map_err(|e| NotifyError::LedgerUnavailable(e.to_string()))
    }
}

#[async_trait]
impl DispatchLedger for MemoryLedger {
    async fn claim(&self, transaction_id: &str) -> Result<Claim, NotifyError> {
        let mut entries = self.entries()?;
        if let Some((entry, claimed_at)) = entries.get(transaction_id) {
            let expired = *entry == LedgerEntry::Pending
                && self.claim_ttl.is_some_and(|ttl| claimed_at.elapsed() >= ttl);
            if !expired {
                return Ok(Claim::AlreadyClaimed);
            }
        }
        entries.insert(
            transaction_id.to_string(),
            (LedgerEntry::Pending, Instant::now()),
        );
        Ok(Claim::Acquired)
    }

    async fn confirm(&self, transaction_id: &str) -> Result<(), NotifyError> {
        self.entries()?
            .insert(transaction_id.to_string(), (LedgerEntry::Sent, Instant::now()));
        Ok(())
    }

    async fn release(&self, transaction_id: &str) -> Result<(), NotifyError> {
        self.entries()?.remove(transaction_id);
        Ok(())
    }
}

/// Dead letters collected in a `Vec`
#[derive(Default)]
pub struct MemoryDeadLetters {
    letters: Mutex<Vec<DeadLetter>>,
    failures: AtomicU32,
}

impl MemoryDeadLetters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn letters(&self) -> Vec<DeadLetter> {
        self.letters.lock().map(|l| l.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl DeadLetterSink for MemoryDeadLetters {
    async fn record(&self, letter: &DeadLetter) -> Result<(), DeadLetterError> {
        if take_failure(&self.failures) {
            return Err(DeadLetterError("dead-letter sink is unavailable".to_string()));
        }
        self.letters
            .lock()
            .map_err(|e| DeadLetterError(e.to_string()))?
            .push(letter.clone());
        Ok(())
    }
}
