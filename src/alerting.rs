//! Fraud notifications, sent at most once per transaction.
//!
//! Before sending, the dispatcher claims the transaction id in a durable
//! [`DispatchLedger`]. Only the caller that acquires the claim sends, so
//! redeliveries and concurrent workers never produce a second notification.
//! A claim whose send finally fails is released so a later redelivery can
//! try again. A claim left `pending` by a crash expires after the ledger's
//! claim TTL.

use crate::errors::NotifyError;
use crate::processor::retry::RetryPolicy;
use crate::sinks::{Claim, DispatchLedger};
use crate::types::alert::{FraudAlert, RiskLevelThresholds};
use crate::types::scored::ScoredTransaction;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Outbound channel for fraud alerts
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, alert: &FraudAlert) -> Result<(), NotifyError>;
}

/// What happened to a notification request
#[derive(Debug, Clone, PartialEq)]
pub enum NotifyOutcome {
    Sent(FraudAlert),
    /// Already notified for this transaction
    Suppressed,
    /// Not a fraud decision
    NotApplicable,
}

/// Sends deduplicated fraud alerts with bounded retries
#[derive(Clone)]
pub struct AlertDispatcher {
    notifier: Arc<dyn Notifier>,
    ledger: Arc<dyn DispatchLedger>,
    thresholds: RiskLevelThresholds,
    retry: RetryPolicy,
    timeout: Duration,
}

impl AlertDispatcher {
    pub fn new(
        notifier: Arc<dyn Notifier>,
        ledger: Arc<dyn DispatchLedger>,
        thresholds: RiskLevelThresholds,
        retry: RetryPolicy,
        timeout: Duration,
    ) -> Self {
        Self {
            notifier,
            ledger,
            thresholds,
            retry,
            timeout,
        }
    }

    /// Send attempts made before a channel failure is reported
    pub fn max_attempts(&self) -> u32 {
        self.retry.max_attempts
    }

    pub async fn notify(&self, scored: &ScoredTransaction) -> Result<NotifyOutcome, NotifyError> {
        if !scored.is_fraud() {
            return Ok(NotifyOutcome::NotApplicable);
        }
        let tx_id = scored.transaction_id();

        let claim = self
            .with_timeout(self.ledger.claim(tx_id), NotifyError::LedgerUnavailable)
            .await?;
        if claim == Claim::AlreadyClaimed {
            debug!(transaction_id = %tx_id, "Alert already dispatched, suppressing");
            return Ok(NotifyOutcome::Suppressed);
        }

        let alert = FraudAlert::from_scored(scored, &self.thresholds);
        let mut attempt = 0;
        let last_error = loop {
            attempt += 1;
            match self
                .with_timeout(self.notifier.send(&alert), NotifyError::ChannelUnavailable)
                .await
            {
                Ok(()) => {
                    if let Err(e) = self
                        .with_timeout(self.ledger.confirm(tx_id), NotifyError::LedgerUnavailable)
                        .await
                    {
                        // The pending claim still suppresses duplicates
                        warn!(transaction_id = %tx_id, error = %e, "Failed to confirm alert in ledger");
                    }
                    info!(
                        transaction_id = %tx_id,
                        alert_id = %alert.alert_id,
                        risk_level = ?alert.risk_level,
                        attempt = attempt,
                        "Fraud alert sent"
                    );
                    return Ok(NotifyOutcome::Sent(alert));
                }
                Err(e) if attempt >= self.retry.max_attempts => break e,
                Err(e) => {
                    let delay = self.retry.delay(attempt);
                    warn!(
                        transaction_id = %tx_id,
                        attempt = attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "Alert delivery failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        };

        error!(
            transaction_id = %tx_id,
            attempts = attempt,
            error = %last_error,
            "Giving up on fraud alert"
        );
        if let Err(e) = self
            .with_timeout(self.ledger.release(tx_id), NotifyError::LedgerUnavailable)
            .await
        {
            error!(transaction_id = %tx_id, error = %e, "Failed to release alert claim");
        }
        Err(last_error)
    }

    async fn with_timeout<T>(
        &self,
        call: impl Future<Output = Result<T, NotifyError>>,
        on_timeout: fn(String) -> NotifyError,
    ) -> Result<T, NotifyError> {
        tokio::time::timeout(self.timeout, call)
            .await
            .unwrap_or_else(|_| Err(on_timeout(format!("timed out after {:?}", self.timeout))))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::sinks::memory::{LedgerEntry, MemoryLedger};
    use crate::transformer::FeatureTransformer;
    use crate::types::scored::ScoreOutcome;
    use crate::types::transaction::sample_event;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Notifier that records alerts and can be made to fail
    #[derive(Default)]
    pub(crate) struct RecordingNotifier {
        pub sent: Mutex<Vec<FraudAlert>>,
        pub failures: AtomicU32,
    }

    impl RecordingNotifier {
        pub(crate) fn sent_ids(&self) -> Vec<String> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .map(|a| a.transaction_id.clone())
                .collect()
        }
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn send(&self, alert: &FraudAlert) -> Result<(), NotifyError> {
            let failing = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(NotifyError::ChannelUnavailable("smtp down".to_string()));
            }
            self.sent.lock().unwrap().push(alert.clone());
            Ok(())
        }
    }

    fn scored(tx_id: &str, decision: bool) -> ScoredTransaction {
        let event = sample_event(tx_id);
        let features = FeatureTransformer::new().transform(&event).unwrap();
        ScoredTransaction::new(
            event,
            features,
            ScoreOutcome {
                probability: if decision { 0.9 } else { 0.1 },
                decision,
                model_version: "v1".to_string(),
            },
        )
    }

    fn dispatcher(notifier: Arc<RecordingNotifier>, ledger: Arc<MemoryLedger>) -> AlertDispatcher {
        AlertDispatcher::new(
            notifier,
            ledger,
            RiskLevelThresholds::default(),
            RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(5)),
            Duration::from_secs(1),
        )
    }

    #[tokio::test]
    async fn test_alert_sent_once_per_transaction() {
        let notifier = Arc::new(RecordingNotifier::default());
        let ledger = Arc::new(MemoryLedger::new());
        let dispatcher = dispatcher(notifier.clone(), ledger.clone());

        let first = dispatcher.notify(&scored("tx_1", true)).await.unwrap();
        assert!(matches!(first, NotifyOutcome::Sent(_)));

        for _ in 0..3 {
            let again = dispatcher.notify(&scored("tx_1", true)).await.unwrap();
            assert_eq!(again, NotifyOutcome::Suppressed);
        }

        assert_eq!(notifier.sent_ids(), vec!["tx_1".to_string()]);
        assert_eq!(ledger.entry("tx_1"), Some(LedgerEntry::Sent));
    }

    #[tokio::test]
    async fn test_distinct_frauds_each_alert() {
        let notifier = Arc::new(RecordingNotifier::default());
        let dispatcher = dispatcher(notifier.clone(), Arc::new(MemoryLedger::new()));

        dispatcher.notify(&scored("tx_1", true)).await.unwrap();
        dispatcher.notify(&scored("tx_2", true)).await.unwrap();

        assert_eq!(notifier.sent_ids(), vec!["tx_1".to_string(), "tx_2".to_string()]);
    }

    #[tokio::test]
    async fn test_transient_channel_failure_is_retried() {
        let notifier = Arc::new(RecordingNotifier::default());
        notifier.failures.store(2, Ordering::SeqCst);
        let dispatcher = dispatcher(notifier.clone(), Arc::new(MemoryLedger::new()));

        let outcome = dispatcher.notify(&scored("tx_1", true)).await.unwrap();
        assert!(matches!(outcome, NotifyOutcome::Sent(_)));
        assert_eq!(notifier.sent_ids().len(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_channel_releases_claim() {
        let notifier = Arc::new(RecordingNotifier::default());
        notifier.failures.store(3, Ordering::SeqCst);
        let ledger = Arc::new(MemoryLedger::new());
        let dispatcher = dispatcher(notifier.clone(), ledger.clone());

        let err = dispatcher.notify(&scored("tx_1", true)).await.unwrap_err();
        assert!(matches!(err, NotifyError::ChannelUnavailable(_)));
        assert_eq!(ledger.entry("tx_1"), None);

        // A redelivery gets another chance
        let outcome = dispatcher.notify(&scored("tx_1", true)).await.unwrap();
        assert!(matches!(outcome, NotifyOutcome::Sent(_)));
    }

    #[tokio::test]
    async fn test_ledger_outage_prevents_send() {
        let notifier = Arc::new(RecordingNotifier::default());
        let ledger = Arc::new(MemoryLedger::new());
        ledger.fail_next(1);
        let dispatcher = dispatcher(notifier.clone(), ledger);

        let err = dispatcher.notify(&scored("tx_1", true)).await.unwrap_err();
        assert!(matches!(err, NotifyError::LedgerUnavailable(_)));
        assert!(notifier.sent_ids().is_empty());
    }

    #[tokio::test]
    async fn test_legit_transactions_do_not_alert() {
        let notifier = Arc::new(RecordingNotifier::default());
        let dispatcher = dispatcher(notifier.clone(), Arc::new(MemoryLedger::new()));

        let outcome = dispatcher.notify(&scored("tx_1", false)).await.unwrap();
        assert_eq!(outcome, NotifyOutcome::NotApplicable);
        assert!(notifier.sent_ids().is_empty());
    }

    #[tokio::test]
    async fn test_claim_abandoned_by_crash_expires() {
        let notifier = Arc::new(RecordingNotifier::default());
        let ledger =
            Arc::new(MemoryLedger::new().with_claim_ttl(Some(Duration::from_millis(10))));
        // Claimed, then the process died before sending
        ledger.claim("tx_1").await.unwrap();
        let dispatcher = dispatcher(notifier.clone(), ledger.clone());

        let early = dispatcher.notify(&scored("tx_1", true)).await.unwrap();
        assert_eq!(early, NotifyOutcome::Suppressed);

        tokio::time::sleep(Duration::from_millis(20)).await;
        let late = dispatcher.notify(&scored("tx_1", true)).await.unwrap();
        assert!(matches!(late, NotifyOutcome::Sent(_)));
        assert_eq!(notifier.sent_ids(), vec!["tx_1".to_string()]);
        assert_eq!(ledger.entry("tx_1"), Some(LedgerEntry::Sent));
    }
}
