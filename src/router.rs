//! Routing of scored transactions to the positive or negative store

use crate::errors::RouteError;
use crate::sinks::DocumentStore;
use crate::types::scored::{Destination, OutcomeRecord, ScoredTransaction};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Writes each scored transaction to exactly one store, keyed by transaction id.
///
/// Writes are upserts, so routing the same transaction again overwrites the
/// earlier document instead of adding a second one.
#[derive(Clone)]
pub struct OutcomeRouter {
    positive: Arc<dyn DocumentStore>,
    negative: Arc<dyn DocumentStore>,
    timeout: Duration,
}

impl OutcomeRouter {
    pub fn new(
        positive: Arc<dyn DocumentStore>,
        negative: Arc<dyn DocumentStore>,
        timeout: Duration,
    ) -> Self {
        Self {
            positive,
            negative,
            timeout,
        }
    }

    pub async fn route(&self, scored: &ScoredTransaction) -> Result<Destination, RouteError> {
        let destination = Destination::for_decision(scored.is_fraud());
        let store = match destination {
            Destination::Positive => &self.positive,
            Destination::Negative => &self.negative,
        };

        let record = OutcomeRecord::from(scored);
        let document = serde_json::to_vec(&record).map_err(|e| RouteError::Encode(e.to_string()))?;

        tokio::time::timeout(self.timeout, store.upsert(scored.transaction_id(), &document))
            .await
            .map_err(|_| RouteError::timed_out(self.timeout))??;

        debug!(
            transaction_id = %scored.transaction_id(),
            destination = %destination,
            store = store.name(),
            "Routed scored transaction"
        );
        Ok(destination)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sinks::MemoryStore;
    use crate::transformer::FeatureTransformer;
    use crate::types::scored::ScoreOutcome;
    use crate::types::transaction::sample_event;

    fn scored(tx_id: &str, decision: bool) -> ScoredTransaction {
        let event = sample_event(tx_id);
        let features = FeatureTransformer::new().transform(&event).unwrap();
        ScoredTransaction::new(
            event,
            features,
            ScoreOutcome {
                probability: if decision { 0.8 } else { 0.2 },
                decision,
                model_version: "v1".to_string(),
            },
        )
    }

    fn router() -> (OutcomeRouter, Arc<MemoryStore>, Arc<MemoryStore>) {
        let positive = Arc::new(MemoryStore::new("fraud_alerts"));
        let negative = Arc::new(MemoryStore::new("non_fraud"));
        let router = OutcomeRouter::new(positive.clone(), negative.clone(), Duration::from_secs(1));
        (router, positive, negative)
    }

    #[tokio::test]
    async fn test_routes_by_decision() {
        let (router, positive, negative) = router();

        assert_eq!(router.route(&scored("tx_f", true)).await.unwrap(), Destination::Positive);
        assert_eq!(router.route(&scored("tx_l", false)).await.unwrap(), Destination::Negative);

        assert!(positive.get("tx_f").is_some());
        assert!(negative.get("tx_l").is_some());
        assert!(positive.get("tx_l").is_none());
        assert!(negative.get("tx_f").is_none());
    }

    #[tokio::test]
    async fn test_rerouting_does_not_duplicate() {
        let (router, positive, _) = router();

        for _ in 0..3 {
            router.route(&scored("tx_1", true)).await.unwrap();
        }

        assert_eq!(positive.len(), 1);
        let stored: OutcomeRecord = serde_json::from_slice(&positive.get("tx_1").unwrap()).unwrap();
        assert!(stored.is_fraud);
        assert_eq!(stored.event.transaction_id, "tx_1");
    }

    #[tokio::test]
    async fn test_store_failure_is_retryable() {
        let (router, _, negative) = router();
        negative.fail_next(1);

        assert!(matches!(
            router.route(&scored("tx_1", false)).await,
            Err(RouteError::SinkUnavailable(_))
        ));
        assert!(router.route(&scored("tx_1", false)).await.is_ok());
    }
}
