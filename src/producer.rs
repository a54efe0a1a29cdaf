//! NATS message producer for fraud alerts

use crate::alerting::Notifier;
use crate::errors::NotifyError;
use crate::types::alert::FraudAlert;
use async_nats::{Client, HeaderMap};
use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

/// Wire form of an alert: the alert fields plus its rendered text
#[derive(Serialize)]
struct AlertMessage<'a> {
    #[serde(flatten)]
    alert: &'a FraudAlert,
    subject: String,
    body: String,
}

/// Encode an alert for the alert subject
pub fn encode_alert(alert: &FraudAlert) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(&AlertMessage {
        alert,
        subject: alert.subject_line(),
        body: alert.body(),
    })
}

/// Publishes fraud alerts to a NATS subject.
///
/// The payload carries the rendered subject and plain-text body, so the mail
/// gateway only relays it. The subject line is also set as the
/// `Alert-Subject` header.
#[derive(Clone)]
pub struct AlertProducer {
    client: Client,
    subject: String,
}

impl AlertProducer {
    /// Create a new alert producer
    pub fn new(client: Client, subject: &str) -> Self {
        Self {
            client,
            subject: subject.to_string(),
        }
    }

    /// Publish a fraud alert
    pub async fn publish(&self, alert: &FraudAlert) -> Result<(), NotifyError> {
        let payload =
            encode_alert(alert).map_err(|e| NotifyError::ChannelUnavailable(e.to_string()))?;

        let mut headers = HeaderMap::new();
        headers.insert("Alert-Subject", alert.subject_line().as_str());
        headers.insert("Transaction-Id", alert.transaction_id.as_str());

        self.client
            .publish_with_headers(self.subject.clone(), headers, payload.into())
            .await
            .map_err(|e| NotifyError::ChannelUnavailable(e.to_string()))?;
        self.client
            .flush()
            .await
            .map_err(|e| NotifyError::ChannelUnavailable(e.to_string()))?;

        debug!(
            alert_id = %alert.alert_id,
            transaction_id = %alert.transaction_id,
            fraud_probability = alert.fraud_probability,
            "Published fraud alert"
        );

        Ok(())
    }

    /// Get the subject name
    pub fn subject(&self) -> &str {
        &self.subject
    }
}

#[async_trait]
impl Notifier for AlertProducer {
    async fn send(&self, alert: &FraudAlert) -> Result<(), NotifyError> {
        self.publish(alert).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transformer::FeatureTransformer;
    use crate::types::alert::RiskLevelThresholds;
    use crate::types::scored::{ScoreOutcome, ScoredTransaction};
    use crate::types::transaction::sample_event;

    #[test]
    fn test_encoded_alert_carries_rendered_text() {
        let event = sample_event("tx_77");
        let features = FeatureTransformer::new().transform(&event).unwrap();
        let scored = ScoredTransaction::new(
            event,
            features,
            ScoreOutcome {
                probability: 0.88,
                decision: true,
                model_version: "v3".to_string(),
            },
        );
        let alert = FraudAlert::from_scored(&scored, &RiskLevelThresholds::default());

        let json: serde_json::Value = serde_json::from_slice(&encode_alert(&alert).unwrap()).unwrap();

        assert_eq!(json["transaction_id"], "tx_77");
        assert_eq!(json["risk_level"], "high");
        assert_eq!(json["subject"], alert.subject_line());
        assert_eq!(json["body"], alert.body());
        assert!(json["body"].as_str().unwrap().contains("************9299"));
    }
}
