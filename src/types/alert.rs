//! Fraud alert data structures

use crate::types::scored::ScoredTransaction;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Risk level classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    /// Determine risk level from score and thresholds
    pub fn from_score(score: f64, thresholds: &RiskLevelThresholds) -> Self {
        if score >= thresholds.critical {
            RiskLevel::Critical
        } else if score >= thresholds.high {
            RiskLevel::High
        } else if score >= thresholds.medium {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }
}

/// Configurable risk level thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskLevelThresholds {
    pub medium: f64,
    pub high: f64,
    pub critical: f64,
}

impl Default for RiskLevelThresholds {
    fn default() -> Self {
        Self {
            medium: 0.6,
            high: 0.8,
            critical: 0.95,
        }
    }
}

/// Alert sent to the notification channel for a transaction classified as fraud
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FraudAlert {
    /// Unique alert identifier
    pub alert_id: String,

    /// Associated transaction ID
    pub transaction_id: String,

    /// Transaction time as reported by the producer
    pub transaction_time: String,

    pub amount: f64,
    pub merchant: String,
    pub category: String,

    /// Customer location (street, city, state)
    pub location: String,

    /// Card number with all but the last four digits masked
    pub card: Option<String>,

    /// Fraud probability (0.0 - 1.0)
    pub fraud_probability: f64,

    pub risk_level: RiskLevel,

    pub model_version: String,

    /// Alert generation timestamp
    pub timestamp: DateTime<Utc>,
}

impl FraudAlert {
    /// Build an alert for a scored transaction
    pub fn from_scored(scored: &ScoredTransaction, thresholds: &RiskLevelThresholds) -> Self {
        let event = &scored.event;
        Self {
            alert_id: uuid::Uuid::new_v4().to_string(),
            transaction_id: event.transaction_id.clone(),
            transaction_time: event.trans_date_trans_time.clone(),
            amount: event.amt,
            merchant: event.merchant.clone(),
            category: event.category.clone(),
            location: event.location(),
            card: event.cc_num.as_deref().map(mask_card),
            fraud_probability: scored.outcome.probability,
            risk_level: RiskLevel::from_score(scored.outcome.probability, thresholds),
            model_version: scored.outcome.model_version.clone(),
            timestamp: Utc::now(),
        }
    }

    pub fn subject_line(&self) -> String {
        format!(
            "Fraud Alert [{}]: suspicious transaction {}",
            self.risk_level.as_str(),
            self.transaction_id
        )
    }

    /// Plain-text body for mail-style channels
    pub fn body(&self) -> String {
        format!(
            "FRAUD DETECTED\n\
             ---------------------------\n\
             Transaction ID      : {}\n\
             Transaction Time    : {}\n\
             Card                : {}\n\
             Amount              : ${:.2}\n\
             Merchant            : {}\n\
             Category            : {}\n\
             Location            : {}\n\
             Fraud Probability   : {:.3} ({})\n\
             ---------------------------\n\
             Please review this transaction immediately.\n",
            self.transaction_id,
            self.transaction_time,
            self.card.as_deref().unwrap_or("n/a"),
            self.amount,
            self.merchant,
            self.category,
            self.location,
            self.fraud_probability,
            self.risk_level.as_str(),
        )
    }
}

fn mask_card(card: &str) -> String {
    let digits: Vec<char> = card.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() <= 4 {
        return "*".repeat(digits.len());
    }
    let tail: String = digits[digits.len() - 4..].iter().collect();
    format!("{}{}", "*".repeat(digits.len() - 4), tail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transformer::FeatureTransformer;
    use crate::types::scored::ScoreOutcome;
    use crate::types::transaction::sample_event;

    fn scored(probability: f64) -> ScoredTransaction {
        let event = sample_event("tx_123");
        let features = FeatureTransformer::new().transform(&event).unwrap();
        ScoredTransaction::new(
            event,
            features,
            ScoreOutcome {
                probability,
                decision: true,
                model_version: "v7".to_string(),
            },
        )
    }

    #[test]
    fn test_risk_level_from_score() {
        let thresholds = RiskLevelThresholds::default();

        assert_eq!(RiskLevel::from_score(0.5, &thresholds), RiskLevel::Low);
        assert_eq!(RiskLevel::from_score(0.6, &thresholds), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_score(0.85, &thresholds), RiskLevel::High);
        assert_eq!(RiskLevel::from_score(0.99, &thresholds), RiskLevel::Critical);
    }

    #[test]
    fn test_alert_carries_transaction_details() {
        let alert = FraudAlert::from_scored(&scored(0.97), &RiskLevelThresholds::default());

        assert_eq!(alert.transaction_id, "tx_123");
        assert_eq!(alert.amount, 250.0);
        assert_eq!(alert.location, "12 Main St, Allentown, PA");
        assert_eq!(alert.card.as_deref(), Some("************9299"));
        assert_eq!(alert.risk_level, RiskLevel::Critical);

        let body = alert.body();
        assert!(body.contains("tx_123"));
        assert!(body.contains("fraud_Kilback LLC"));
        assert!(body.contains("shopping_net"));
        assert!(!body.contains("4263982640269299"));
    }
}
