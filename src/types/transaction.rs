//! Transaction event as it arrives on the ingress stream

use crate::errors::TransformError;
use serde::{Deserialize, Serialize};

/// Raw card transaction published by the upstream producer.
///
/// Field names follow the producer's wire format. Timestamps are kept as the
/// producer's strings; parsing them is the feature transformer's job so that a
/// malformed date surfaces as a transform error rather than a decode error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionEvent {
    /// Unique transaction identifier (idempotency and dedup key)
    pub transaction_id: String,

    /// Transaction time, `%Y-%m-%d %H:%M:%S`
    pub trans_date_trans_time: String,

    /// Transaction amount in currency units
    pub amt: f64,

    pub category: String,
    pub job: String,
    pub gender: String,
    pub merchant: String,

    /// Customer latitude
    pub lat: f64,
    /// Customer longitude
    pub long: f64,
    /// Merchant latitude
    pub merch_lat: f64,
    /// Merchant longitude
    pub merch_long: f64,

    /// Population of the customer's city
    pub city_pop: i64,

    /// Date of birth, `%Y-%m-%d`
    pub dob: String,

    /// Card number; the producer keys messages by it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cc_num: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub street: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zip: Option<String>,
}

impl TransactionEvent {
    /// Decode an event from its JSON wire form.
    ///
    /// A payload missing any required field is rejected here; no defaults are
    /// substituted.
    pub fn from_slice(payload: &[u8]) -> Result<Self, TransformError> {
        serde_json::from_slice(payload).map_err(|e| TransformError::MalformedPayload(e.to_string()))
    }

    /// Key used to keep events for the same entity in arrival order.
    ///
    /// The card number when present, otherwise the transaction id.
    pub fn partition_key(&self) -> &str {
        self.cc_num
            .as_deref()
            .filter(|c| !c.is_empty())
            .unwrap_or(&self.transaction_id)
    }

    /// Human readable location of the customer, as shown in alerts.
    pub fn location(&self) -> String {
        [&self.street, &self.city, &self.state]
            .iter()
            .filter_map(|part| part.as_deref())
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[cfg(test)]
pub(crate) fn sample_event(transaction_id: &str) -> TransactionEvent {
    TransactionEvent {
        transaction_id: transaction_id.to_string(),
        trans_date_trans_time: "2024-03-15 14:30:00".to_string(),
        amt: 250.0,
        category: "shopping_net".to_string(),
        job: "Engineer, biomedical".to_string(),
        gender: "F".to_string(),
        merchant: "fraud_Kilback LLC".to_string(),
        lat: 40.0,
        long: -75.0,
        merch_lat: 40.1,
        merch_long: -75.1,
        city_pop: 120_000,
        dob: "1990-06-01".to_string(),
        cc_num: Some("4263982640269299".to_string()),
        first: Some("Jane".to_string()),
        last: Some("Doe".to_string()),
        street: Some("12 Main St".to_string()),
        city: Some("Allentown".to_string()),
        state: Some("PA".to_string()),
        zip: Some("18101".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_producer_payload() {
        let payload = br#"{
            "transaction_id": "c1d2",
            "trans_date_trans_time": "2024-03-15 14:30:00",
            "cc_num": "4263982640269299",
            "merchant": "fraud_Kilback LLC",
            "category": "shopping_net",
            "amt": 250.0,
            "first": "Jane",
            "last": "Doe",
            "gender": "F",
            "street": "12 Main St",
            "city": "Allentown",
            "state": "PA",
            "zip": "18101",
            "lat": 40.0,
            "long": -75.0,
            "city_pop": 120000,
            "job": "Engineer, biomedical",
            "dob": "1990-06-01",
            "merch_lat": 40.1,
            "merch_long": -75.1
        }"#;

        let event = TransactionEvent::from_slice(payload).unwrap();
        assert_eq!(event.transaction_id, "c1d2");
        assert_eq!(event.partition_key(), "4263982640269299");
        assert_eq!(event.location(), "12 Main St, Allentown, PA");
    }

    #[test]
    fn test_missing_required_field_is_rejected() {
        let mut value = serde_json::to_value(sample_event("tx_1")).unwrap();
        value.as_object_mut().unwrap().remove("dob");
        let payload = serde_json::to_vec(&value).unwrap();

        let err = TransactionEvent::from_slice(&payload).unwrap_err();
        match err {
            TransformError::MalformedPayload(msg) => assert!(msg.contains("dob")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_partition_key_falls_back_to_transaction_id() {
        let mut event = sample_event("tx_9");
        event.cc_num = None;
        assert_eq!(event.partition_key(), "tx_9");
    }
}
