//! Work items, processing results and hub events
//!
//! A [`WorkItem`] is owned by exactly one worker; it yields exactly one
//! [`ProcessingResult`]. [`HubEvent`] is the `{type, data}` envelope every
//! subscriber receives.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use std::sync::Arc;
use std::time::Duration;

/// Serialized hub event, shared between every subscriber buffer.
pub type Payload = Arc<str>;

/// An inbound unit of work.
#[derive(Debug, Clone)]
pub struct WorkItem {
    /// Source-assigned identifier (stream entry id, sequence number, ...)
    pub id: String,
    /// Opaque payload bytes
    pub payload: Vec<u8>,
    /// When the source handed the item over
    pub received_at: DateTime<Utc>,
}

impl WorkItem {
    pub fn new(id: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id: id.into(),
            payload: payload.into(),
            received_at: Utc::now(),
        }
    }
}

fn serialize_millis<S: Serializer>(latency: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(latency.as_millis() as u64)
}

/// Outcome of processing one [`WorkItem`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingResult {
    pub item_id: String,
    pub accepted: bool,
    /// Classification code, empty when accepted
    pub code: String,
    pub message: String,
    /// Business reference such as a message id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "latencyMs", serialize_with = "serialize_millis")]
    pub latency: Duration,
}

impl ProcessingResult {
    pub fn accepted(item: &WorkItem, message: impl Into<String>, latency: Duration) -> Self {
        Self {
            item_id: item.id.clone(),
            accepted: true,
            code: String::new(),
            message: message.into(),
            reference: None,
            timestamp: Utc::now(),
            latency,
        }
    }

    pub fn rejected(
        item: &WorkItem,
        code: impl Into<String>,
        message: impl Into<String>,
        latency: Duration,
    ) -> Self {
        Self {
            item_id: item.id.clone(),
            accepted: false,
            code: code.into(),
            message: message.into(),
            reference: None,
            timestamp: Utc::now(),
            latency,
        }
    }

    pub fn with_reference(mut self, reference: Option<String>) -> Self {
        self.reference = reference;
        self
    }

    pub fn latency_ms(&self) -> u64 {
        self.latency.as_millis() as u64
    }
}

/// Live pipeline figures pushed to subscribers every second.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetricsUpdate {
    pub total_processed: u64,
    pub messages_per_second: f64,
    pub success_rate: f64,
    pub active_connections: usize,
}

/// Connection state notice.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusUpdate {
    pub status: String,
    pub message: String,
}

impl StatusUpdate {
    pub fn connected() -> Self {
        Self {
            status: "connected".to_string(),
            message: "Connected to relay".to_string(),
        }
    }
}

/// Envelope broadcast to subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum HubEvent {
    /// Per-item outcome, either the raw result or an application summary
    Transaction(serde_json::Value),
    Metrics(MetricsUpdate),
    /// Application-defined balance snapshot
    Balances(serde_json::Value),
    Status(StatusUpdate),
}

impl HubEvent {
    /// Serialize once for fan-out.
    pub fn to_payload(&self) -> Result<Payload, serde_json::Error> {
        Ok(Arc::from(serde_json::to_string(self)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    #[test]
    fn test_result_serializes_latency_in_ms() {
        let item = WorkItem::new("1-0", b"{}".to_vec());
        let result = ProcessingResult::rejected(&item, "INVALID_BIC", "bad bic", Duration::from_micros(12_345))
            .with_reference(Some("MSG-1".into()));

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["itemId"], "1-0");
        assert_eq!(json["accepted"], false);
        assert_eq!(json["code"], "INVALID_BIC");
        assert_eq!(json["reference"], "MSG-1");
        assert_eq!(json["latencyMs"], 12);
    }

    #[test]
    fn test_event_envelope_shape() {
        let payload = HubEvent::Status(StatusUpdate::connected()).to_payload().unwrap();
        let json: Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(json["type"], "status");
        assert_eq!(json["data"]["status"], "connected");

        let metrics = HubEvent::Metrics(MetricsUpdate {
            total_processed: 10,
            messages_per_second: 2.5,
            success_rate: 90.0,
            active_connections: 3,
        });
        let json = serde_json::to_value(&metrics).unwrap();
        assert_eq!(json["type"], "metrics");
        assert_eq!(json["data"]["totalProcessed"], 10);
        assert_eq!(json["data"]["activeConnections"], 3);

        let balances = serde_json::to_value(HubEvent::Balances(json!({"bank-a": 10}))).unwrap();
        assert_eq!(balances["type"], "balances");
    }
}
