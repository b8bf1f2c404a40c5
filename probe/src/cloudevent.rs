use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The envelope used as every Kafka record's key. The `correlationid` joins
/// a produced stimulus with the events the system under test emits in
/// response; it must survive produce → Kafka → consume → lookup bit-exactly.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct CloudEvent {
    pub id: String,
    pub source: String,
    pub specversion: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub time: String,
    pub subject: String,
    pub datacontenttype: String,
    pub correlationid: String,
    pub payloadversion: String,
    pub time_epoch_micro_source: i64,
}

impl CloudEvent {
    /// Build an envelope for a produced event. Everything the scenario step
    /// does not control is stamped here.
    pub fn new(
        source: &str,
        event_type: &str,
        subject: &str,
        correlation_id: &str,
        payload_version: &str,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7().to_string(),
            source: source.to_string(),
            specversion: "1.0".to_string(),
            event_type: event_type.to_string(),
            time: now.to_rfc3339(),
            subject: subject.to_string(),
            datacontenttype: "application/json".to_string(),
            correlationid: correlation_id.to_string(),
            payloadversion: payload_version.to_string(),
            time_epoch_micro_source: now.timestamp_micros(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_shape_uses_cloudevent_attribute_names() {
        let event = CloudEvent::new("probe", "OrderEvent", "orders", "corr-1", "1.0");
        let value = serde_json::to_value(&event).unwrap();
        // `type` is a reserved word in Rust but not on the wire
        assert_eq!(value["type"], "OrderEvent");
        assert_eq!(value["correlationid"], "corr-1");
        assert!(value.get("event_type").is_none());
    }

    #[test]
    fn round_trips_through_json() {
        let event = CloudEvent::new("probe", "OrderEvent", "orders", "corr-1", "1.0");
        let bytes = serde_json::to_vec(&event).unwrap();
        let back: CloudEvent = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(event, back);
    }
}
