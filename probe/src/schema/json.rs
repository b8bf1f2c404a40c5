use super::SerdeError;
use crate::cloudevent::CloudEvent;

/// Default JSON Schema registered for topics whose directive does not carry
/// one. Accepts any document, matching the forward-compatible stance of not
/// failing on unknown properties.
pub(crate) const PERMISSIVE_JSON_SCHEMA: &str = r#"{"type": "object"}"#;

pub(crate) const CLOUD_EVENT_JSON_SCHEMA: &str = r#"{
  "$schema": "http://json-schema.org/draft-07/schema#",
  "title": "CloudEvent",
  "type": "object",
  "required": [
    "id", "source", "specversion", "type", "time", "subject",
    "datacontenttype", "correlationid", "payloadversion",
    "time_epoch_micro_source"
  ],
  "properties": {
    "id": {"type": "string"},
    "source": {"type": "string"},
    "specversion": {"type": "string"},
    "type": {"type": "string"},
    "time": {"type": "string"},
    "subject": {"type": "string"},
    "datacontenttype": {"type": "string"},
    "correlationid": {"type": "string"},
    "payloadversion": {"type": "string"},
    "time_epoch_micro_source": {"type": "integer"}
  }
}"#;

pub(crate) struct JsonCodec;

impl JsonCodec {
    pub(crate) fn encode_key(&self, event: &CloudEvent) -> Result<Vec<u8>, SerdeError> {
        serde_json::to_vec(event).map_err(|e| SerdeError::Json(format!("key encode: {e}")))
    }

    pub(crate) fn decode_key(&self, payload: &[u8]) -> Result<CloudEvent, SerdeError> {
        // unknown properties are accepted and dropped
        serde_json::from_slice(payload).map_err(|e| SerdeError::Json(format!("key decode: {e}")))
    }

    pub(crate) fn encode_value(&self, value: &serde_json::Value) -> Result<Vec<u8>, SerdeError> {
        serde_json::to_vec(value).map_err(|e| SerdeError::Json(format!("value encode: {e}")))
    }

    pub(crate) fn decode_value(&self, payload: &[u8]) -> Result<serde_json::Value, SerdeError> {
        serde_json::from_slice(payload)
            .map_err(|e| SerdeError::Json(format!("value decode: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_round_trips_and_ignores_unknown_properties() {
        let codec = JsonCodec;
        let event = CloudEvent::new("probe", "PaymentProcessed", "payments", "corr-2", "1.0");
        let bytes = codec.encode_key(&event).unwrap();
        assert_eq!(codec.decode_key(&bytes).unwrap(), event);

        // a writer with extra attributes still decodes
        let mut extended: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        extended["extension-attribute"] = serde_json::json!("ignored");
        let re_encoded = serde_json::to_vec(&extended).unwrap();
        assert_eq!(codec.decode_key(&re_encoded).unwrap(), event);
    }
}
