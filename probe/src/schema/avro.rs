use apache_avro::types::Value as AvroValue;
use apache_avro::{from_avro_datum, to_avro_datum, Schema};
use once_cell::sync::Lazy;

use super::SerdeError;
use crate::cloudevent::CloudEvent;

/// The registered shape of the CloudEvent key envelope.
pub(crate) const CLOUD_EVENT_AVRO_SCHEMA: &str = r#"{
  "type": "record",
  "name": "CloudEvent",
  "namespace": "io.probe.events",
  "fields": [
    {"name": "id", "type": "string"},
    {"name": "source", "type": "string"},
    {"name": "specversion", "type": "string"},
    {"name": "type", "type": "string"},
    {"name": "time", "type": "string"},
    {"name": "subject", "type": "string"},
    {"name": "datacontenttype", "type": "string"},
    {"name": "correlationid", "type": "string"},
    {"name": "payloadversion", "type": "string"},
    {"name": "time_epoch_micro_source", "type": "long"}
  ]
}"#;

static CLOUD_EVENT_SCHEMA: Lazy<Schema> =
    Lazy::new(|| Schema::parse_str(CLOUD_EVENT_AVRO_SCHEMA).expect("invalid CloudEvent schema"));

pub(crate) struct AvroCodec {
    /// Value schema, parsed from the topic directive. Keys always use the
    /// embedded CloudEvent schema.
    value_schema: Option<Schema>,
}

impl AvroCodec {
    pub(crate) fn for_key() -> Self {
        Self { value_schema: None }
    }

    pub(crate) fn for_value(schema_source: &str) -> Result<Self, SerdeError> {
        let schema = Schema::parse_str(schema_source)
            .map_err(|e| SerdeError::Avro(format!("invalid value schema: {e}")))?;
        Ok(Self {
            value_schema: Some(schema),
        })
    }

    pub(crate) fn encode_key(&self, event: &CloudEvent) -> Result<Vec<u8>, SerdeError> {
        let record = cloud_event_to_avro(event);
        to_avro_datum(&CLOUD_EVENT_SCHEMA, record)
            .map_err(|e| SerdeError::Avro(format!("key encode: {e}")))
    }

    pub(crate) fn decode_key(&self, payload: &[u8]) -> Result<CloudEvent, SerdeError> {
        let mut reader = payload;
        let value = from_avro_datum(&CLOUD_EVENT_SCHEMA, &mut reader, None)
            .map_err(|e| SerdeError::Avro(format!("key decode: {e}")))?;
        avro_to_cloud_event(value)
    }

    pub(crate) fn encode_value(&self, value: &serde_json::Value) -> Result<Vec<u8>, SerdeError> {
        let schema = self.value_schema()?;
        let avro = apache_avro::to_value(value)
            .map_err(|e| SerdeError::Avro(format!("value conversion: {e}")))?
            .resolve(schema)
            .map_err(|e| SerdeError::Avro(format!("value does not match schema: {e}")))?;
        to_avro_datum(schema, avro).map_err(|e| SerdeError::Avro(format!("value encode: {e}")))
    }

    pub(crate) fn decode_value(&self, payload: &[u8]) -> Result<serde_json::Value, SerdeError> {
        let schema = self.value_schema()?;
        let mut reader = payload;
        let value = from_avro_datum(schema, &mut reader, None)
            .map_err(|e| SerdeError::Avro(format!("value decode: {e}")))?;
        avro_value_to_json(value)
    }

    fn value_schema(&self) -> Result<&Schema, SerdeError> {
        self.value_schema
            .as_ref()
            .ok_or_else(|| SerdeError::Avro("codec built for keys, no value schema".to_string()))
    }
}

fn cloud_event_to_avro(event: &CloudEvent) -> AvroValue {
    AvroValue::Record(vec![
        ("id".into(), AvroValue::String(event.id.clone())),
        ("source".into(), AvroValue::String(event.source.clone())),
        ("specversion".into(), AvroValue::String(event.specversion.clone())),
        ("type".into(), AvroValue::String(event.event_type.clone())),
        ("time".into(), AvroValue::String(event.time.clone())),
        ("subject".into(), AvroValue::String(event.subject.clone())),
        (
            "datacontenttype".into(),
            AvroValue::String(event.datacontenttype.clone()),
        ),
        (
            "correlationid".into(),
            AvroValue::String(event.correlationid.clone()),
        ),
        (
            "payloadversion".into(),
            AvroValue::String(event.payloadversion.clone()),
        ),
        (
            "time_epoch_micro_source".into(),
            AvroValue::Long(event.time_epoch_micro_source),
        ),
    ])
}

fn avro_to_cloud_event(value: AvroValue) -> Result<CloudEvent, SerdeError> {
    let AvroValue::Record(fields) = value else {
        return Err(SerdeError::Avro("key is not a record".to_string()));
    };

    let mut event = CloudEvent {
        id: String::new(),
        source: String::new(),
        specversion: String::new(),
        event_type: String::new(),
        time: String::new(),
        subject: String::new(),
        datacontenttype: String::new(),
        correlationid: String::new(),
        payloadversion: String::new(),
        time_epoch_micro_source: 0,
    };
    for (name, field) in fields {
        match (name.as_str(), field) {
            ("id", AvroValue::String(v)) => event.id = v,
            ("source", AvroValue::String(v)) => event.source = v,
            ("specversion", AvroValue::String(v)) => event.specversion = v,
            ("type", AvroValue::String(v)) => event.event_type = v,
            ("time", AvroValue::String(v)) => event.time = v,
            ("subject", AvroValue::String(v)) => event.subject = v,
            ("datacontenttype", AvroValue::String(v)) => event.datacontenttype = v,
            ("correlationid", AvroValue::String(v)) => event.correlationid = v,
            ("payloadversion", AvroValue::String(v)) => event.payloadversion = v,
            ("time_epoch_micro_source", AvroValue::Long(v)) => {
                event.time_epoch_micro_source = v
            }
            (name, other) => {
                return Err(SerdeError::Avro(format!(
                    "unexpected key field {name}: {other:?}"
                )))
            }
        }
    }
    Ok(event)
}

/// Project a decoded Avro value onto the JSON document shape the event
/// registry indexes.
fn avro_value_to_json(value: AvroValue) -> Result<serde_json::Value, SerdeError> {
    use serde_json::Value as Json;

    Ok(match value {
        AvroValue::Null => Json::Null,
        AvroValue::Boolean(b) => Json::Bool(b),
        AvroValue::Int(i) => Json::from(i),
        AvroValue::Long(l) => Json::from(l),
        AvroValue::Float(f) => Json::from(f),
        AvroValue::Double(d) => Json::from(d),
        AvroValue::String(s) => Json::String(s),
        AvroValue::Enum(_, symbol) => Json::String(symbol),
        AvroValue::Bytes(bytes) | AvroValue::Fixed(_, bytes) => {
            Json::Array(bytes.into_iter().map(Json::from).collect())
        }
        AvroValue::Union(_, inner) => avro_value_to_json(*inner)?,
        AvroValue::Array(items) => Json::Array(
            items
                .into_iter()
                .map(avro_value_to_json)
                .collect::<Result<_, _>>()?,
        ),
        AvroValue::Map(entries) => Json::Object(
            entries
                .into_iter()
                .map(|(k, v)| avro_value_to_json(v).map(|v| (k, v)))
                .collect::<Result<_, _>>()?,
        ),
        AvroValue::Record(fields) => Json::Object(
            fields
                .into_iter()
                .map(|(k, v)| avro_value_to_json(v).map(|v| (k, v)))
                .collect::<Result<_, _>>()?,
        ),
        other => {
            return Err(SerdeError::Avro(format!(
                "unsupported avro value in payload: {other:?}"
            )))
        }
    })
}
