use prost::Message;

use super::SerdeError;
use crate::cloudevent::CloudEvent;

/// The registered proto source for CloudEvent keys. The in-process
/// descriptor is the hand-written [`CloudEventPb`] message below; the two
/// must stay in sync.
pub(crate) const CLOUD_EVENT_PROTO_SCHEMA: &str = r#"syntax = "proto3";
package io.probe.events;

message CloudEvent {
  string id = 1;
  string source = 2;
  string specversion = 3;
  string type = 4;
  string time = 5;
  string subject = 6;
  string datacontenttype = 7;
  string correlationid = 8;
  string payloadversion = 9;
  int64 time_epoch_micro_source = 10;
}
"#;

/// Registered source for generic struct-shaped payload values.
pub(crate) const STRUCT_PAYLOAD_PROTO_SCHEMA: &str = r#"syntax = "proto3";
package io.probe.events;

import "google/protobuf/struct.proto";

message EventPayload {
  google.protobuf.Struct data = 1;
}
"#;

#[derive(Clone, PartialEq, Message)]
pub struct CloudEventPb {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub source: String,
    #[prost(string, tag = "3")]
    pub specversion: String,
    #[prost(string, tag = "4")]
    pub r#type: String,
    #[prost(string, tag = "5")]
    pub time: String,
    #[prost(string, tag = "6")]
    pub subject: String,
    #[prost(string, tag = "7")]
    pub datacontenttype: String,
    #[prost(string, tag = "8")]
    pub correlationid: String,
    #[prost(string, tag = "9")]
    pub payloadversion: String,
    #[prost(int64, tag = "10")]
    pub time_epoch_micro_source: i64,
}

impl From<&CloudEvent> for CloudEventPb {
    fn from(event: &CloudEvent) -> Self {
        Self {
            id: event.id.clone(),
            source: event.source.clone(),
            specversion: event.specversion.clone(),
            r#type: event.event_type.clone(),
            time: event.time.clone(),
            subject: event.subject.clone(),
            datacontenttype: event.datacontenttype.clone(),
            correlationid: event.correlationid.clone(),
            payloadversion: event.payloadversion.clone(),
            time_epoch_micro_source: event.time_epoch_micro_source,
        }
    }
}

impl From<CloudEventPb> for CloudEvent {
    fn from(pb: CloudEventPb) -> Self {
        Self {
            id: pb.id,
            source: pb.source,
            specversion: pb.specversion,
            event_type: pb.r#type,
            time: pb.time,
            subject: pb.subject,
            datacontenttype: pb.datacontenttype,
            correlationid: pb.correlationid,
            payloadversion: pb.payloadversion,
            time_epoch_micro_source: pb.time_epoch_micro_source,
        }
    }
}

pub(crate) struct ProtoCodec;

impl ProtoCodec {
    pub(crate) fn encode_key(&self, event: &CloudEvent) -> Result<Vec<u8>, SerdeError> {
        Ok(CloudEventPb::from(event).encode_to_vec())
    }

    pub(crate) fn decode_key(&self, payload: &[u8]) -> Result<CloudEvent, SerdeError> {
        let pb = CloudEventPb::decode(payload)
            .map_err(|e| SerdeError::Protobuf(format!("key decode: {e}")))?;
        Ok(pb.into())
    }

    pub(crate) fn encode_value(&self, value: &serde_json::Value) -> Result<Vec<u8>, SerdeError> {
        let serde_json::Value::Object(fields) = value else {
            return Err(SerdeError::Protobuf(
                "protobuf payloads must be JSON objects".to_string(),
            ));
        };
        let pb = prost_types::Struct {
            fields: fields
                .iter()
                .map(|(k, v)| (k.clone(), json_to_proto_value(v)))
                .collect(),
        };
        Ok(pb.encode_to_vec())
    }

    pub(crate) fn decode_value(&self, payload: &[u8]) -> Result<serde_json::Value, SerdeError> {
        let pb = prost_types::Struct::decode(payload)
            .map_err(|e| SerdeError::Protobuf(format!("value decode: {e}")))?;
        Ok(serde_json::Value::Object(
            pb.fields
                .into_iter()
                .map(|(k, v)| (k, proto_value_to_json(v)))
                .collect(),
        ))
    }
}

fn json_to_proto_value(value: &serde_json::Value) -> prost_types::Value {
    use prost_types::value::Kind;

    let kind = match value {
        serde_json::Value::Null => Kind::NullValue(0),
        serde_json::Value::Bool(b) => Kind::BoolValue(*b),
        serde_json::Value::Number(n) => Kind::NumberValue(n.as_f64().unwrap_or(f64::NAN)),
        serde_json::Value::String(s) => Kind::StringValue(s.clone()),
        serde_json::Value::Array(items) => Kind::ListValue(prost_types::ListValue {
            values: items.iter().map(json_to_proto_value).collect(),
        }),
        serde_json::Value::Object(fields) => Kind::StructValue(prost_types::Struct {
            fields: fields
                .iter()
                .map(|(k, v)| (k.clone(), json_to_proto_value(v)))
                .collect(),
        }),
    };
    prost_types::Value { kind: Some(kind) }
}

fn proto_value_to_json(value: prost_types::Value) -> serde_json::Value {
    use prost_types::value::Kind;

    match value.kind {
        None | Some(Kind::NullValue(_)) => serde_json::Value::Null,
        Some(Kind::BoolValue(b)) => serde_json::Value::Bool(b),
        Some(Kind::NumberValue(n)) => serde_json::Number::from_f64(n)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Some(Kind::StringValue(s)) => serde_json::Value::String(s),
        Some(Kind::ListValue(list)) => {
            serde_json::Value::Array(list.values.into_iter().map(proto_value_to_json).collect())
        }
        Some(Kind::StructValue(pb)) => serde_json::Value::Object(
            pb.fields
                .into_iter()
                .map(|(k, v)| (k, proto_value_to_json(v)))
                .collect(),
        ),
    }
}

// Confluent's protobuf wire format carries a zigzag-varint message-index
// list between the schema id and the payload; `[0]` (one byte) addresses
// the first message of a schema.

pub(crate) fn write_message_indexes(indexes: &[i32], out: &mut Vec<u8>) {
    if indexes == [0] {
        out.push(0);
        return;
    }
    write_zigzag_varint(indexes.len() as i64, out);
    for index in indexes {
        write_zigzag_varint(*index as i64, out);
    }
}

pub(crate) fn read_message_indexes(payload: &[u8]) -> Result<(Vec<i32>, usize), SerdeError> {
    let (count, mut offset) = read_zigzag_varint(payload)?;
    if count == 0 {
        return Ok((vec![0], offset));
    }
    let mut indexes = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let (index, used) = read_zigzag_varint(&payload[offset..])?;
        indexes.push(index as i32);
        offset += used;
    }
    Ok((indexes, offset))
}

fn write_zigzag_varint(value: i64, out: &mut Vec<u8>) {
    let mut encoded = ((value << 1) ^ (value >> 63)) as u64;
    loop {
        let byte = (encoded & 0x7f) as u8;
        encoded >>= 7;
        if encoded == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

fn read_zigzag_varint(payload: &[u8]) -> Result<(i64, usize), SerdeError> {
    let mut value: u64 = 0;
    for (i, byte) in payload.iter().enumerate() {
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            let decoded = ((value >> 1) as i64) ^ -((value & 1) as i64);
            return Ok((decoded, i + 1));
        }
        if i >= 9 {
            break;
        }
    }
    Err(SerdeError::Frame("truncated varint".to_string()))
}
