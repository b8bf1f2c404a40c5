//! Multi-format serializer/deserializer factory for Kafka records.
//!
//! Every record key is a CloudEvent; values are JSON documents projected to
//! the topic's wire encoding. Codecs are cached per `(topic, record,
//! key|value)` and registered with the Schema Registry under
//! TopicRecordNameStrategy subjects (`{topic}-{RecordName}`), which permits
//! several record types on one topic.

pub mod avro;
pub mod client;
pub mod json;
pub mod protobuf;

use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;

use crate::cloudevent::CloudEvent;
use crate::model::SchemaType;
use client::{SchemaRegistryClient, SchemaRegistryError};

pub const CLOUD_EVENT_RECORD_NAME: &str = "CloudEvent";

/// Confluent wire format magic byte.
const MAGIC: u8 = 0x00;

#[derive(Error, Debug)]
pub enum SerdeError {
    #[error(transparent)]
    Registry(#[from] SchemaRegistryError),
    #[error("avro: {0}")]
    Avro(String),
    #[error("protobuf: {0}")]
    Protobuf(String),
    #[error("json: {0}")]
    Json(String),
    #[error("wire frame: {0}")]
    Frame(String),
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct CodecKey {
    topic: String,
    record: String,
    is_key: bool,
}

enum CodecKind {
    Avro(avro::AvroCodec),
    Protobuf(protobuf::ProtoCodec),
    Json(json::JsonCodec),
}

/// A ready-to-use serializer/deserializer for one record type on one topic,
/// bound to its registered schema id.
pub struct RecordCodec {
    pub subject: String,
    pub schema_id: i32,
    pub schema_type: SchemaType,
    kind: CodecKind,
}

impl RecordCodec {
    pub fn encode_key(&self, event: &CloudEvent) -> Result<Vec<u8>, SerdeError> {
        let payload = match &self.kind {
            CodecKind::Avro(codec) => codec.encode_key(event)?,
            CodecKind::Protobuf(codec) => codec.encode_key(event)?,
            CodecKind::Json(codec) => codec.encode_key(event)?,
        };
        Ok(self.frame(&payload))
    }

    pub fn decode_key(&self, bytes: &[u8]) -> Result<CloudEvent, SerdeError> {
        let payload = self.unframe(bytes)?;
        match &self.kind {
            CodecKind::Avro(codec) => codec.decode_key(payload),
            CodecKind::Protobuf(codec) => codec.decode_key(payload),
            CodecKind::Json(codec) => codec.decode_key(payload),
        }
    }

    pub fn encode_value(&self, value: &serde_json::Value) -> Result<Vec<u8>, SerdeError> {
        let payload = match &self.kind {
            CodecKind::Avro(codec) => codec.encode_value(value)?,
            CodecKind::Protobuf(codec) => codec.encode_value(value)?,
            CodecKind::Json(codec) => codec.encode_value(value)?,
        };
        Ok(self.frame(&payload))
    }

    pub fn decode_value(&self, bytes: &[u8]) -> Result<serde_json::Value, SerdeError> {
        let payload = self.unframe(bytes)?;
        match &self.kind {
            CodecKind::Avro(codec) => codec.decode_value(payload),
            CodecKind::Protobuf(codec) => codec.decode_value(payload),
            CodecKind::Json(codec) => codec.decode_value(payload),
        }
    }

    /// `[0x00][4-byte schema id][indexes?][payload]`
    fn frame(&self, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(payload.len() + 6);
        out.push(MAGIC);
        out.extend_from_slice(&self.schema_id.to_be_bytes());
        if self.schema_type == SchemaType::Protobuf {
            protobuf::write_message_indexes(&[0], &mut out);
        }
        out.extend_from_slice(payload);
        out
    }

    fn unframe<'a>(&self, bytes: &'a [u8]) -> Result<&'a [u8], SerdeError> {
        if bytes.len() < 5 {
            return Err(SerdeError::Frame(format!(
                "record too short: {} bytes",
                bytes.len()
            )));
        }
        if bytes[0] != MAGIC {
            return Err(SerdeError::Frame(format!("bad magic byte {:#04x}", bytes[0])));
        }
        let rest = &bytes[5..];
        if self.schema_type == SchemaType::Protobuf {
            let (_, used) = protobuf::read_message_indexes(rest)?;
            Ok(&rest[used..])
        } else {
            Ok(rest)
        }
    }

    /// Schema id from a framed record, without decoding the payload.
    pub fn schema_id_of(bytes: &[u8]) -> Result<i32, SerdeError> {
        if bytes.len() < 5 || bytes[0] != MAGIC {
            return Err(SerdeError::Frame("not a framed record".to_string()));
        }
        Ok(i32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]))
    }
}

/// Process-wide codec factory. Owned by the root supervisor; consulted by
/// the streaming workers on initialization.
pub struct SerdeFactory {
    registry: Arc<SchemaRegistryClient>,
    codecs: DashMap<CodecKey, Arc<RecordCodec>>,
}

impl SerdeFactory {
    pub fn new(registry: Arc<SchemaRegistryClient>) -> Self {
        Self {
            registry,
            codecs: DashMap::new(),
        }
    }

    /// Codec for CloudEvent keys on a topic.
    pub async fn key_codec(
        &self,
        topic: &str,
        schema_type: SchemaType,
    ) -> Result<Arc<RecordCodec>, SerdeError> {
        let key = CodecKey {
            topic: topic.to_string(),
            record: CLOUD_EVENT_RECORD_NAME.to_string(),
            is_key: true,
        };
        if let Some(codec) = self.codecs.get(&key) {
            return Ok(codec.clone());
        }

        let schema_source = match schema_type {
            SchemaType::Avro => avro::CLOUD_EVENT_AVRO_SCHEMA,
            SchemaType::Protobuf => protobuf::CLOUD_EVENT_PROTO_SCHEMA,
            SchemaType::Json => json::CLOUD_EVENT_JSON_SCHEMA,
        };
        let kind = match schema_type {
            SchemaType::Avro => CodecKind::Avro(avro::AvroCodec::for_key()),
            SchemaType::Protobuf => CodecKind::Protobuf(protobuf::ProtoCodec),
            SchemaType::Json => CodecKind::Json(json::JsonCodec),
        };
        self.build(key, schema_type, schema_source, kind).await
    }

    /// Codec for one value record type on a topic. Avro values require the
    /// directive-supplied schema; JSON falls back to a permissive one.
    pub async fn value_codec(
        &self,
        topic: &str,
        schema_type: SchemaType,
        record_name: &str,
        schema_source: Option<&str>,
    ) -> Result<Arc<RecordCodec>, SerdeError> {
        let key = CodecKey {
            topic: topic.to_string(),
            record: record_name.to_string(),
            is_key: false,
        };
        if let Some(codec) = self.codecs.get(&key) {
            return Ok(codec.clone());
        }

        let (schema_source, kind) = match schema_type {
            SchemaType::Avro => {
                let source = schema_source.ok_or_else(|| {
                    SerdeError::Avro(format!("no value schema for {record_name} on {topic}"))
                })?;
                (source.to_string(), CodecKind::Avro(avro::AvroCodec::for_value(source)?))
            }
            SchemaType::Protobuf => (
                schema_source
                    .unwrap_or(protobuf::STRUCT_PAYLOAD_PROTO_SCHEMA)
                    .to_string(),
                CodecKind::Protobuf(protobuf::ProtoCodec),
            ),
            SchemaType::Json => (
                schema_source
                    .unwrap_or(json::PERMISSIVE_JSON_SCHEMA)
                    .to_string(),
                CodecKind::Json(json::JsonCodec),
            ),
        };
        self.build(key, schema_type, &schema_source, kind).await
    }

    async fn build(
        &self,
        key: CodecKey,
        schema_type: SchemaType,
        schema_source: &str,
        kind: CodecKind,
    ) -> Result<Arc<RecordCodec>, SerdeError> {
        // TopicRecordNameStrategy: no -key/-value suffix
        let subject = format!("{}-{}", key.topic, key.record);
        let schema_id = self
            .registry
            .register(&subject, schema_source, schema_type)
            .await?;
        let codec = Arc::new(RecordCodec {
            subject,
            schema_id,
            schema_type,
            kind,
        });
        self.codecs.insert(key, codec.clone());
        Ok(codec)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    async fn factory_with_mock() -> (mockito::ServerGuard, SerdeFactory) {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", mockito::Matcher::Regex(r"^/subjects/.+/versions$".to_string()))
            .with_status(200)
            .with_body(r#"{"id": 17}"#)
            .expect_at_least(1)
            .create_async()
            .await;
        let registry = Arc::new(
            SchemaRegistryClient::new(&server.url(), Duration::from_secs(2)).unwrap(),
        );
        (server, SerdeFactory::new(registry))
    }

    #[tokio::test]
    async fn subjects_follow_topic_record_name_strategy() {
        let (_server, factory) = factory_with_mock().await;
        let codec = factory.key_codec("orders", SchemaType::Avro).await.unwrap();
        assert_eq!(codec.subject, "orders-CloudEvent");

        let value = factory
            .value_codec("orders", SchemaType::Json, "OrderCreated", None)
            .await
            .unwrap();
        assert_eq!(value.subject, "orders-OrderCreated");
        assert!(!value.subject.ends_with("-value"));
    }

    #[tokio::test]
    async fn key_round_trips_through_all_three_formats() {
        let (_server, factory) = factory_with_mock().await;
        let mut event = CloudEvent::new("probe", "OrderEvent", "orders", "corr-1", "1.0");
        event.subject = String::new();
        event.correlationid = "corr-日本語".to_string();
        event.time_epoch_micro_source = i64::MAX;

        for schema_type in [SchemaType::Avro, SchemaType::Protobuf, SchemaType::Json] {
            let codec = factory.key_codec("orders", schema_type).await.unwrap();
            let bytes = codec.encode_key(&event).unwrap();
            assert_eq!(bytes[0], 0x00);
            assert_eq!(RecordCodec::schema_id_of(&bytes).unwrap(), 17);
            assert_eq!(codec.decode_key(&bytes).unwrap(), event, "{schema_type:?}");
        }
    }

    #[tokio::test]
    async fn two_record_types_share_a_topic_with_distinct_subjects() {
        let (_server, factory) = factory_with_mock().await;
        let order = factory
            .value_codec("events", SchemaType::Json, "OrderCreated", None)
            .await
            .unwrap();
        let payment = factory
            .value_codec("events", SchemaType::Json, "PaymentProcessed", None)
            .await
            .unwrap();
        assert_ne!(order.subject, payment.subject);

        let order_bytes = order.encode_value(&serde_json::json!({"o": 1})).unwrap();
        let payment_bytes = payment.encode_value(&serde_json::json!({"p": 2})).unwrap();
        assert_eq!(order.decode_value(&order_bytes).unwrap(), serde_json::json!({"o": 1}));
        assert_eq!(
            payment.decode_value(&payment_bytes).unwrap(),
            serde_json::json!({"p": 2})
        );
    }

    #[tokio::test]
    async fn codecs_are_cached_per_pairing() {
        let (_server, factory) = factory_with_mock().await;
        let first = factory.key_codec("orders", SchemaType::Json).await.unwrap();
        let second = factory.key_codec("orders", SchemaType::Json).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn unframe_rejects_garbage() {
        let codec = RecordCodec {
            subject: "orders-CloudEvent".to_string(),
            schema_id: 1,
            schema_type: SchemaType::Json,
            kind: CodecKind::Json(json::JsonCodec),
        };
        assert!(codec.decode_value(b"xx").is_err());
        assert!(codec.decode_value(&[0x01, 0, 0, 0, 1, b'{']).is_err());
    }
}
