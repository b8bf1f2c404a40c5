use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Opaque identifier minted on admission, stable for the life of a test.
pub type TestId = Uuid;

/// Wire encoding of a topic's keys or values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaType {
    Json,
    Avro,
    Protobuf,
}

impl SchemaType {
    /// Name used by the Schema Registry REST API.
    pub fn registry_name(&self) -> &'static str {
        match self {
            SchemaType::Json => "JSON",
            SchemaType::Avro => "AVRO",
            SchemaType::Protobuf => "PROTOBUF",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TopicRole {
    Producer,
    Consumer,
}

impl fmt::Display for TopicRole {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TopicRole::Producer => write!(f, "producer"),
            TopicRole::Consumer => write!(f, "consumer"),
        }
    }
}

/// Consumer-side record selector, matched against the CloudEvent key.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct EventFilter {
    pub event_type: String,
    pub payload_version: String,
}

/// One topic the test produces to or consumes from. A directive may override
/// the default cluster, enabling cross-cluster tests.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct TopicDirective {
    pub topic: String,
    pub role: TopicRole,
    pub client_principal: String,
    #[serde(default)]
    pub bootstrap_servers: Option<String>,
    #[serde(default)]
    pub key_schema_type: Option<SchemaType>,
    #[serde(default)]
    pub value_schema_type: Option<SchemaType>,
    /// Inline schema for the value records (Avro or JSON Schema document),
    /// keyed by record name. Topics may carry several record types.
    #[serde(default)]
    pub value_schemas: HashMap<String, String>,
    #[serde(default)]
    pub filters: Vec<EventFilter>,
}

impl TopicDirective {
    pub fn key_schema_type(&self) -> SchemaType {
        self.key_schema_type.unwrap_or(SchemaType::Json)
    }

    pub fn value_schema_type(&self) -> SchemaType {
        self.value_schema_type.unwrap_or(SchemaType::Json)
    }
}

/// Parsed manifest fetched from object storage on test admission.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct BlockStorageDirective {
    pub bucket: String,
    /// Absolute staging location inside the in-memory filesystem.
    pub staging_root: String,
    /// Directory (under the staging root) the scenario engine writes
    /// evidence into.
    pub evidence_dir: String,
    #[serde(default)]
    pub glue_packages: Vec<String>,
    pub topics: Vec<TopicDirective>,
    /// Scenario suite assets to stage, relative to the manifest location.
    #[serde(default)]
    pub assets: Vec<String>,
}

impl BlockStorageDirective {
    pub fn producer_topics(&self) -> impl Iterator<Item = &TopicDirective> {
        self.topics.iter().filter(|t| t.role == TopicRole::Producer)
    }

    pub fn consumer_topics(&self) -> impl Iterator<Item = &TopicDirective> {
        self.topics.iter().filter(|t| t.role == TopicRole::Consumer)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum SecurityProtocol {
    #[serde(rename = "PLAINTEXT")]
    Plaintext,
    #[serde(rename = "SASL_SSL")]
    SaslSsl,
    #[serde(rename = "SSL")]
    Ssl,
    #[serde(rename = "SASL_PLAINTEXT")]
    SaslPlaintext,
}

impl SecurityProtocol {
    /// librdkafka `security.protocol` value.
    pub fn rdkafka_name(&self) -> &'static str {
        match self {
            SecurityProtocol::Plaintext => "plaintext",
            SecurityProtocol::SaslSsl => "sasl_ssl",
            SecurityProtocol::Ssl => "ssl",
            SecurityProtocol::SaslPlaintext => "sasl_plaintext",
        }
    }
}

impl FromStr for SecurityProtocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PLAINTEXT" => Ok(SecurityProtocol::Plaintext),
            "SASL_SSL" => Ok(SecurityProtocol::SaslSsl),
            "SSL" => Ok(SecurityProtocol::Ssl),
            "SASL_PLAINTEXT" => Ok(SecurityProtocol::SaslPlaintext),
            other => Err(format!("unknown security protocol {other}")),
        }
    }
}

/// A secret string whose display forms are redacted. The raw value is only
/// reachable through [`SaslSecret::expose`], which keeps accidental logging
/// of credentials out of the type system's easy path.
#[derive(Clone, PartialEq, Eq)]
pub struct SaslSecret(String);

impl SaslSecret {
    pub fn new(value: String) -> Self {
        Self(value)
    }

    /// Hand the raw value to the Kafka client config. Never log the result.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SaslSecret {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[redacted]")
    }
}

impl fmt::Display for SaslSecret {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[redacted]")
    }
}

/// SASL credentials as librdkafka consumes them. The vault response is
/// projected into discrete mechanism/username/password keys.
#[derive(Debug, Clone)]
pub struct SaslCredentials {
    pub mechanism: String,
    pub username: String,
    pub password: SaslSecret,
}

/// Per-topic security requirement produced by the vault worker. Never logged
/// and never serialized into any response payload.
#[derive(Debug, Clone)]
pub struct KafkaSecurityDirective {
    pub topic: String,
    pub role: TopicRole,
    pub security_protocol: SecurityProtocol,
    pub sasl: Option<SaslCredentials>,
}

/// Aggregated outcome of a scenario suite run.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct TestExecutionResult {
    pub test_id: TestId,
    pub passed: bool,
    pub scenario_count: usize,
    pub scenarios_passed: usize,
    pub scenarios_failed: usize,
    pub scenarios_skipped: usize,
    pub step_count: usize,
    pub steps_passed: usize,
    pub steps_failed: usize,
    pub steps_skipped: usize,
    pub steps_undefined: usize,
    pub duration_millis: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub failed_scenarios: Vec<String>,
}

/// The per-test execution states. `Completed`, `Exception` and
/// `ShuttingDown` are terminal with respect to external input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum TestState {
    Setup,
    Loading,
    Loaded,
    Testing,
    Completed,
    Exception,
    ShuttingDown,
}

impl TestState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TestState::Completed | TestState::Exception | TestState::ShuttingDown
        )
    }
}

impl fmt::Display for TestState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            TestState::Setup => "Setup",
            TestState::Loading => "Loading",
            TestState::Loaded => "Loaded",
            TestState::Testing => "Testing",
            TestState::Completed => "Completed",
            TestState::Exception => "Exception",
            TestState::ShuttingDown => "ShuttingDown",
        };
        write!(f, "{name}")
    }
}

/// Count vector over the execution states plus the currently-testing test.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct QueueSnapshot {
    pub setup: usize,
    pub loading: usize,
    pub loaded: usize,
    pub testing: usize,
    pub completed: usize,
    pub exception: usize,
    pub shutting_down: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub testing_test_id: Option<TestId>,
}

impl QueueSnapshot {
    pub fn bump(&mut self, state: TestState) {
        *self.slot(state) += 1;
    }

    fn slot(&mut self, state: TestState) -> &mut usize {
        match state {
            TestState::Setup => &mut self.setup,
            TestState::Loading => &mut self.loading,
            TestState::Loaded => &mut self.loaded,
            TestState::Testing => &mut self.testing,
            TestState::Completed => &mut self.completed,
            TestState::Exception => &mut self.exception,
            TestState::ShuttingDown => &mut self.shutting_down,
        }
    }
}

/// Point-in-time status of a single test, owned by its execution state
/// machine and snapshotted on request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestStatus {
    pub test_id: TestId,
    pub state: TestState,
    pub bucket: Option<String>,
    pub test_type: Option<String>,
    pub start_time: Option<chrono::DateTime<chrono::Utc>>,
    pub end_time: Option<chrono::DateTime<chrono::Utc>>,
    pub success: Option<bool>,
    pub error: Option<String>,
}

impl TestStatus {
    pub fn new(test_id: TestId) -> Self {
        Self {
            test_id,
            state: TestState::Setup,
            bucket: None,
            test_type: None,
            start_time: None,
            end_time: None,
            success: None,
            error: None,
        }
    }
}

/// Operational failures bubbled from the child workers to the execution
/// state machine. These surface as a test outcome with `success=false`,
/// never as an HTTP error. Messages must stay free of credentials.
#[derive(Error, Debug, Clone)]
pub enum ExecError {
    #[error("storage failed: {0}")]
    StorageFailed(String),
    #[error("vault failed: {0}")]
    VaultFailed(String),
    #[error("scenario failed: {0}")]
    ScenarioFailed(String),
    #[error("kafka failed: {0}")]
    KafkaFailed(String),
    #[error("{0} timeout")]
    StateTimeout(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_round_trips_kebab_case() {
        let raw = r#"{
            "bucket": "b",
            "staging-root": "/staging/t",
            "evidence-dir": "evidence",
            "topics": [
                {
                    "topic": "orders",
                    "role": "producer",
                    "client-principal": "svc-probe",
                    "key-schema-type": "avro",
                    "value-schema-type": "avro",
                    "value-schemas": {}
                },
                {
                    "topic": "payments",
                    "role": "consumer",
                    "client-principal": "svc-probe",
                    "filters": [
                        {"event-type": "PaymentProcessed", "payload-version": "1.0"}
                    ]
                }
            ]
        }"#;
        let directive: BlockStorageDirective = serde_json::from_str(raw).unwrap();
        assert_eq!(directive.producer_topics().count(), 1);
        let consumer = directive.consumer_topics().next().unwrap();
        assert_eq!(consumer.key_schema_type(), SchemaType::Json);
        assert_eq!(consumer.filters[0].event_type, "PaymentProcessed");
        assert!(consumer.bootstrap_servers.is_none());
    }

    #[test]
    fn secrets_never_leak_through_display_or_debug() {
        let directive = KafkaSecurityDirective {
            topic: "orders".to_string(),
            role: TopicRole::Producer,
            security_protocol: SecurityProtocol::SaslSsl,
            sasl: Some(SaslCredentials {
                mechanism: "SCRAM-SHA-512".to_string(),
                username: "svc-probe".to_string(),
                password: SaslSecret::new("hunter2".to_string()),
            }),
        };
        let debugged = format!("{:?}", directive);
        assert!(!debugged.contains("hunter2"));
        assert!(debugged.contains("[redacted]"));
    }

    #[test]
    fn security_protocol_maps_to_rdkafka() {
        assert_eq!(
            SecurityProtocol::from_str("SASL_SSL").unwrap().rdkafka_name(),
            "sasl_ssl"
        );
        assert!(SecurityProtocol::from_str("KERBEROS").is_err());
    }
}
