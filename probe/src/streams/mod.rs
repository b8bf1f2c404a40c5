//! Long-lived Kafka producer and consumer streams, one pair per test.
//!
//! Each half is split into the worker task owning the Kafka client and a
//! cheap cloneable handle the rest of the harness talks to. Blocking
//! librdkafka work stays inside the workers; completions travel back to the
//! execution state machine as messages.

pub mod consumer;
pub mod producer;

use rdkafka::ClientConfig;

use crate::model::{KafkaSecurityDirective, SecurityProtocol, TopicRole};

/// Base client config for one cluster, with the security directive applied.
/// Credentials go straight into librdkafka and are never logged.
pub(crate) fn client_config(
    bootstrap_servers: &str,
    security: Option<&KafkaSecurityDirective>,
) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", bootstrap_servers)
        .set("statistics.interval.ms", "10000");

    if let Some(directive) = security {
        client_config.set("security.protocol", directive.security_protocol.rdkafka_name());
        if let Some(sasl) = &directive.sasl {
            client_config
                .set("sasl.mechanism", &sasl.mechanism)
                .set("sasl.username", &sasl.username)
                .set("sasl.password", sasl.password.expose());
        }
    } else {
        client_config.set(
            "security.protocol",
            SecurityProtocol::Plaintext.rdkafka_name(),
        );
    }

    client_config
}

/// The security directive governing a topic for one role, if the vault
/// returned one.
pub(crate) fn security_for<'a>(
    directives: &'a [KafkaSecurityDirective],
    topic: &str,
    role: TopicRole,
) -> Option<&'a KafkaSecurityDirective> {
    directives
        .iter()
        .find(|d| d.topic == topic && d.role == role)
}
