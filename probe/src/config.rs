use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use envconfig::Envconfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(default = "127.0.0.1:3400")]
    pub address: SocketAddr,

    /// `s3` against real object storage, `memory` for local development.
    #[envconfig(default = "s3")]
    pub object_store: ObjectStoreKind,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    #[envconfig(nested = true)]
    pub vault: VaultConfig,

    #[envconfig(nested = true)]
    pub timeouts: TimeoutConfig,

    #[envconfig(nested = true)]
    pub breaker: BreakerConfig,

    #[envconfig(from = "SCHEMA_REGISTRY_URL", default = "http://127.0.0.1:8081")]
    pub schema_registry_url: String,

    #[envconfig(default = "true")]
    pub export_prometheus: bool,
}

#[derive(Envconfig, Clone)]
pub struct KafkaConfig {
    pub kafka_hosts: String,
    #[envconfig(default = "20")]
    pub kafka_producer_linger_ms: u32,
    #[envconfig(default = "400")]
    pub kafka_producer_queue_mib: u32,
    #[envconfig(default = "10000")]
    pub kafka_message_timeout_ms: u32,
    #[envconfig(default = "none")]
    pub kafka_compression_codec: String, // none, gzip, snappy, lz4, zstd
    /// Capacity of the producer worker's mailbox; overflow nacks the caller.
    #[envconfig(default = "64")]
    pub kafka_produce_queue_depth: usize,
    /// Commit after this many matching records...
    #[envconfig(default = "20")]
    pub kafka_commit_batch_size: usize,
    /// ...or after this long, whichever comes first.
    #[envconfig(default = "1000")]
    pub kafka_commit_interval: EnvMsDuration,
}

#[derive(Envconfig, Clone)]
pub struct VaultConfig {
    #[envconfig(from = "VAULT_FUNCTION_URL", default = "http://127.0.0.1:9090/vault")]
    pub function_url: String,
    #[envconfig(from = "VAULT_REQUEST_TEMPLATE", default = "")]
    pub request_template: String,
    #[envconfig(from = "VAULT_ROSETTA_MAPPING", default = "")]
    pub rosetta_mapping: String,
    #[envconfig(from = "VAULT_CALL_TIMEOUT_MS", default = "10000")]
    pub call_timeout: EnvMsDuration,
}

/// Per-state poison pills and ask deadlines. Expiry in Setup/Loading is
/// fatal for the test; expiry in Completed/Exception only ends it.
#[derive(Envconfig, Clone)]
pub struct TimeoutConfig {
    #[envconfig(default = "10000")]
    pub setup_state: EnvMsDuration,
    #[envconfig(default = "60000")]
    pub loading_state: EnvMsDuration,
    #[envconfig(default = "5000")]
    pub completed_state: EnvMsDuration,
    #[envconfig(default = "5000")]
    pub exception_state: EnvMsDuration,
    /// Grace period for children to stop before the FSM gives up on them.
    #[envconfig(default = "10000")]
    pub shutdown_grace: EnvMsDuration,
    /// Default ask deadline applied by the request gateway.
    #[envconfig(default = "5000")]
    pub ask: EnvMsDuration,
    /// Ask deadline for produce calls issued by scenario steps.
    #[envconfig(default = "10000")]
    pub produce_ack: EnvMsDuration,
    /// Wait budget for consumed-event lookups issued by scenario steps.
    #[envconfig(default = "30000")]
    pub fetch_budget: EnvMsDuration,
}

#[derive(Envconfig, Clone)]
pub struct BreakerConfig {
    #[envconfig(default = "5")]
    pub max_failures: u32,
    #[envconfig(default = "5000")]
    pub call_timeout: EnvMsDuration,
    #[envconfig(default = "30000")]
    pub reset_timeout: EnvMsDuration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectStoreKind {
    S3,
    Memory,
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseObjectStoreKindError(String);

impl FromStr for ObjectStoreKind {
    type Err = ParseObjectStoreKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "s3" => Ok(ObjectStoreKind::S3),
            "memory" => Ok(ObjectStoreKind::Memory),
            other => Err(ParseObjectStoreKindError(other.to_owned())),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;
        Ok(EnvMsDuration(Duration::from_millis(ms)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_durations_from_millis() {
        let d: EnvMsDuration = "1500".parse().unwrap();
        assert_eq!(d.0, Duration::from_millis(1500));
        assert!("abc".parse::<EnvMsDuration>().is_err());
    }

    #[test]
    fn parses_object_store_kind() {
        assert_eq!("memory".parse::<ObjectStoreKind>().unwrap(), ObjectStoreKind::Memory);
        assert!("gcs".parse::<ObjectStoreKind>().is_err());
    }
}
