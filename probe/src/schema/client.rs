use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::model::SchemaType;

#[derive(Error, Debug)]
pub enum SchemaRegistryError {
    #[error("schema registry unreachable: {0}")]
    Unavailable(String),
    #[error("schema {0} not found")]
    NotFound(i32),
    #[error("schema rejected for subject {subject}: {body}")]
    Rejected { subject: String, body: String },
}

#[derive(Serialize)]
struct RegisterSchemaRequest<'a> {
    schema: &'a str,
    #[serde(rename = "schemaType")]
    schema_type: &'a str,
}

#[derive(Deserialize)]
struct RegisterSchemaResponse {
    id: i32,
}

#[derive(Deserialize)]
struct LookupSchemaResponse {
    id: i32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegisteredSchema {
    pub schema: String,
    /// Absent in registry responses for Avro.
    #[serde(rename = "schemaType")]
    pub schema_type: Option<String>,
}

/// Process-wide Confluent Schema Registry client. Registration results are
/// cached per `(subject, schema)` so steady-state serialization never makes
/// an HTTP round trip; registering an already-registered schema returns the
/// existing id, which counts as success.
pub struct SchemaRegistryClient {
    base_url: String,
    http: reqwest::Client,
    ids: DashMap<(String, String), i32>,
}

impl SchemaRegistryClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, SchemaRegistryError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SchemaRegistryError::Unavailable(e.to_string()))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
            ids: DashMap::new(),
        })
    }

    pub async fn register(
        &self,
        subject: &str,
        schema: &str,
        schema_type: SchemaType,
    ) -> Result<i32, SchemaRegistryError> {
        let cache_key = (subject.to_string(), schema.to_string());
        if let Some(id) = self.ids.get(&cache_key) {
            return Ok(*id);
        }

        let url = format!("{}/subjects/{}/versions", self.base_url, subject);
        debug!(subject, schema_type = schema_type.registry_name(), "registering schema");
        let response = self
            .http
            .post(&url)
            .json(&RegisterSchemaRequest {
                schema,
                schema_type: schema_type.registry_name(),
            })
            .send()
            .await
            .map_err(|e| SchemaRegistryError::Unavailable(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::CONFLICT {
            // the schema is already registered; resolve its id and succeed
            let id = self.lookup(subject, schema, schema_type).await?;
            self.ids.insert(cache_key, id);
            return Ok(id);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_else(|_| status.to_string());
            return Err(SchemaRegistryError::Rejected {
                subject: subject.to_string(),
                body,
            });
        }

        let parsed: RegisterSchemaResponse = response
            .json()
            .await
            .map_err(|e| SchemaRegistryError::Unavailable(e.to_string()))?;
        self.ids.insert(cache_key, parsed.id);
        Ok(parsed.id)
    }

    /// Resolve the id a schema is already registered under for a subject
    /// (the registry's check-if-registered endpoint).
    async fn lookup(
        &self,
        subject: &str,
        schema: &str,
        schema_type: SchemaType,
    ) -> Result<i32, SchemaRegistryError> {
        let url = format!("{}/subjects/{}", self.base_url, subject);
        let response = self
            .http
            .post(&url)
            .json(&RegisterSchemaRequest {
                schema,
                schema_type: schema_type.registry_name(),
            })
            .send()
            .await
            .map_err(|e| SchemaRegistryError::Unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_else(|_| status.to_string());
            return Err(SchemaRegistryError::Rejected {
                subject: subject.to_string(),
                body,
            });
        }
        let parsed: LookupSchemaResponse = response
            .json()
            .await
            .map_err(|e| SchemaRegistryError::Unavailable(e.to_string()))?;
        Ok(parsed.id)
    }

    pub async fn schema_by_id(&self, id: i32) -> Result<RegisteredSchema, SchemaRegistryError> {
        let url = format!("{}/schemas/ids/{}", self.base_url, id);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| SchemaRegistryError::Unavailable(e.to_string()))?;

        match response.status() {
            status if status.is_success() => response
                .json()
                .await
                .map_err(|e| SchemaRegistryError::Unavailable(e.to_string())),
            reqwest::StatusCode::NOT_FOUND => Err(SchemaRegistryError::NotFound(id)),
            status => {
                let body = response.text().await.unwrap_or_else(|_| status.to_string());
                Err(SchemaRegistryError::Unavailable(format!(
                    "status={status}, body={body}"
                )))
            }
        }
    }
}
