use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use aws_sdk_s3::Client as AwsS3SdkClient;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Error, Debug, Clone)]
pub enum ObjectStoreError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("object store operation failed: {0}")]
    OperationFailed(String),
}

/// Narrow seam over cloud object storage so the storage worker can be
/// exercised against an in-memory implementation.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, bucket: &str, key: &str) -> Result<Bytes, ObjectStoreError>;

    async fn put(&self, bucket: &str, key: &str, body: Bytes) -> Result<(), ObjectStoreError>;

    /// Keys under a prefix, lexicographic order.
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, ObjectStoreError>;
}

pub struct S3ObjectStore {
    client: AwsS3SdkClient,
}

impl S3ObjectStore {
    pub fn new(client: AwsS3SdkClient) -> Self {
        Self { client }
    }

    pub async fn from_env() -> Self {
        let config = aws_config::load_from_env().await;
        Self::new(AwsS3SdkClient::new(&config))
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn get(&self, bucket: &str, key: &str) -> Result<Bytes, ObjectStoreError> {
        let output = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                let message = format!("failed to get s3://{bucket}/{key}: {e}");
                if let aws_sdk_s3::operation::get_object::GetObjectError::NoSuchKey(_) =
                    e.into_service_error()
                {
                    ObjectStoreError::NotFound(format!("s3://{bucket}/{key}"))
                } else {
                    ObjectStoreError::OperationFailed(message)
                }
            })?;

        let body = output
            .body
            .collect()
            .await
            .map_err(|e| ObjectStoreError::OperationFailed(format!("failed to read body: {e}")))?;
        Ok(body.into_bytes())
    }

    async fn put(&self, bucket: &str, key: &str, body: Bytes) -> Result<(), ObjectStoreError> {
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(body.into())
            .send()
            .await
            .map_err(|e| {
                ObjectStoreError::OperationFailed(format!("failed to put s3://{bucket}/{key}: {e}"))
            })?;
        Ok(())
    }

    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, ObjectStoreError> {
        let mut keys = Vec::new();
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(bucket)
            .prefix(prefix)
            .into_paginator()
            .send();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| {
                ObjectStoreError::OperationFailed(format!("failed to list s3://{bucket}/{prefix}: {e}"))
            })?;
            for object in page.contents() {
                if let Some(key) = object.key() {
                    keys.push(key.to_string());
                }
            }
        }
        Ok(keys)
    }
}

/// In-memory store for tests and the local/dev profile.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Arc<RwLock<BTreeMap<(String, String), Bytes>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed(&self, bucket: &str, key: &str, body: impl Into<Bytes>) {
        self.objects
            .write()
            .await
            .insert((bucket.to_string(), key.to_string()), body.into());
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get(&self, bucket: &str, key: &str) -> Result<Bytes, ObjectStoreError> {
        self.objects
            .read()
            .await
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| ObjectStoreError::NotFound(format!("{bucket}/{key}")))
    }

    async fn put(&self, bucket: &str, key: &str, body: Bytes) -> Result<(), ObjectStoreError> {
        self.objects
            .write()
            .await
            .insert((bucket.to_string(), key.to_string()), body);
        Ok(())
    }

    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, ObjectStoreError> {
        Ok(self
            .objects
            .read()
            .await
            .keys()
            .filter(|(b, k)| b == bucket && k.starts_with(prefix))
            .map(|(_, k)| k.clone())
            .collect())
    }
}
