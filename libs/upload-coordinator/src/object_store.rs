use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::Client;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("presign failed: {0}")]
    Presign(String),
    #[error("head failed: {0}")]
    Head(String),
    #[error("delete failed: {0}")]
    Delete(String),
}

#[derive(Debug, Clone, Copy)]
pub struct ObjectMetadata {
    pub size_bytes: i64,
}

/// Seam the coordinator uploads/verifies/cleans up object bodies through.
/// The concrete backend (S3-compatible storage) is an external collaborator;
/// this trait is everything the upload lifecycle needs from it.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn presign_put(&self, key: &str, content_type: &str, ttl: Duration) -> Result<String, ObjectStoreError>;
    async fn head(&self, key: &str) -> Result<Option<ObjectMetadata>, ObjectStoreError>;
    async fn delete(&self, key: &str) -> Result<(), ObjectStoreError>;
}

#[derive(Debug, Clone)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    pub endpoint: Option<String>,
}

pub struct S3ObjectStore {
    client: Client,
    bucket: String,
}

impl S3ObjectStore {
    pub async fn connect(config: &S3Config) -> Self {
        use aws_sdk_s3::config::Region;

        let mut builder = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(Region::new(config.region.clone()));

        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        let aws_cfg = builder.load().await;
        Self {
            client: Client::new(&aws_cfg),
            bucket: config.bucket.clone(),
        }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn presign_put(&self, key: &str, content_type: &str, ttl: Duration) -> Result<String, ObjectStoreError> {
        let presigning_config = PresigningConfig::builder()
            .expires_in(ttl)
            .build()
            .map_err(|e| ObjectStoreError::Presign(e.to_string()))?;

        let presigned = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .presigned(presigning_config)
            .await
            .map_err(|e| ObjectStoreError::Presign(e.to_string()))?;

        Ok(presigned.uri().to_string())
    }

    async fn head(&self, key: &str) -> Result<Option<ObjectMetadata>, ObjectStoreError> {
        let timeout = resilience::presets::object_storage_config().timeout.duration;
        let outcome = resilience::with_timeout(timeout, self.client.head_object().bucket(&self.bucket).key(key).send())
            .await
            .map_err(|e| ObjectStoreError::Head(e.to_string()))?;

        match outcome {
            Ok(output) => Ok(Some(ObjectMetadata {
                size_bytes: output.content_length().unwrap_or(0),
            })),
            Err(e) => {
                let msg = e.to_string();
                if msg.contains("404") || msg.contains("NotFound") {
                    Ok(None)
                } else {
                    Err(ObjectStoreError::Head(msg))
                }
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<(), ObjectStoreError> {
        let timeout = resilience::presets::object_storage_config().timeout.duration;
        resilience::with_timeout(timeout, self.client.delete_object().bucket(&self.bucket).key(key).send())
            .await
            .map_err(|e| ObjectStoreError::Delete(e.to_string()))?
            .map_err(|e| ObjectStoreError::Delete(e.to_string()))?;
        Ok(())
    }
}

/// In-memory store for tests.
#[cfg(any(test, feature = "test-util"))]
pub mod test_util {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct InMemoryObjectStore {
        objects: Mutex<HashMap<String, i64>>,
    }

    impl InMemoryObjectStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn put(&self, key: &str, size_bytes: i64) {
            self.objects.lock().unwrap().insert(key.to_string(), size_bytes);
        }
    }

    #[async_trait]
    impl ObjectStore for InMemoryObjectStore {
        async fn presign_put(&self, key: &str, _content_type: &str, _ttl: Duration) -> Result<String, ObjectStoreError> {
            Ok(format!("https://test-store.local/{key}"))
        }

        async fn head(&self, key: &str) -> Result<Option<ObjectMetadata>, ObjectStoreError> {
            Ok(self
                .objects
                .lock()
                .unwrap()
                .get(key)
                .map(|size_bytes| ObjectMetadata { size_bytes: *size_bytes }))
        }

        async fn delete(&self, key: &str) -> Result<(), ObjectStoreError> {
            self.objects.lock().unwrap().remove(key);
            Ok(())
        }
    }
}
