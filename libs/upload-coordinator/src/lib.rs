//! Presigned-PUT upload lifecycle: `request_upload` hands out a time-bounded
//! presigned URL, `complete_upload` verifies the object landed and within
//! bounds before handing the record off to the processing pipeline, and
//! `get_status` is a read-only projection for clients polling for a result.
//!
//! The object store and the retry publisher used to hand off processing
//! work are both narrow traits/clients so this crate's tests never touch
//! S3 or a broker.

pub mod error;
pub mod metrics;
pub mod model;
pub mod object_store;
pub mod repository;
pub mod routes;

use std::sync::Arc;
use std::time::Duration;

use message_model::Envelope;
use retry_publisher::RetryPublisher;
use serde_json::json;
use tracing::warn;
use uuid::Uuid;

use error::CoordinatorError;
use model::{UploadPurpose, UploadRecord, UploadStatus};
use object_store::ObjectStore;
use repository::UploadRepository;

pub const PROCESSING_ROUTING_KEY: &str = "media.image.uploaded";

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub max_bytes: i64,
    pub presign_ttl: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_bytes: 10 * 1024 * 1024,
            presign_ttl: Duration::from_secs(15 * 60),
        }
    }
}

pub struct RequestUploadResult {
    pub upload_id: Uuid,
    pub presigned_url: String,
    pub object_key: String,
    pub expires_at: chrono::DateTime<chrono::Utc>,
}

pub struct UploadCoordinator<R: UploadRepository, O: ObjectStore> {
    repository: Arc<R>,
    object_store: Arc<O>,
    publisher: Option<Arc<RetryPublisher>>,
    config: CoordinatorConfig,
    metrics: metrics::CoordinatorMetrics,
}

impl<R: UploadRepository, O: ObjectStore> UploadCoordinator<R, O> {
    pub fn new(
        repository: Arc<R>,
        object_store: Arc<O>,
        publisher: Option<Arc<RetryPublisher>>,
        config: CoordinatorConfig,
        metrics: metrics::CoordinatorMetrics,
    ) -> Self {
        Self {
            repository,
            object_store,
            publisher,
            config,
            metrics,
        }
    }

    pub async fn request_upload(&self, owner_id: Uuid, purpose: &str) -> Result<RequestUploadResult, CoordinatorError> {
        let purpose = UploadPurpose::parse(purpose).ok_or_else(|| CoordinatorError::UnknownPurpose(purpose.to_string()))?;
        let object_key = format!("uploads/{}/{}", purpose.as_str(), Uuid::new_v4());

        let record = self
            .repository
            .insert(owner_id, purpose, &object_key, self.config.max_bytes)
            .await?;

        let presigned_url = self
            .object_store
            .presign_put(&object_key, "application/octet-stream", self.config.presign_ttl)
            .await?;

        self.metrics.requests.inc();

        Ok(RequestUploadResult {
            upload_id: record.id,
            presigned_url,
            object_key,
            expires_at: chrono::Utc::now()
                + chrono::Duration::from_std(self.config.presign_ttl).unwrap_or_else(|_| chrono::Duration::zero()),
        })
    }

    /// Idempotent: a record already past `PENDING` is returned unchanged.
    pub async fn complete_upload(&self, owner_id: Uuid, upload_id: Uuid) -> Result<UploadRecord, CoordinatorError> {
        let record = self
            .repository
            .find(upload_id)
            .await?
            .ok_or(CoordinatorError::NotFound(upload_id))?;

        if record.owner_id != owner_id {
            return Err(CoordinatorError::NotOwner(upload_id));
        }

        if record.status() != UploadStatus::Pending {
            return Ok(record);
        }

        let metadata = self
            .object_store
            .head(&record.object_key)
            .await?
            .ok_or_else(|| CoordinatorError::ObjectInvalid("object not present in raw store".to_string()))?;

        if metadata.size_bytes > record.max_bytes {
            let _ = self.object_store.delete(&record.object_key).await;
            self.metrics.oversize_rejections.inc();
            self.repository
                .mark_failed(upload_id, "object exceeds max_bytes")
                .await?;
            return Err(CoordinatorError::ObjectInvalid("object exceeds max_bytes".to_string()));
        }

        let updated = self.repository.mark_uploaded(upload_id, metadata.size_bytes).await?;
        self.metrics.completions.inc();

        if let Some(publisher) = &self.publisher {
            let envelope = Envelope::new(
                PROCESSING_ROUTING_KEY,
                json!({ "upload_id": updated.id, "object_key": updated.object_key, "purpose": updated.purpose }).to_string().into_bytes(),
            );
            if let Err(e) = publisher.publish_initial(&envelope).await {
                warn!(upload_id = %upload_id, error = %e, "processing publish failed, relying on reaper to re-drive");
                self.metrics.publish_failures.inc();
            }
        }

        Ok(updated)
    }

    pub async fn get_status(&self, upload_id: Uuid) -> Result<UploadRecord, CoordinatorError> {
        self.repository.find(upload_id).await?.ok_or(CoordinatorError::NotFound(upload_id))
    }
}
