//! Binds the image-processing effect handler's `ImageDeriver` collaborator
//! to the upload record's lifecycle: the handler's idempotency marker keeps
//! the derivation itself from running twice, but the record's own state
//! (`UPLOADED -> PROCESSING -> READY/FAILED`, §4.5) is this process's
//! responsibility, not the handler's -- it is the only thing an HTTP client
//! polling `GET /upload/{id}` can see.

use std::sync::Arc;

use async_trait::async_trait;
use effect_handlers::ImageDeriver;
use message_model::EffectError;
use upload_coordinator::repository::UploadRepository;

/// Wraps an inner [`ImageDeriver`] (the actual pixel-resizing collaborator,
/// out of scope for this workspace) with the upload record's transitions:
/// marks `PROCESSING` before calling it, `READY` with the derived keys on
/// success, and `FAILED` with the captured message when the inner deriver
/// reports a permanent error. A retriable error leaves the record in
/// `PROCESSING` -- the delivery engine will redeliver and this wrapper runs
/// again, which is safe because `mark_processing` is a no-op once the record
/// has already left `UPLOADED`.
pub struct StateTrackingImageDeriver<R: UploadRepository> {
    repository: Arc<R>,
    inner: Arc<dyn ImageDeriver>,
}

impl<R: UploadRepository> StateTrackingImageDeriver<R> {
    pub fn new(repository: Arc<R>, inner: Arc<dyn ImageDeriver>) -> Self {
        Self { repository, inner }
    }
}

#[async_trait]
impl<R: UploadRepository> ImageDeriver for StateTrackingImageDeriver<R> {
    async fn derive(&self, upload_id: &str, raw_key: &str, purpose: &str) -> Result<Vec<String>, EffectError> {
        let id = uuid::Uuid::parse_str(upload_id)
            .map_err(|e| EffectError::permanent(format!("upload id is not a uuid: {e}")))?;

        self.repository
            .mark_processing(id)
            .await
            .map_err(|e| EffectError::retriable(format!("failed to mark upload processing: {e}")))?;

        match self.inner.derive(upload_id, raw_key, purpose).await {
            Ok(derived) => {
                let urls = serde_json::Value::Array(
                    derived.iter().cloned().map(serde_json::Value::String).collect(),
                );
                self.repository
                    .mark_ready(id, &urls)
                    .await
                    .map_err(|e| EffectError::retriable(format!("failed to persist derived artifacts: {e}")))?;
                Ok(derived)
            }
            Err(err) => {
                if !err.is_retriable() {
                    if let Err(persist_err) = self.repository.mark_failed(id, err.message()).await {
                        tracing::warn!(
                            upload_id,
                            error = %persist_err,
                            "failed to persist upload failure after permanent derivation error"
                        );
                    }
                }
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use upload_coordinator::model::{UploadPurpose, UploadStatus};
    use upload_coordinator::repository::test_util::InMemoryUploadRepository;

    struct AlwaysOkDeriver;

    #[async_trait]
    impl ImageDeriver for AlwaysOkDeriver {
        async fn derive(&self, _upload_id: &str, raw_key: &str, purpose: &str) -> Result<Vec<String>, EffectError> {
            Ok(vec![format!("{raw_key}.{purpose}.derived")])
        }
    }

    struct AlwaysPermanentDeriver;

    #[async_trait]
    impl ImageDeriver for AlwaysPermanentDeriver {
        async fn derive(&self, _upload_id: &str, _raw_key: &str, _purpose: &str) -> Result<Vec<String>, EffectError> {
            Err(EffectError::permanent("corrupt image"))
        }
    }

    async fn seed_uploaded(repo: &InMemoryUploadRepository) -> uuid::Uuid {
        let record = repo
            .insert(uuid::Uuid::new_v4(), UploadPurpose::Avatar, "uploads/avatar/x", 1024)
            .await
            .unwrap();
        repo.mark_uploaded(record.id, 512).await.unwrap();
        record.id
    }

    #[tokio::test]
    async fn successful_derivation_marks_the_record_ready_with_derived_urls() {
        let repo = Arc::new(InMemoryUploadRepository::new());
        let id = seed_uploaded(&repo).await;
        let deriver = StateTrackingImageDeriver::new(repo.clone(), Arc::new(AlwaysOkDeriver));

        deriver.derive(&id.to_string(), "uploads/avatar/x", "avatar").await.unwrap();

        let record = repo.find(id).await.unwrap().unwrap();
        assert_eq!(record.status(), UploadStatus::Ready);
        assert!(record.derived_urls.is_some());
    }

    #[tokio::test]
    async fn permanent_failure_marks_the_record_failed_with_the_message() {
        let repo = Arc::new(InMemoryUploadRepository::new());
        let id = seed_uploaded(&repo).await;
        let deriver = StateTrackingImageDeriver::new(repo.clone(), Arc::new(AlwaysPermanentDeriver));

        let err = deriver.derive(&id.to_string(), "uploads/avatar/x", "avatar").await.unwrap_err();
        assert!(!err.is_retriable());

        let record = repo.find(id).await.unwrap().unwrap();
        assert_eq!(record.status(), UploadStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("corrupt image"));
    }
}
