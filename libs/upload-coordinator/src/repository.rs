use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::CoordinatorError;
use crate::model::{UploadPurpose, UploadRecord, UploadStatus};

#[async_trait]
pub trait UploadRepository: Send + Sync {
    async fn insert(&self, owner_id: Uuid, purpose: UploadPurpose, object_key: &str, max_bytes: i64) -> Result<UploadRecord, CoordinatorError>;
    async fn find(&self, id: Uuid) -> Result<Option<UploadRecord>, CoordinatorError>;
    async fn mark_uploaded(&self, id: Uuid, observed_bytes: i64) -> Result<UploadRecord, CoordinatorError>;
    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<UploadRecord, CoordinatorError>;

    /// `UPLOADED -> PROCESSING`. A no-op (not an error) when the record has
    /// already moved past `UPLOADED` -- the image-processing handler's own
    /// idempotency marker is the primary guard against re-entering this
    /// transition on redelivery; this check is the DB-level second guard.
    async fn mark_processing(&self, id: Uuid) -> Result<UploadRecord, CoordinatorError>;

    /// `PROCESSING -> READY`, persisting the derived artifact keys.
    async fn mark_ready(&self, id: Uuid, derived_urls: &serde_json::Value) -> Result<UploadRecord, CoordinatorError>;
}

pub struct PgUploadRepository {
    pool: PgPool,
}

impl PgUploadRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UploadRepository for PgUploadRepository {
    async fn insert(&self, owner_id: Uuid, purpose: UploadPurpose, object_key: &str, max_bytes: i64) -> Result<UploadRecord, CoordinatorError> {
        let record = sqlx::query_as::<_, UploadRecord>(
            r#"
            INSERT INTO uploads (id, owner_id, purpose, object_key, status, max_bytes, created_at, updated_at)
            VALUES ($1, $2, $3, $4, 'PENDING', $5, NOW(), NOW())
            RETURNING id, owner_id, purpose, object_key, status, max_bytes, observed_bytes, derived_urls, error, created_at, updated_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(owner_id)
        .bind(purpose.as_str())
        .bind(object_key)
        .bind(max_bytes)
        .fetch_one(&self.pool)
        .await?;

        Ok(record)
    }

    async fn find(&self, id: Uuid) -> Result<Option<UploadRecord>, CoordinatorError> {
        let record = sqlx::query_as::<_, UploadRecord>(
            r#"
            SELECT id, owner_id, purpose, object_key, status, max_bytes, observed_bytes, derived_urls, error, created_at, updated_at
            FROM uploads WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn mark_uploaded(&self, id: Uuid, observed_bytes: i64) -> Result<UploadRecord, CoordinatorError> {
        let record = sqlx::query_as::<_, UploadRecord>(
            r#"
            UPDATE uploads
            SET status = $2, observed_bytes = $3, updated_at = NOW()
            WHERE id = $1
            RETURNING id, owner_id, purpose, object_key, status, max_bytes, observed_bytes, derived_urls, error, created_at, updated_at
            "#,
        )
        .bind(id)
        .bind(UploadStatus::Uploaded.as_str())
        .bind(observed_bytes)
        .fetch_one(&self.pool)
        .await?;

        Ok(record)
    }

    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<UploadRecord, CoordinatorError> {
        let record = sqlx::query_as::<_, UploadRecord>(
            r#"
            UPDATE uploads
            SET status = $2, error = $3, updated_at = NOW()
            WHERE id = $1
            RETURNING id, owner_id, purpose, object_key, status, max_bytes, observed_bytes, derived_urls, error, created_at, updated_at
            "#,
        )
        .bind(id)
        .bind(UploadStatus::Failed.as_str())
        .bind(error)
        .fetch_one(&self.pool)
        .await?;

        Ok(record)
    }

    async fn mark_processing(&self, id: Uuid) -> Result<UploadRecord, CoordinatorError> {
        let record = sqlx::query_as::<_, UploadRecord>(
            r#"
            UPDATE uploads
            SET status = $2, updated_at = NOW()
            WHERE id = $1 AND status = $3
            RETURNING id, owner_id, purpose, object_key, status, max_bytes, observed_bytes, derived_urls, error, created_at, updated_at
            "#,
        )
        .bind(id)
        .bind(UploadStatus::Processing.as_str())
        .bind(UploadStatus::Uploaded.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match record {
            Some(record) => Ok(record),
            None => self.find(id).await?.ok_or(CoordinatorError::NotFound(id)),
        }
    }

    async fn mark_ready(&self, id: Uuid, derived_urls: &serde_json::Value) -> Result<UploadRecord, CoordinatorError> {
        let record = sqlx::query_as::<_, UploadRecord>(
            r#"
            UPDATE uploads
            SET status = $2, derived_urls = $3, updated_at = NOW()
            WHERE id = $1
            RETURNING id, owner_id, purpose, object_key, status, max_bytes, observed_bytes, derived_urls, error, created_at, updated_at
            "#,
        )
        .bind(id)
        .bind(UploadStatus::Ready.as_str())
        .bind(derived_urls)
        .fetch_one(&self.pool)
        .await?;

        Ok(record)
    }
}

#[cfg(any(test, feature = "test-util"))]
pub mod test_util {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    /// In-memory repository double for components that only need the
    /// upload-lifecycle transitions (not the real SQL), such as the
    /// image-processing deriver's unit tests.
    #[derive(Default)]
    pub struct InMemoryUploadRepository {
        records: Mutex<HashMap<Uuid, UploadRecord>>,
    }

    impl InMemoryUploadRepository {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn seed(&self, record: UploadRecord) {
            self.records.lock().unwrap().insert(record.id, record);
        }
    }

    #[async_trait]
    impl UploadRepository for InMemoryUploadRepository {
        async fn insert(&self, owner_id: Uuid, purpose: UploadPurpose, object_key: &str, max_bytes: i64) -> Result<UploadRecord, CoordinatorError> {
            let now = chrono::Utc::now();
            let record = UploadRecord {
                id: Uuid::new_v4(),
                owner_id,
                purpose: purpose.as_str().to_string(),
                object_key: object_key.to_string(),
                status: UploadStatus::Pending.as_str().to_string(),
                max_bytes,
                observed_bytes: None,
                derived_urls: None,
                error: None,
                created_at: now,
                updated_at: now,
            };
            self.records.lock().unwrap().insert(record.id, record.clone());
            Ok(record)
        }

        async fn find(&self, id: Uuid) -> Result<Option<UploadRecord>, CoordinatorError> {
            Ok(self.records.lock().unwrap().get(&id).cloned())
        }

        async fn mark_uploaded(&self, id: Uuid, observed_bytes: i64) -> Result<UploadRecord, CoordinatorError> {
            let mut records = self.records.lock().unwrap();
            let record = records.get_mut(&id).ok_or(CoordinatorError::NotFound(id))?;
            record.status = UploadStatus::Uploaded.as_str().to_string();
            record.observed_bytes = Some(observed_bytes);
            record.updated_at = chrono::Utc::now();
            Ok(record.clone())
        }

        async fn mark_failed(&self, id: Uuid, error: &str) -> Result<UploadRecord, CoordinatorError> {
            let mut records = self.records.lock().unwrap();
            let record = records.get_mut(&id).ok_or(CoordinatorError::NotFound(id))?;
            record.status = UploadStatus::Failed.as_str().to_string();
            record.error = Some(error.to_string());
            record.updated_at = chrono::Utc::now();
            Ok(record.clone())
        }

        async fn mark_processing(&self, id: Uuid) -> Result<UploadRecord, CoordinatorError> {
            let mut records = self.records.lock().unwrap();
            let record = records.get_mut(&id).ok_or(CoordinatorError::NotFound(id))?;
            if record.status() == UploadStatus::Uploaded {
                record.status = UploadStatus::Processing.as_str().to_string();
                record.updated_at = chrono::Utc::now();
            }
            Ok(record.clone())
        }

        async fn mark_ready(&self, id: Uuid, derived_urls: &serde_json::Value) -> Result<UploadRecord, CoordinatorError> {
            let mut records = self.records.lock().unwrap();
            let record = records.get_mut(&id).ok_or(CoordinatorError::NotFound(id))?;
            record.status = UploadStatus::Ready.as_str().to_string();
            record.derived_urls = Some(derived_urls.clone());
            record.updated_at = chrono::Utc::now();
            Ok(record.clone())
        }
    }
}
