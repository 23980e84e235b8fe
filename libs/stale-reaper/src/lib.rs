//! Background sweep that closes out upload records stuck in a non-terminal
//! state: `PENDING` past its presign window, or `FAILED` past its retention
//! window. Deletes the raw object before the record so a crash mid-reap
//! leaves dangling bytes (bounded by the presigned-URL expiry) rather than a
//! record pointing at nothing.

mod error;
pub mod metrics;

pub use error::{ReaperError, ReaperResult};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::{debug, error, info, warn};
use upload_coordinator::object_store::ObjectStore;
use uuid::Uuid;

/// The sliver of an upload record the reaper needs: enough to delete the
/// raw object and the row, nothing else.
#[derive(Debug, Clone)]
pub struct StaleRecord {
    pub id: Uuid,
    pub object_key: String,
}

#[async_trait]
pub trait StaleUploadRepository: Send + Sync {
    async fn find_stale(
        &self,
        pending_age: Duration,
        failed_age: Duration,
        limit: i64,
    ) -> ReaperResult<Vec<StaleRecord>>;

    async fn delete(&self, id: Uuid) -> ReaperResult<()>;
}

pub struct SqlxStaleUploadRepository {
    pool: PgPool,
}

impl SqlxStaleUploadRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StaleUploadRepository for SqlxStaleUploadRepository {
    async fn find_stale(
        &self,
        pending_age: Duration,
        failed_age: Duration,
        limit: i64,
    ) -> ReaperResult<Vec<StaleRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, object_key
            FROM uploads
            WHERE (status = 'PENDING' AND created_at < NOW() - ($1 || ' seconds')::interval)
               OR (status = 'FAILED' AND updated_at < NOW() - ($2 || ' seconds')::interval)
            ORDER BY created_at ASC
            LIMIT $3
            "#,
        )
        .bind(pending_age.as_secs() as i64)
        .bind(failed_age.as_secs() as i64)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| StaleRecord {
                id: row.get("id"),
                object_key: row.get("object_key"),
            })
            .collect())
    }

    async fn delete(&self, id: Uuid) -> ReaperResult<()> {
        sqlx::query("DELETE FROM uploads WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ReaperConfig {
    pub pending_age: Duration,
    pub failed_age: Duration,
    pub tick: Duration,
    pub batch_size: i64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            pending_age: Duration::from_secs(24 * 3600),
            failed_age: Duration::from_secs(7 * 24 * 3600),
            tick: Duration::from_secs(3600),
            batch_size: 100,
        }
    }
}

pub struct StaleReaper<R: StaleUploadRepository, O: ObjectStore> {
    repository: Arc<R>,
    object_store: Arc<O>,
    config: ReaperConfig,
    metrics: metrics::ReaperMetrics,
}

impl<R: StaleUploadRepository, O: ObjectStore> StaleReaper<R, O> {
    pub fn new(repository: Arc<R>, object_store: Arc<O>, config: ReaperConfig, metrics: metrics::ReaperMetrics) -> Self {
        Self {
            repository,
            object_store,
            config,
            metrics,
        }
    }

    /// Runs until `shutdown` fires, sweeping once up front and then every
    /// `config.tick`.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!(
            pending_age_secs = self.config.pending_age.as_secs(),
            failed_age_secs = self.config.failed_age.as_secs(),
            tick_secs = self.config.tick.as_secs(),
            "stale reaper starting"
        );

        loop {
            if let Err(e) = self.sweep_once().await {
                error!(error = %e, "stale reaper sweep failed");
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.tick) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("stale reaper shutting down");
                        return;
                    }
                }
            }
        }
    }

    async fn sweep_once(&self) -> ReaperResult<()> {
        let stale = self
            .repository
            .find_stale(self.config.pending_age, self.config.failed_age, self.config.batch_size)
            .await?;

        if stale.is_empty() {
            debug!("no stale upload records found");
            return Ok(());
        }

        info!(count = stale.len(), "reaping stale upload records");

        for record in stale {
            if let Err(e) = self.object_store.delete(&record.object_key).await {
                warn!(
                    upload_id = %record.id,
                    object_key = %record.object_key,
                    error = %e,
                    "failed to delete raw object during reap, continuing"
                );
                self.metrics.object_delete_failures.inc();
            }

            self.repository.delete(record.id).await?;
            self.metrics.records_reaped.inc();
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use upload_coordinator::object_store::test_util::InMemoryObjectStore;

    #[derive(Default)]
    struct InMemoryRepository {
        records: Mutex<HashMap<Uuid, StaleRecord>>,
    }

    impl InMemoryRepository {
        fn seed(&self, record: StaleRecord) {
            self.records.lock().unwrap().insert(record.id, record);
        }
    }

    #[async_trait]
    impl StaleUploadRepository for InMemoryRepository {
        async fn find_stale(&self, _pending_age: Duration, _failed_age: Duration, _limit: i64) -> ReaperResult<Vec<StaleRecord>> {
            Ok(self.records.lock().unwrap().values().cloned().collect())
        }

        async fn delete(&self, id: Uuid) -> ReaperResult<()> {
            self.records.lock().unwrap().remove(&id);
            Ok(())
        }
    }

    #[tokio::test]
    async fn sweep_deletes_the_object_before_the_record() {
        let repo = Arc::new(InMemoryRepository::default());
        let store = Arc::new(InMemoryObjectStore::new());
        let id = Uuid::new_v4();
        store.put("uploads/stale.png", 1024);
        repo.seed(StaleRecord {
            id,
            object_key: "uploads/stale.png".to_string(),
        });

        let reaper = StaleReaper::new(repo.clone(), store.clone(), ReaperConfig::default(), metrics::ReaperMetrics::new("test"));
        reaper.sweep_once().await.unwrap();

        assert!(repo.records.lock().unwrap().is_empty());
        assert!(store.head("uploads/stale.png").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn the_record_is_still_deleted_when_the_object_was_already_gone() {
        let repo = Arc::new(InMemoryRepository::default());
        let store = Arc::new(InMemoryObjectStore::new());
        let id = Uuid::new_v4();
        repo.seed(StaleRecord {
            id,
            object_key: "uploads/never-existed.png".to_string(),
        });

        let reaper = StaleReaper::new(repo.clone(), store, ReaperConfig::default(), metrics::ReaperMetrics::new("test"));
        reaper.sweep_once().await.unwrap();

        assert!(repo.records.lock().unwrap().is_empty());
    }
}
