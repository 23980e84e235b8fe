//! Transactional outbox pump.
//!
//! Write side: callers insert an [`OutboxRow`] into the `outbox_events` table
//! in the same transaction as the business-logic change it records, so the
//! row and the change commit or roll back together. Read side: a background
//! [`OutboxProcessor`] claims undrained rows with `FOR UPDATE SKIP LOCKED` so
//! more than one pump instance can run against the same table without double
//! draining, and writes each claimed row into the behavior log with `ON
//! CONFLICT (uniqueness_key) DO NOTHING` so a crash between the claim and the
//! drained-mark can never produce a duplicate behavior-log entry, only a
//! redundant no-op insert.
//!
//! This mirrors the write/claim/drain shape of a Kafka-backed outbox pump,
//! with the publish step replaced by a same-transaction insert into a
//! downstream table instead of a broker send.

mod error;
pub mod metrics;

pub use error::{OutboxError, OutboxResult};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// A row awaiting drain into the behavior log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxRow {
    pub id: Uuid,
    pub actor_key: String,
    pub subject_id: String,
    pub event_kind: String,
    pub bucket_date: NaiveDate,
    pub payload: serde_json::Value,
    pub attributes: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub last_error: Option<String>,
}

impl OutboxRow {
    pub fn new(
        actor_key: impl Into<String>,
        subject_id: impl Into<String>,
        event_kind: impl Into<String>,
        bucket_date: NaiveDate,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            actor_key: actor_key.into(),
            subject_id: subject_id.into(),
            event_kind: event_kind.into(),
            bucket_date,
            payload,
            attributes: None,
            created_at: Utc::now(),
            processed_at: None,
            retry_count: 0,
            last_error: None,
        }
    }

    /// The key the behavior log's uniqueness index is defined over:
    /// `(actor_key, subject_id, event_kind, bucket_date)`.
    pub fn uniqueness_key(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.actor_key, self.subject_id, self.event_kind, self.bucket_date
        )
    }
}

#[async_trait]
pub trait OutboxRepository: Send + Sync {
    /// Insert a row within an existing transaction, atomically with the
    /// business-logic change it records.
    async fn insert(&self, tx: &mut Transaction<'_, Postgres>, row: &OutboxRow) -> OutboxResult<()>;

    /// Claim up to `limit` undrained rows and hand them to `writer` within a
    /// single transaction, marking each successfully-written row drained.
    /// Returns the number of rows drained.
    async fn claim_and_process_batch(&self, limit: i64, writer: &dyn BehaviorLogWriter) -> OutboxResult<i64>;

    async fn pending_stats(&self) -> OutboxResult<(i64, i64)>;
}

/// Sink a drained row is written into. Implementations must make the write
/// safe to repeat: the same row claimed twice (after a crash between claim
/// and drained-mark) must not produce two behavior-log entries.
#[async_trait]
pub trait BehaviorLogWriter: Send + Sync {
    async fn write(&self, tx: &mut Transaction<'_, Postgres>, row: &OutboxRow) -> OutboxResult<()>;
}

pub struct SqlxOutboxRepository {
    pool: PgPool,
}

impl SqlxOutboxRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn replay_since(&self, ts: DateTime<Utc>) -> OutboxResult<u64> {
        let res = sqlx::query(
            r#"
            UPDATE outbox_events
            SET processed_at = NULL, retry_count = 0, last_error = NULL
            WHERE created_at >= $1
            "#,
        )
        .bind(ts)
        .execute(&self.pool)
        .await
        .context("failed to replay events since timestamp")?;

        Ok(res.rows_affected())
    }

    pub async fn replay_range(&self, from_id: Uuid, to_id: Uuid) -> OutboxResult<u64> {
        let res = sqlx::query(
            r#"
            UPDATE outbox_events
            SET processed_at = NULL, retry_count = 0, last_error = NULL
            WHERE id BETWEEN $1 AND $2
            "#,
        )
        .bind(from_id)
        .bind(to_id)
        .execute(&self.pool)
        .await
        .context("failed to replay events by id range")?;

        Ok(res.rows_affected())
    }

    fn row_from_sql(row: &sqlx::postgres::PgRow) -> Result<OutboxRow, sqlx::Error> {
        Ok(OutboxRow {
            id: row.try_get("id")?,
            actor_key: row.try_get("actor_key")?,
            subject_id: row.try_get("subject_id")?,
            event_kind: row.try_get("event_kind")?,
            bucket_date: row.try_get("bucket_date")?,
            payload: row.try_get("payload")?,
            attributes: row.try_get("attributes")?,
            created_at: row.try_get("created_at")?,
            processed_at: row.try_get("processed_at")?,
            retry_count: row.try_get("retry_count")?,
            last_error: row.try_get("last_error")?,
        })
    }
}

#[async_trait]
impl OutboxRepository for SqlxOutboxRepository {
    async fn insert(&self, tx: &mut Transaction<'_, Postgres>, row: &OutboxRow) -> OutboxResult<()> {
        sqlx::query(
            r#"
            INSERT INTO outbox_events (
                id, actor_key, subject_id, event_kind, bucket_date,
                payload, attributes, created_at, processed_at, retry_count, last_error
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(row.id)
        .bind(&row.actor_key)
        .bind(&row.subject_id)
        .bind(&row.event_kind)
        .bind(row.bucket_date)
        .bind(&row.payload)
        .bind(&row.attributes)
        .bind(row.created_at)
        .bind(row.processed_at)
        .bind(row.retry_count)
        .bind(&row.last_error)
        .execute(&mut **tx)
        .await
        .context("failed to insert outbox row")?;

        debug!(outbox_id = %row.id, event_kind = %row.event_kind, "outbox row inserted");
        Ok(())
    }

    async fn claim_and_process_batch(&self, limit: i64, writer: &dyn BehaviorLogWriter) -> OutboxResult<i64> {
        let mut tx = self.pool.begin().await.context("failed to begin drain transaction")?;

        let claimed = sqlx::query(
            r#"
            SELECT id, actor_key, subject_id, event_kind, bucket_date,
                   payload, attributes, created_at, processed_at, retry_count, last_error
            FROM outbox_events
            WHERE processed_at IS NULL
            ORDER BY created_at ASC
            LIMIT $1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(limit)
        .fetch_all(&mut *tx)
        .await
        .context("failed to claim outbox rows")?;

        let mut drained = 0i64;
        for sql_row in &claimed {
            let row = Self::row_from_sql(sql_row).context("failed to parse outbox row")?;

            writer.write(&mut tx, &row).await?;

            sqlx::query("UPDATE outbox_events SET processed_at = NOW() WHERE id = $1")
                .bind(row.id)
                .execute(&mut *tx)
                .await
                .context("failed to mark outbox row drained")?;

            drained += 1;
        }

        tx.commit().await.context("failed to commit drain batch")?;
        Ok(drained)
    }

    async fn pending_stats(&self) -> OutboxResult<(i64, i64)> {
        let rec = sqlx::query(
            r#"
            SELECT
                COUNT(*)::BIGINT AS pending,
                COALESCE(EXTRACT(EPOCH FROM (NOW() - MIN(created_at)))::BIGINT, 0) AS age_seconds
            FROM outbox_events
            WHERE processed_at IS NULL
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .context("failed to compute pending stats")?;

        let pending: i64 = rec.try_get("pending").unwrap_or(0);
        let age: i64 = rec.try_get("age_seconds").unwrap_or(0);
        Ok((pending, age))
    }
}

/// Writes a drained row into the behavior log, deduplicating on the row's
/// uniqueness key. This is the sink side that stands in for a broker publish.
pub struct PgBehaviorLogWriter;

#[async_trait]
impl BehaviorLogWriter for PgBehaviorLogWriter {
    async fn write(&self, tx: &mut Transaction<'_, Postgres>, row: &OutboxRow) -> OutboxResult<()> {
        sqlx::query(
            r#"
            INSERT INTO behavior_log (
                id, uniqueness_key, actor_key, subject_id, event_kind,
                bucket_date, payload, attributes, recorded_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW())
            ON CONFLICT (uniqueness_key) DO NOTHING
            "#,
        )
        .bind(row.id)
        .bind(row.uniqueness_key())
        .bind(&row.actor_key)
        .bind(&row.subject_id)
        .bind(&row.event_kind)
        .bind(row.bucket_date)
        .bind(&row.payload)
        .bind(&row.attributes)
        .execute(&mut **tx)
        .await
        .context("failed to write behavior log entry")?;

        Ok(())
    }
}

/// Background drain loop. Polls for undrained rows at a fixed interval and
/// writes each batch into the behavior log via `writer`.
pub struct OutboxProcessor<R: OutboxRepository, W: BehaviorLogWriter> {
    repository: Arc<R>,
    writer: Arc<W>,
    batch_size: i64,
    poll_interval: Duration,
    metrics: Option<crate::metrics::OutboxMetrics>,
}

impl<R: OutboxRepository, W: BehaviorLogWriter> OutboxProcessor<R, W> {
    pub fn new(repository: Arc<R>, writer: Arc<W>, batch_size: i64, poll_interval: Duration) -> Self {
        Self {
            repository,
            writer,
            batch_size,
            poll_interval,
            metrics: None,
        }
    }

    pub fn new_with_metrics(
        repository: Arc<R>,
        writer: Arc<W>,
        metrics: crate::metrics::OutboxMetrics,
        batch_size: i64,
        poll_interval: Duration,
    ) -> Self {
        Self {
            repository,
            writer,
            batch_size,
            poll_interval,
            metrics: Some(metrics),
        }
    }

    /// Runs until `shutdown` fires. Intended to be spawned as a background
    /// task alongside the other components a lifecycle supervisor owns.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!(
            batch_size = self.batch_size,
            poll_interval_secs = self.poll_interval.as_secs(),
            "outbox pump starting"
        );

        loop {
            match self.repository.claim_and_process_batch(self.batch_size, self.writer.as_ref()).await {
                Ok(count) if count > 0 => {
                    info!(drained = count, "drained outbox rows");
                    if let Some(metrics) = &self.metrics {
                        metrics.drained.inc_by(count as u64);
                    }
                }
                Ok(_) => debug!("no outbox rows to drain"),
                Err(e) => error!(error = %e, "outbox drain batch failed"),
            }

            if let Some(metrics) = &self.metrics {
                if let Ok((pending, age)) = self.repository.pending_stats().await {
                    metrics.pending.set(pending);
                    metrics.oldest_pending_age_seconds.set(age);
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("outbox pump shutting down");
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn uniqueness_key_combines_all_four_fields() {
        let row = OutboxRow::new(
            "user:u1",
            "event:e1",
            "notify.canceled",
            NaiveDate::from_ymd_opt(2026, 7, 27).unwrap(),
            serde_json::json!({}),
        );
        assert_eq!(row.uniqueness_key(), "user:u1:event:e1:notify.canceled:2026-07-27");
    }

    #[test]
    fn new_row_starts_undrained_with_zero_retries() {
        let row = OutboxRow::new(
            "user:u1",
            "event:e1",
            "notify.canceled",
            NaiveDate::from_ymd_opt(2026, 7, 27).unwrap(),
            serde_json::json!({}),
        );
        assert!(row.processed_at.is_none());
        assert_eq!(row.retry_count, 0);
        assert!(row.last_error.is_none());
    }
}
