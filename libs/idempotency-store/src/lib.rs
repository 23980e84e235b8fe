//! Idempotency marker store.
//!
//! An effect handler asks this store "has this fingerprint already been
//! handled?" before doing anything externally visible, and tells it "record
//! that this fingerprint is now handled" once the effect succeeds. The
//! store's only job is a correct, concurrency-safe compare-and-set with a
//! TTL -- no history, no per-fingerprint metadata beyond what's needed to
//! answer that question.
//!
//! # Why Redis `SET key value NX EX seconds`
//!
//! `NX` makes the write a true compare-and-set: two concurrent callers
//! racing to mark the same fingerprint can't both "win". `EX` gives the
//! marker's auto-expiry without a separate cleanup sweep, unlike a
//! table-backed marker store that needs a periodic `DELETE ... WHERE
//! processed_at < cutoff`. That shape is the right one when the check and
//! the effect can share a transaction (see the outbox pump's uniqueness
//! constraint); it's the wrong one here, where the effect is an external
//! side effect (an email send, a push notification) that cannot be wrapped
//! in a database transaction at all.
//!
//! # Concurrency
//!
//! `mark` is safe to call from any number of concurrent tasks for the same
//! fingerprint: exactly one call observes `true` (it created the marker),
//! every other concurrent or later call observes `false` until the TTL
//! expires.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use message_model::Fingerprint;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IdempotencyError {
    #[error("idempotency store connection failed: {0}")]
    Connection(String),
    #[error("idempotency store command failed: {0}")]
    Command(String),
}

pub type IdempotencyResult<T> = Result<T, IdempotencyError>;

/// Outcome of running an effect through [`IdempotencyStore::process_if_new`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessingOutcome {
    /// The effect ran and the marker was written.
    Executed,
    /// A marker already existed; the effect was skipped.
    AlreadyHandled,
}

#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    async fn is_marked(&self, fingerprint: &Fingerprint) -> IdempotencyResult<bool>;

    /// Attempt to create the marker. Returns `true` if this call created it
    /// (i.e. the fingerprint was unmarked a moment ago), `false` if another
    /// writer already holds it.
    async fn mark(&self, fingerprint: &Fingerprint, ttl: Duration) -> IdempotencyResult<bool>;
}

/// Redis-backed implementation, `SET key value NX EX seconds` as the
/// underlying primitive.
#[derive(Clone)]
pub struct RedisIdempotencyStore {
    conn: ConnectionManager,
    key_prefix: String,
}

impl RedisIdempotencyStore {
    pub async fn connect(redis_url: &str, key_prefix: impl Into<String>) -> IdempotencyResult<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| IdempotencyError::Connection(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| IdempotencyError::Connection(e.to_string()))?;
        Ok(Self {
            conn,
            key_prefix: key_prefix.into(),
        })
    }

    fn key(&self, fingerprint: &str) -> String {
        format!("{}:{}", self.key_prefix, fingerprint)
    }
}

#[async_trait]
impl IdempotencyStore for RedisIdempotencyStore {
    async fn is_marked(&self, fingerprint: &Fingerprint) -> IdempotencyResult<bool> {
        let mut conn = self.conn.clone();
        let exists: bool = conn
            .exists(self.key(fingerprint))
            .await
            .map_err(|e| IdempotencyError::Command(e.to_string()))?;
        Ok(exists)
    }

    async fn mark(&self, fingerprint: &Fingerprint, ttl: Duration) -> IdempotencyResult<bool> {
        let mut conn = self.conn.clone();
        let key = self.key(fingerprint);
        let result: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg(1)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .map_err(|e| IdempotencyError::Command(e.to_string()))?;
        Ok(result.is_some())
    }
}

/// In-process store for tests and for the effect-handler unit tests that
/// exercise the idempotency discipline without a Redis instance.
#[derive(Default)]
pub struct InMemoryIdempotencyStore {
    markers: Mutex<HashMap<Fingerprint, Instant>>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn is_marked(&self, fingerprint: &Fingerprint) -> IdempotencyResult<bool> {
        let markers = self.markers.lock().expect("idempotency store poisoned");
        Ok(markers
            .get(fingerprint)
            .map(|expires_at| *expires_at > Instant::now())
            .unwrap_or(false))
    }

    async fn mark(&self, fingerprint: &Fingerprint, ttl: Duration) -> IdempotencyResult<bool> {
        let mut markers = self.markers.lock().expect("idempotency store poisoned");
        let now = Instant::now();
        match markers.get(fingerprint) {
            Some(expires_at) if *expires_at > now => Ok(false),
            _ => {
                markers.insert(fingerprint.clone(), now + ttl);
                Ok(true)
            }
        }
    }
}

/// Run `effect` only if `fingerprint` has no live marker, marking it on
/// success. Marker-write failure is logged and swallowed by the caller of
/// this helper (see `effect-handlers`), not here: this function only
/// reports what happened, it does not decide how to handle a write failure.
pub async fn process_if_new<S, F, Fut, T, E>(
    store: &S,
    fingerprint: &Fingerprint,
    ttl: Duration,
    effect: F,
) -> Result<(ProcessingOutcome, Option<T>), E>
where
    S: IdempotencyStore,
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
{
    if store.is_marked(fingerprint).await.unwrap_or(false) {
        return Ok((ProcessingOutcome::AlreadyHandled, None));
    }

    let result = effect().await?;

    if let Err(e) = store.mark(fingerprint, ttl).await {
        tracing::warn!(
            fingerprint = %fingerprint,
            error = %e,
            "idempotency marker write failed after effect succeeded; accepting possible re-delivery"
        );
    }

    Ok((ProcessingOutcome::Executed, Some(result)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_mark_wins() {
        let store = InMemoryIdempotencyStore::new();
        let fp = "email:verify:T1".to_string();
        assert!(store.mark(&fp, Duration::from_secs(60)).await.unwrap());
        assert!(!store.mark(&fp, Duration::from_secs(60)).await.unwrap());
    }

    #[tokio::test]
    async fn is_marked_reflects_live_marker() {
        let store = InMemoryIdempotencyStore::new();
        let fp = "email:verify:T2".to_string();
        assert!(!store.is_marked(&fp).await.unwrap());
        store.mark(&fp, Duration::from_secs(60)).await.unwrap();
        assert!(store.is_marked(&fp).await.unwrap());
    }

    #[tokio::test]
    async fn marker_expires_after_ttl() {
        let store = InMemoryIdempotencyStore::new();
        let fp = "email:verify:T3".to_string();
        store.mark(&fp, Duration::from_millis(10)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!store.is_marked(&fp).await.unwrap());
        assert!(store.mark(&fp, Duration::from_secs(60)).await.unwrap());
    }

    #[tokio::test]
    async fn process_if_new_skips_second_call() {
        let store = InMemoryIdempotencyStore::new();
        let fp = "email:verify:T4".to_string();
        let calls = std::sync::atomic::AtomicU32::new(0);

        let (outcome, _) = process_if_new(&store, &fp, Duration::from_secs(60), || async {
            calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok::<_, String>(())
        })
        .await
        .unwrap();
        assert_eq!(outcome, ProcessingOutcome::Executed);

        let (outcome, _) = process_if_new(&store, &fp, Duration::from_secs(60), || async {
            calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok::<_, String>(())
        })
        .await
        .unwrap();
        assert_eq!(outcome, ProcessingOutcome::AlreadyHandled);

        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn process_if_new_does_not_mark_on_effect_failure() {
        let store = InMemoryIdempotencyStore::new();
        let fp = "email:verify:T5".to_string();

        let result = process_if_new(&store, &fp, Duration::from_secs(60), || async {
            Err::<(), _>("smtp timeout".to_string())
        })
        .await;
        assert!(result.is_err());
        assert!(!store.is_marked(&fp).await.unwrap());
    }
}
