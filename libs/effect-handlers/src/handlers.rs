use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use idempotency_store::{process_if_new, IdempotencyStore, ProcessingOutcome};
use message_model::{
    cancellation_fingerprint, image_processing_fingerprint, password_reset_fingerprint,
    verification_fingerprint, EffectError,
};
use serde::Deserialize;

use crate::collaborators::{EmailSender, ImageDeriver, SubjectNotifier};
use crate::registry::{DispatchError, EffectHandler};

const TRANSACTIONAL_MAIL_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const CANCELLATION_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);
const IMAGE_PROCESSING_TTL: Duration = Duration::from_secs(24 * 60 * 60);

fn decode<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T, DispatchError> {
    serde_json::from_slice(body).map_err(|e| DispatchError::BadJson(e.to_string()))
}

/// Extracts the `token` query parameter from a verification/reset link. The
/// token, not the whole URL, is the stable part of the payload: the link's
/// host or scheme could change between a retry and the original publish in
/// principle, the token may not.
fn extract_token(url: &str) -> Option<&str> {
    let query = url.split_once('?')?.1;
    query
        .split('&')
        .find_map(|pair| pair.split_once('=').filter(|(k, _)| *k == "token").map(|(_, v)| v))
}

#[derive(Debug, Deserialize)]
pub struct VerificationPayload {
    pub user_id: String,
    pub email: String,
    pub url: String,
}

pub struct VerificationHandler<S: IdempotencyStore> {
    store: Arc<S>,
    mailer: Arc<dyn EmailSender>,
}

impl<S: IdempotencyStore> VerificationHandler<S> {
    pub fn new(store: Arc<S>, mailer: Arc<dyn EmailSender>) -> Self {
        Self { store, mailer }
    }
}

#[async_trait]
impl<S: IdempotencyStore> EffectHandler for VerificationHandler<S> {
    async fn dispatch(&self, body: &[u8]) -> Result<(), DispatchError> {
        let payload: VerificationPayload = decode(body)?;
        let token = extract_token(&payload.url)
            .ok_or_else(|| DispatchError::Handler(EffectError::permanent("verification url missing token")))?;
        let fingerprint = verification_fingerprint(token);

        let (outcome, result) = process_if_new(
            self.store.as_ref(),
            &fingerprint,
            TRANSACTIONAL_MAIL_TTL,
            || async {
                self.mailer
                    .send(&payload.email, "Verify your account", &payload.url)
                    .await
            },
        )
        .await
        .map_err(DispatchError::Handler)?;

        if outcome == ProcessingOutcome::Executed {
            result.expect("Executed outcome always carries a result");
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
pub struct PasswordResetPayload {
    pub user_id: String,
    pub email: String,
    pub url: String,
}

pub struct PasswordResetHandler<S: IdempotencyStore> {
    store: Arc<S>,
    mailer: Arc<dyn EmailSender>,
}

impl<S: IdempotencyStore> PasswordResetHandler<S> {
    pub fn new(store: Arc<S>, mailer: Arc<dyn EmailSender>) -> Self {
        Self { store, mailer }
    }
}

#[async_trait]
impl<S: IdempotencyStore> EffectHandler for PasswordResetHandler<S> {
    async fn dispatch(&self, body: &[u8]) -> Result<(), DispatchError> {
        let payload: PasswordResetPayload = decode(body)?;
        let token = extract_token(&payload.url)
            .ok_or_else(|| DispatchError::Handler(EffectError::permanent("reset url missing token")))?;
        let fingerprint = password_reset_fingerprint(token);

        let (_outcome, _) = process_if_new(
            self.store.as_ref(),
            &fingerprint,
            TRANSACTIONAL_MAIL_TTL,
            || async {
                self.mailer
                    .send(&payload.email, "Reset your password", &payload.url)
                    .await
            },
        )
        .await
        .map_err(DispatchError::Handler)?;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
pub struct CancellationPayload {
    pub subject_id: String,
    pub recipient_id: String,
    pub reason: String,
}

pub struct CancellationHandler<S: IdempotencyStore> {
    store: Arc<S>,
    notifier: Arc<dyn SubjectNotifier>,
}

impl<S: IdempotencyStore> CancellationHandler<S> {
    pub fn new(store: Arc<S>, notifier: Arc<dyn SubjectNotifier>) -> Self {
        Self { store, notifier }
    }
}

#[async_trait]
impl<S: IdempotencyStore> EffectHandler for CancellationHandler<S> {
    async fn dispatch(&self, body: &[u8]) -> Result<(), DispatchError> {
        let payload: CancellationPayload = decode(body)?;
        let fingerprint = cancellation_fingerprint(&payload.subject_id, &payload.recipient_id);

        let (_outcome, _) = process_if_new(self.store.as_ref(), &fingerprint, CANCELLATION_TTL, || async {
            self.notifier
                .notify_canceled(&payload.recipient_id, &payload.subject_id, &payload.reason)
                .await
        })
        .await
        .map_err(DispatchError::Handler)?;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
pub struct ImageProcessingPayload {
    pub upload_id: String,
    pub object_key: String,
    pub purpose: String,
}

pub struct ImageProcessingHandler<S: IdempotencyStore> {
    store: Arc<S>,
    deriver: Arc<dyn ImageDeriver>,
}

impl<S: IdempotencyStore> ImageProcessingHandler<S> {
    pub fn new(store: Arc<S>, deriver: Arc<dyn ImageDeriver>) -> Self {
        Self { store, deriver }
    }
}

#[async_trait]
impl<S: IdempotencyStore> EffectHandler for ImageProcessingHandler<S> {
    async fn dispatch(&self, body: &[u8]) -> Result<(), DispatchError> {
        let payload: ImageProcessingPayload = decode(body)?;
        let fingerprint = image_processing_fingerprint(&payload.upload_id);

        let (_outcome, _) = process_if_new(self.store.as_ref(), &fingerprint, IMAGE_PROCESSING_TTL, || async {
            self.deriver
                .derive(&payload.upload_id, &payload.object_key, &payload.purpose)
                .await
        })
        .await
        .map_err(DispatchError::Handler)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use idempotency_store::InMemoryIdempotencyStore;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingMailer {
        calls: AtomicU32,
    }

    #[async_trait]
    impl EmailSender for CountingMailer {
        async fn send(&self, _to: &str, _subject: &str, _link: &str) -> Result<(), EffectError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn extracts_token_from_verify_link() {
        assert_eq!(
            extract_token("https://svc/verify?token=T1"),
            Some("T1")
        );
        assert_eq!(
            extract_token("https://svc/verify?a=1&token=T1&b=2"),
            Some("T1")
        );
        assert_eq!(extract_token("https://svc/verify"), None);
    }

    #[tokio::test]
    async fn verification_handler_invokes_mailer_once_per_token() {
        let store = Arc::new(InMemoryIdempotencyStore::new());
        let mailer = Arc::new(CountingMailer { calls: AtomicU32::new(0) });
        let handler = VerificationHandler::new(store, mailer.clone());

        let body = br#"{"user_id":"u1","email":"a@b.com","url":"https://svc/verify?token=T1"}"#;
        handler.dispatch(body).await.unwrap();
        handler.dispatch(body).await.unwrap();

        assert_eq!(mailer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn bad_json_is_reported_distinctly() {
        let store = Arc::new(InMemoryIdempotencyStore::new());
        let mailer = Arc::new(CountingMailer { calls: AtomicU32::new(0) });
        let handler = VerificationHandler::new(store, mailer);

        let err = handler.dispatch(b"{not-json").await.unwrap_err();
        assert!(matches!(err, DispatchError::BadJson(_)));
    }

    #[tokio::test]
    async fn missing_token_is_permanent_not_bad_json() {
        let store = Arc::new(InMemoryIdempotencyStore::new());
        let mailer = Arc::new(CountingMailer { calls: AtomicU32::new(0) });
        let handler = VerificationHandler::new(store, mailer);

        let body = br#"{"user_id":"u1","email":"a@b.com","url":"https://svc/verify"}"#;
        let err = handler.dispatch(body).await.unwrap_err();
        match err {
            DispatchError::Handler(EffectError::Permanent(_)) => {}
            other => panic!("expected a permanent handler error, got {other:?}"),
        }
    }
}
