use async_trait::async_trait;
use message_model::EffectError;

/// A small typed envelope for request correlation -- never smuggle domain
/// data through ambient context, only `request_id` and a cancellation
/// signal travel this way.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
}

impl RequestContext {
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
        }
    }
}

/// Sends transactional mail. The SMTP wire protocol and HTML templating are
/// out of scope for this system; this trait is the seam a real mailer
/// plugs into.
#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send(&self, to: &str, subject: &str, link: &str) -> Result<(), EffectError>;
}

/// Notifies a recipient that some subject (an event, a post) they were
/// interested in was canceled. Push/SMS/in-app delivery is out of scope;
/// this trait is the seam.
#[async_trait]
pub trait SubjectNotifier: Send + Sync {
    async fn notify_canceled(
        &self,
        recipient_id: &str,
        subject_id: &str,
        reason: &str,
    ) -> Result<(), EffectError>;
}

/// Derives thumbnail/preview artifacts from a raw uploaded object and
/// persists their keys. Image codecs and the object-store client concrete
/// implementation are out of scope for this trait; it only describes the
/// effect the handler needs performed.
#[async_trait]
pub trait ImageDeriver: Send + Sync {
    async fn derive(&self, upload_id: &str, raw_key: &str, purpose: &str) -> Result<Vec<String>, EffectError>;
}

/// Logs and returns `Ok` without doing anything. Used where a capability's
/// real backend is an out-of-scope external collaborator and the handler
/// still needs something to call in tests or in a degraded deployment --
/// the same posture this workspace takes toward optional FCM/APNs clients.
pub struct NoopEmailSender;

#[async_trait]
impl EmailSender for NoopEmailSender {
    async fn send(&self, to: &str, subject: &str, _link: &str) -> Result<(), EffectError> {
        tracing::warn!(to, subject, "email sender not configured; dropping send");
        Ok(())
    }
}

pub struct NoopSubjectNotifier;

#[async_trait]
impl SubjectNotifier for NoopSubjectNotifier {
    async fn notify_canceled(
        &self,
        recipient_id: &str,
        subject_id: &str,
        _reason: &str,
    ) -> Result<(), EffectError> {
        tracing::warn!(recipient_id, subject_id, "subject notifier not configured; dropping notification");
        Ok(())
    }
}

/// Records that derivation was requested without running any codec.
/// Image codecs are out of scope for this workspace; a real deployment
/// supplies an `ImageDeriver` that shells out to (or calls a service
/// wrapping) an actual resizer. This implementation still returns keys
/// deterministic in `upload_id` and `purpose` so callers exercising the
/// upload lifecycle against it see a stable, non-empty derived set.
pub struct NoopImageDeriver;

#[async_trait]
impl ImageDeriver for NoopImageDeriver {
    async fn derive(&self, upload_id: &str, raw_key: &str, purpose: &str) -> Result<Vec<String>, EffectError> {
        tracing::warn!(upload_id, raw_key, purpose, "image deriver not configured; returning placeholder derivatives");
        Ok(vec![format!("{raw_key}.{purpose}.derived")])
    }
}
