mod collaborators;
mod handlers;
mod registry;

pub use collaborators::{
    EmailSender, ImageDeriver, NoopEmailSender, NoopImageDeriver, NoopSubjectNotifier, RequestContext,
    SubjectNotifier,
};
pub use handlers::{
    CancellationHandler, CancellationPayload, ImageProcessingHandler, ImageProcessingPayload,
    PasswordResetHandler, PasswordResetPayload, VerificationHandler, VerificationPayload,
};
pub use registry::{DispatchError, EffectHandler, HandlerRegistry};

use std::sync::Arc;

use idempotency_store::IdempotencyStore;

/// Routing keys the four core capabilities are bound to. The delivery engine
/// declares its main queue's bindings from the same list so a handler can
/// never be registered for a key nothing is bound to, or vice versa.
pub mod routing_keys {
    pub const SEND_VERIFICATION: &str = "auth.email.verify.requested";
    pub const SEND_PASSWORD_RESET: &str = "auth.email.reset.requested";
    pub const NOTIFY_SUBJECT_CANCELED: &str = "events.subject.canceled";
    pub const PROCESS_UPLOADED_IMAGE: &str = "media.image.uploaded";
}

/// Builds the registry used by the messaging worker binary, wiring the four
/// core capabilities to their routing keys with the supplied collaborators.
pub fn build_registry<S>(
    store: Arc<S>,
    mailer: Arc<dyn EmailSender>,
    notifier: Arc<dyn SubjectNotifier>,
    deriver: Arc<dyn ImageDeriver>,
) -> HandlerRegistry
where
    S: IdempotencyStore + 'static,
{
    HandlerRegistry::new()
        .register(
            routing_keys::SEND_VERIFICATION,
            Arc::new(VerificationHandler::new(store.clone(), mailer.clone())),
        )
        .register(
            routing_keys::SEND_PASSWORD_RESET,
            Arc::new(PasswordResetHandler::new(store.clone(), mailer)),
        )
        .register(
            routing_keys::NOTIFY_SUBJECT_CANCELED,
            Arc::new(CancellationHandler::new(store.clone(), notifier)),
        )
        .register(
            routing_keys::PROCESS_UPLOADED_IMAGE,
            Arc::new(ImageProcessingHandler::new(store, deriver)),
        )
}
