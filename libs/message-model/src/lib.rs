//! Wire-level data model shared by every component of the messaging
//! substrate: the broker envelope, retry tiers, the effect-handler error
//! taxonomy, and fingerprint derivation.

mod envelope;
mod error;
mod fingerprint;

pub use envelope::{
    Envelope, HeaderValue, RetryTier, HEADER_ATTEMPT, HEADER_DLQ_REASON, HEADER_ERROR,
    HEADER_ORIG_ROUTING_KEY, tier_for,
};
pub use error::{DlqReason, EffectError};
pub use fingerprint::{
    cancellation_fingerprint, image_processing_fingerprint, password_reset_fingerprint,
    verification_fingerprint, Fingerprint,
};
