use thiserror::Error;

/// The only two error kinds an effect handler is allowed to return.
/// Classification is the handler's responsibility -- the delivery engine
/// never introspects error text to decide whether to retry.
#[derive(Debug, Error, Clone)]
pub enum EffectError {
    /// A transient external fault: broker transport, transient DB, transient
    /// object-store, transient SMTP 4xx/5xx. Eligible for tiered retry.
    #[error("retriable: {0}")]
    Retriable(String),

    /// A logical failure that will recur: hard SMTP bounce, schema
    /// violation, decoded payload missing required fields, cancellation or
    /// deadline. Routed straight to the final DLQ.
    #[error("permanent: {0}")]
    Permanent(String),
}

impl EffectError {
    pub fn retriable(msg: impl Into<String>) -> Self {
        EffectError::Retriable(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        EffectError::Permanent(msg.into())
    }

    pub fn is_retriable(&self) -> bool {
        matches!(self, EffectError::Retriable(_))
    }

    pub fn message(&self) -> &str {
        match self {
            EffectError::Retriable(m) | EffectError::Permanent(m) => m,
        }
    }
}

/// Why a message ended up in the final DLQ, mirrored verbatim in the
/// `x-dlq-reason` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DlqReason {
    BadJson,
    NonRetriable,
    MaxAttemptsExceeded,
}

impl DlqReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DlqReason::BadJson => "bad_json",
            DlqReason::NonRetriable => "non_retriable",
            DlqReason::MaxAttemptsExceeded => "max_attempts_exceeded",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retriable_vs_permanent() {
        assert!(EffectError::retriable("timeout").is_retriable());
        assert!(!EffectError::permanent("bounce").is_retriable());
    }

    #[test]
    fn dlq_reason_strings_match_header_convention() {
        assert_eq!(DlqReason::BadJson.as_str(), "bad_json");
        assert_eq!(DlqReason::MaxAttemptsExceeded.as_str(), "max_attempts_exceeded");
    }
}
