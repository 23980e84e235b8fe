use std::collections::HashMap;

use chrono::{DateTime, Utc};

/// Retry attempt counter. Present on every redelivery, absent (treated as 0) on
/// the first publish.
pub const HEADER_ATTEMPT: &str = "x-attempt";
/// Set by the retry publisher so a message dead-lettered back to the main
/// exchange keeps routing to the same handler.
pub const HEADER_ORIG_ROUTING_KEY: &str = "x-orig-routing-key";
/// Human-readable cause of the most recent failure, for operators reading the
/// broker UI; never parsed back out programmatically.
pub const HEADER_ERROR: &str = "x-error";
/// Only set on messages published to the final DLQ.
pub const HEADER_DLQ_REASON: &str = "x-dlq-reason";

/// A scalar header value. AMQP field tables support richer types; this system
/// only ever needs strings and integers.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    Str(String),
    Int(i64),
}

impl HeaderValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::Str(s) => Some(s),
            HeaderValue::Int(_) => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            HeaderValue::Int(i) => Some(*i),
            HeaderValue::Str(s) => s.parse().ok(),
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(s: &str) -> Self {
        HeaderValue::Str(s.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(s: String) -> Self {
        HeaderValue::Str(s)
    }
}

impl From<i64> for HeaderValue {
    fn from(i: i64) -> Self {
        HeaderValue::Int(i)
    }
}

/// A broker delivery, independent of the transport crate that produced it.
///
/// The body is never mutated across retries -- only headers change. Anything
/// that needs to change the body (rather than re-route or re-try it) is a
/// different message, not a retry.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub routing_key: String,
    pub body: Vec<u8>,
    pub content_type: String,
    pub message_id: String,
    pub correlation_id: Option<String>,
    pub headers: HashMap<String, HeaderValue>,
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    pub fn new(routing_key: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            routing_key: routing_key.into(),
            body,
            content_type: "application/json".to_string(),
            message_id: uuid::Uuid::new_v4().to_string(),
            correlation_id: None,
            headers: HashMap::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<HeaderValue>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Current attempt number. A message that has never been retried carries
    /// no `x-attempt` header and is attempt 0.
    pub fn attempt(&self) -> u32 {
        self.headers
            .get(HEADER_ATTEMPT)
            .and_then(|v| v.as_int())
            .and_then(|v| u32::try_from(v).ok())
            .unwrap_or(0)
    }

    pub fn orig_routing_key(&self) -> &str {
        self.headers
            .get(HEADER_ORIG_ROUTING_KEY)
            .and_then(|v| v.as_str())
            .unwrap_or(&self.routing_key)
    }

    /// Build the envelope to publish for a retry: same body/content-type/
    /// message-id/correlation-id, new attempt and cause headers, original
    /// routing key preserved so it survives the round trip through a tier
    /// exchange.
    pub fn for_retry(&self, next_attempt: u32, cause: &str) -> Envelope {
        let orig_key = self.orig_routing_key().to_string();
        Envelope {
            routing_key: orig_key.clone(),
            body: self.body.clone(),
            content_type: self.content_type.clone(),
            message_id: self.message_id.clone(),
            correlation_id: self.correlation_id.clone(),
            headers: HashMap::from([
                (HEADER_ATTEMPT.to_string(), HeaderValue::Int(next_attempt as i64)),
                (HEADER_ORIG_ROUTING_KEY.to_string(), HeaderValue::Str(orig_key)),
                (HEADER_ERROR.to_string(), HeaderValue::Str(cause.to_string())),
            ]),
            timestamp: self.timestamp,
        }
    }

    /// Build the envelope to publish to the final DLQ.
    pub fn for_dlq(&self, reason: &str) -> Envelope {
        let orig_key = self.orig_routing_key().to_string();
        let mut headers = HashMap::from([
            (HEADER_ORIG_ROUTING_KEY.to_string(), HeaderValue::Str(orig_key)),
            (HEADER_DLQ_REASON.to_string(), HeaderValue::Str(reason.to_string())),
        ]);
        if let Some(HeaderValue::Int(attempt)) = self.headers.get(HEADER_ATTEMPT) {
            headers.insert(HEADER_ATTEMPT.to_string(), HeaderValue::Int(*attempt));
        }
        Envelope {
            routing_key: self.routing_key.clone(),
            body: self.body.clone(),
            content_type: self.content_type.clone(),
            message_id: self.message_id.clone(),
            correlation_id: self.correlation_id.clone(),
            headers,
            timestamp: self.timestamp,
        }
    }
}

/// One of the three delayed-retry tiers, or the terminal final DLQ.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryTier {
    TenSeconds,
    OneMinute,
    TenMinutes,
}

impl RetryTier {
    pub fn ttl_ms(self) -> u32 {
        match self {
            RetryTier::TenSeconds => 10_000,
            RetryTier::OneMinute => 60_000,
            RetryTier::TenMinutes => 600_000,
        }
    }

    pub fn exchange_name(self) -> &'static str {
        match self {
            RetryTier::TenSeconds => "X_10s",
            RetryTier::OneMinute => "X_1m",
            RetryTier::TenMinutes => "X_10m",
        }
    }

    pub fn queue_name(self) -> &'static str {
        match self {
            RetryTier::TenSeconds => "Q_10s",
            RetryTier::OneMinute => "Q_1m",
            RetryTier::TenMinutes => "Q_10m",
        }
    }
}

/// `tier_for(1) = 10s`, `tier_for(2) = 1m`, otherwise `10m`.
pub fn tier_for(next_attempt: u32) -> RetryTier {
    match next_attempt {
        1 => RetryTier::TenSeconds,
        2 => RetryTier::OneMinute,
        _ => RetryTier::TenMinutes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attempt_defaults_to_zero() {
        let env = Envelope::new("auth.email.verify.requested", b"{}".to_vec());
        assert_eq!(env.attempt(), 0);
    }

    #[test]
    fn for_retry_preserves_body_and_bumps_attempt() {
        let env = Envelope::new("auth.email.verify.requested", br#"{"a":1}"#.to_vec());
        let retried = env.for_retry(1, "smtp timeout");
        assert_eq!(retried.attempt(), 1);
        assert_eq!(retried.body, env.body);
        assert_eq!(retried.message_id, env.message_id);
        assert_eq!(retried.routing_key, "auth.email.verify.requested");
    }

    #[test]
    fn for_retry_preserves_original_routing_key_across_two_hops() {
        let env = Envelope::new("auth.email.verify.requested", b"{}".to_vec());
        let once = env.for_retry(1, "first failure");
        let twice = once.for_retry(2, "second failure");
        assert_eq!(twice.orig_routing_key(), "auth.email.verify.requested");
        assert_eq!(twice.attempt(), 2);
    }

    #[test]
    fn tier_selection_matches_attempt_thresholds() {
        assert_eq!(tier_for(1), RetryTier::TenSeconds);
        assert_eq!(tier_for(2), RetryTier::OneMinute);
        assert_eq!(tier_for(3), RetryTier::TenMinutes);
        assert_eq!(tier_for(9), RetryTier::TenMinutes);
    }

    #[test]
    fn dlq_envelope_carries_reason_and_original_key() {
        let env = Envelope::new("auth.email.verify.requested", b"not-json".to_vec());
        let dlq = env.for_dlq("bad_json");
        assert_eq!(
            dlq.headers.get(HEADER_DLQ_REASON).and_then(|v| v.as_str()),
            Some("bad_json")
        );
        assert_eq!(dlq.orig_routing_key(), "auth.email.verify.requested");
    }
}
