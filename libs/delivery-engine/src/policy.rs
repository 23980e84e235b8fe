//! The retry/DLQ decision table, pulled out as a pure function so the
//! routing logic in §4.2 can be tested without a broker: given the current
//! attempt and a dispatch outcome, what should happen to the delivery.

use effect_handlers::DispatchError;
use message_model::{tier_for, DlqReason, EffectError, RetryTier};

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Ack,
    Retry {
        tier: RetryTier,
        next_attempt: u32,
        cause: String,
    },
    Dlq {
        reason: DlqReason,
        cause: String,
    },
}

/// `attempt` is the delivery's current `x-attempt` value (0 on first try).
/// Mirrors the table in §4.2 verbatim: a retriable failure at or past
/// `max_attempts` goes straight to the final DLQ instead of one more tier.
pub fn decide(attempt: u32, max_attempts: u32, outcome: &Result<(), DispatchError>) -> Decision {
    match outcome {
        Ok(()) => Decision::Ack,
        Err(DispatchError::BadJson(msg)) => Decision::Dlq {
            reason: DlqReason::BadJson,
            cause: msg.clone(),
        },
        Err(DispatchError::Handler(EffectError::Permanent(msg))) => Decision::Dlq {
            reason: DlqReason::NonRetriable,
            cause: msg.clone(),
        },
        Err(DispatchError::Handler(EffectError::Retriable(msg))) => {
            if attempt >= max_attempts {
                Decision::Dlq {
                    reason: DlqReason::MaxAttemptsExceeded,
                    cause: msg.clone(),
                }
            } else {
                let next_attempt = attempt + 1;
                Decision::Retry {
                    tier: tier_for(next_attempt),
                    next_attempt,
                    cause: msg.clone(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn retriable(msg: &str) -> Result<(), DispatchError> {
        Err(DispatchError::Handler(EffectError::retriable(msg)))
    }

    #[test]
    fn success_acks() {
        assert_eq!(decide(0, 5, &Ok(())), Decision::Ack);
    }

    #[test]
    fn bad_json_goes_straight_to_dlq() {
        let outcome = Err(DispatchError::BadJson("unexpected EOF".into()));
        assert_eq!(
            decide(0, 5, &outcome),
            Decision::Dlq {
                reason: DlqReason::BadJson,
                cause: "unexpected EOF".into()
            }
        );
    }

    #[test]
    fn permanent_handler_error_goes_to_dlq_as_non_retriable() {
        let outcome = Err(DispatchError::Handler(EffectError::permanent("hard bounce")));
        assert_eq!(
            decide(2, 5, &outcome),
            Decision::Dlq {
                reason: DlqReason::NonRetriable,
                cause: "hard bounce".into()
            }
        );
    }

    #[test]
    fn retriable_under_the_ceiling_advances_to_the_next_tier() {
        assert_eq!(
            decide(0, 5, &retriable("smtp timeout")),
            Decision::Retry {
                tier: RetryTier::TenSeconds,
                next_attempt: 1,
                cause: "smtp timeout".into()
            }
        );
        assert_eq!(
            decide(1, 5, &retriable("smtp timeout")),
            Decision::Retry {
                tier: RetryTier::OneMinute,
                next_attempt: 2,
                cause: "smtp timeout".into()
            }
        );
        assert_eq!(
            decide(2, 5, &retriable("smtp timeout")),
            Decision::Retry {
                tier: RetryTier::TenMinutes,
                next_attempt: 3,
                cause: "smtp timeout".into()
            }
        );
    }

    #[test]
    fn retriable_at_the_ceiling_exhausts_to_final_dlq() {
        assert_eq!(
            decide(5, 5, &retriable("still down")),
            Decision::Dlq {
                reason: DlqReason::MaxAttemptsExceeded,
                cause: "still down".into()
            }
        );
    }

    #[test]
    fn attempts_are_strictly_monotone_across_a_full_exhaustion_run() {
        let mut attempt = 0u32;
        let mut seen = vec![];
        loop {
            match decide(attempt, 5, &retriable("down")) {
                Decision::Retry { next_attempt, .. } => {
                    assert!(next_attempt > attempt);
                    seen.push(next_attempt);
                    attempt = next_attempt;
                }
                Decision::Dlq { reason, .. } => {
                    assert_eq!(reason, DlqReason::MaxAttemptsExceeded);
                    break;
                }
                Decision::Ack => unreachable!(),
            }
        }
        assert_eq!(seen, vec![1, 2, 3, 4, 5]);
    }
}
