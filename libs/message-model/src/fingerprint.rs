/// A deterministic key identifying a unique business effect across retries.
/// Same business intent must always hash to the same fingerprint regardless
/// of attempt number, so callers derive it from stable payload fields only
/// (never from headers, never from `message_id`).
pub type Fingerprint = String;

pub fn verification_fingerprint(token: &str) -> Fingerprint {
    format!("email:verify:{token}")
}

pub fn password_reset_fingerprint(token: &str) -> Fingerprint {
    format!("email:reset:{token}")
}

pub fn cancellation_fingerprint(subject_id: &str, recipient_id: &str) -> Fingerprint {
    format!("notify:cancel:{subject_id}:{recipient_id}")
}

pub fn image_processing_fingerprint(upload_id: &str) -> Fingerprint {
    format!("media:process:{upload_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable_for_same_token() {
        assert_eq!(verification_fingerprint("T1"), verification_fingerprint("T1"));
        assert_ne!(verification_fingerprint("T1"), verification_fingerprint("T2"));
    }

    #[test]
    fn fingerprint_namespaces_dont_collide() {
        assert_ne!(verification_fingerprint("abc"), password_reset_fingerprint("abc"));
    }
}
