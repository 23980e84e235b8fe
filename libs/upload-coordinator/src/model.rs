use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum UploadStatus {
    Pending,
    Uploaded,
    Processing,
    Ready,
    Failed,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStatus::Pending => "PENDING",
            UploadStatus::Uploaded => "UPLOADED",
            UploadStatus::Processing => "PROCESSING",
            UploadStatus::Ready => "READY",
            UploadStatus::Failed => "FAILED",
        }
    }

    /// Whether a record may move from `self` to `next`. Matches the
    /// exhaustive transition table: forward progress only, with `FAILED`
    /// reachable from any non-terminal state and no path back out of it.
    pub fn can_transition_to(self, next: UploadStatus) -> bool {
        use UploadStatus::*;
        matches!(
            (self, next),
            (Pending, Uploaded)
                | (Pending, Failed)
                | (Uploaded, Processing)
                | (Uploaded, Failed)
                | (Processing, Ready)
                | (Processing, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, UploadStatus::Ready | UploadStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UploadPurpose {
    Avatar,
    EventCover,
}

impl UploadPurpose {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "avatar" => Some(UploadPurpose::Avatar),
            "event_cover" => Some(UploadPurpose::EventCover),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UploadPurpose::Avatar => "avatar",
            UploadPurpose::EventCover => "event_cover",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct UploadRecord {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub purpose: String,
    pub object_key: String,
    pub status: String,
    pub max_bytes: i64,
    pub observed_bytes: Option<i64>,
    pub derived_urls: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UploadRecord {
    pub fn status(&self) -> UploadStatus {
        match self.status.as_str() {
            "PENDING" => UploadStatus::Pending,
            "UPLOADED" => UploadStatus::Uploaded,
            "PROCESSING" => UploadStatus::Processing,
            "READY" => UploadStatus::Ready,
            _ => UploadStatus::Failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use UploadStatus::*;

    #[test]
    fn forward_transitions_are_allowed() {
        assert!(Pending.can_transition_to(Uploaded));
        assert!(Uploaded.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Ready));
    }

    #[test]
    fn failed_is_reachable_from_every_non_terminal_state() {
        assert!(Pending.can_transition_to(Failed));
        assert!(Uploaded.can_transition_to(Failed));
        assert!(Processing.can_transition_to(Failed));
    }

    #[test]
    fn terminal_states_have_no_outgoing_transitions() {
        for target in [Pending, Uploaded, Processing, Ready, Failed] {
            assert!(!Ready.can_transition_to(target));
            assert!(!Failed.can_transition_to(target));
        }
    }

    #[test]
    fn no_transition_reaches_an_ancestor() {
        assert!(!Uploaded.can_transition_to(Pending));
        assert!(!Processing.can_transition_to(Uploaded));
        assert!(!Processing.can_transition_to(Pending));
        assert!(!Ready.can_transition_to(Processing));
    }

    #[test]
    fn purpose_parses_known_values_only() {
        assert_eq!(UploadPurpose::parse("avatar"), Some(UploadPurpose::Avatar));
        assert_eq!(UploadPurpose::parse("event_cover"), Some(UploadPurpose::EventCover));
        assert_eq!(UploadPurpose::parse("banner"), None);
    }
}
