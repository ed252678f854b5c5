use chrono::{DateTime, Utc};

use super::ids::ParticipantId;

/// Where a record entered the conversation. Diagnostic only; never part of dedup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageOrigin {
    History,
    Live,
}

/// One chat line. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub sender_id: ParticipantId,
    pub sender_display_name: String,
    pub text: String,
    pub occurred_at: DateTime<Utc>,
    pub origin: MessageOrigin,
}

impl MessageRecord {
    pub fn new(
        sender_id: ParticipantId,
        sender_display_name: impl Into<String>,
        text: impl Into<String>,
        occurred_at: DateTime<Utc>,
        origin: MessageOrigin,
    ) -> Self {
        Self {
            sender_id,
            sender_display_name: sender_display_name.into(),
            text: text.into(),
            occurred_at,
            origin,
        }
    }
}

/// The local party: who joins the channel and whose name is attached to sends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantIdentity {
    pub id: ParticipantId,
    pub display_name: String,
}

impl ParticipantIdentity {
    pub fn new(id: ParticipantId, display_name: impl Into<String>) -> Self {
        Self {
            id,
            display_name: display_name.into().trim().to_string(),
        }
    }

    /// Membership is keyed on a first name server-side, so an unnamed identity cannot join.
    pub fn can_join(&self) -> bool {
        !self.display_name.is_empty()
    }
}
