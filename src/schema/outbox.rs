use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[forge::forge_enum]
pub enum OutboxStatus {
    Pending,
    Sending,
    Sent,
    Failed,
}

impl OutboxStatus {
    /// Only the forward transitions of the claim lifecycle are allowed.
    pub fn can_transition_to(self, next: OutboxStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Sending) | (Self::Sending, Self::Sent) | (Self::Sending, Self::Failed)
        )
    }
}

/// A row of `wa_bridge.outgoing_messages`.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[forge::model]
pub struct OutgoingMessage {
    pub id: i64,
    pub chat_id: String,
    pub content: String,
    pub status: OutboxStatus,
    pub sent_message_id: Option<String>,
    pub error_message: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// The part of a row handed back by a successful claim.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct ClaimedMessage {
    pub chat_id: String,
    pub content: String,
}

/// Body of a `new_outgoing_message` notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxNotification {
    pub id: i64,
}
