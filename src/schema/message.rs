use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// History record for a message this account sent, as stored in `wa_bridge.messages`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentMessage {
    pub message_id: String,
    pub chat_id: String,
    pub sender_id: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}
