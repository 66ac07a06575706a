use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Verified identity attached to a connection at upgrade time.
/// Produced by the upstream auth service; immutable for the connection's lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    pub display_name: String,
    #[serde(default)]
    pub is_admin: bool,
}

/// A chat message, both as stored and as delivered over the wire.
/// Immutable once stored except `content` (edit) and `is_read` (read receipt).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: Uuid,
    pub sender_id: String,
    pub sender_name: String,
    pub content: String,
    pub room_id: String,
    pub timestamp: DateTime<Utc>,
    pub is_read: bool,
}

/// One row of the unread-DM summary delivered once on join.
/// Wire keys stay snake_case (`sender_name`); they are the stable public
/// contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnreadSummary {
    pub sender_name: String,
    pub count: u32,
}
