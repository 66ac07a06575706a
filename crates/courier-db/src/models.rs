//! Database row types — these map directly to SQLite rows.
//! Distinct from the courier-types wire models to keep the storage layer
//! independent.

use chrono::{DateTime, Utc};
use tracing::warn;
use uuid::Uuid;

use courier_types::models::ChatMessage;

pub struct MessageRow {
    pub id: String,
    pub room_id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub content: String,
    pub is_read: bool,
    pub created_at: String,
}

impl MessageRow {
    /// Convert a stored row into the wire model, tolerating corrupt fields
    /// rather than failing a whole history fetch.
    pub fn into_message(self) -> ChatMessage {
        let id = self.id.parse::<Uuid>().unwrap_or_else(|e| {
            warn!("Corrupt message id '{}': {}", self.id, e);
            Uuid::default()
        });

        let timestamp = self
            .created_at
            .parse::<DateTime<Utc>>()
            .unwrap_or_else(|e| {
                warn!(
                    "Corrupt created_at '{}' on message '{}': {}",
                    self.created_at, self.id, e
                );
                DateTime::default()
            });

        ChatMessage {
            id,
            sender_id: self.sender_id,
            sender_name: self.sender_name,
            content: self.content,
            room_id: self.room_id,
            timestamp,
            is_read: self.is_read,
        }
    }
}
