use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{ChatMessage, UnreadSummary};

/// Commands sent FROM client TO server over the WebSocket.
///
/// The tag strings (`join`, `sendMessage`, ...) are the stable public
/// contract; everything is validated at the boundary before dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ClientCommand {
    /// First frame after the upgrade. The identity must match the one
    /// authenticated at the HTTP layer.
    Join {
        user_id: String,
        name: String,
        #[serde(default)]
        room_id: Option<String>,
    },

    /// Post a message to a room.
    SendMessage {
        sender_id: String,
        sender_name: String,
        content: String,
        room_id: String,
    },

    /// Change the connection's active room.
    SwitchRoom(String),

    /// Started typing in a room.
    Typing { room_id: String },

    /// Stopped typing in a room.
    StopTyping { room_id: String },

    /// Replace the content of an existing message.
    EditMessage {
        id: Uuid,
        content: String,
        room_id: String,
    },

    /// Remove a single message.
    DeleteMessage { id: Uuid, room_id: String },

    /// Purge a whole room's history.
    ClearChat { room_id: String },

    /// Client-initiated close.
    Disconnect,
}

/// Events sent FROM server TO clients over the WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    /// Full online-user list, emitted on every presence change.
    ActiveUsers(Vec<String>),

    /// A message was posted to a room the recipient belongs to.
    NewMessage(ChatMessage),

    /// Unread-DM summary, delivered once to a freshly joined connection.
    OfflineMessages(Vec<UnreadSummary>),

    /// Someone started typing in a room.
    UserTyping {
        user_id: String,
        user_name: String,
        room_id: String,
    },

    /// Someone stopped typing (explicitly or by timeout).
    UserStoppedTyping {
        user_id: String,
        user_name: String,
        room_id: String,
    },

    /// A message's content was edited.
    MessageUpdated {
        id: Uuid,
        content: String,
        room_id: String,
    },

    /// A message was deleted.
    MessageDeleted { id: Uuid, room_id: String },

    /// A room's history was purged.
    ChatCleared { room_id: String },

    /// Something this connection asked for failed. Never broadcast.
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_tags_match_the_wire_contract() {
        let cmd: ClientCommand = serde_json::from_str(
            r#"{"type":"join","data":{"userId":"7","name":"dana"}}"#,
        )
        .unwrap();
        match cmd {
            ClientCommand::Join { user_id, name, room_id } => {
                assert_eq!(user_id, "7");
                assert_eq!(name, "dana");
                assert!(room_id.is_none());
            }
            other => panic!("unexpected variant: {:?}", other),
        }

        let cmd: ClientCommand =
            serde_json::from_str(r#"{"type":"switchRoom","data":"3_9"}"#).unwrap();
        assert!(matches!(cmd, ClientCommand::SwitchRoom(room) if room == "3_9"));
    }

    #[test]
    fn offline_summary_keeps_snake_case_keys() {
        let event = ServerEvent::OfflineMessages(vec![UnreadSummary {
            sender_name: "robin".into(),
            count: 4,
        }]);
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"offlineMessages""#));
        assert!(json.contains(r#""sender_name":"robin""#));
    }

    #[test]
    fn typing_event_uses_camel_case_fields() {
        let event = ServerEvent::UserTyping {
            user_id: "2".into(),
            user_name: "kim".into(),
            room_id: "global".into(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"userTyping""#));
        assert!(json.contains(r#""userId":"2""#));
        assert!(json.contains(r#""roomId":"global""#));
    }
}
