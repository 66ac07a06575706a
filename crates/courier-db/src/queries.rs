use crate::Database;
use crate::models::MessageRow;
use anyhow::Result;
use chrono::SecondsFormat;
use rusqlite::Connection;

use courier_types::models::{ChatMessage, UnreadSummary};

impl Database {
    /// Append a message. Durability gate for the dispatcher: fan-out only
    /// happens after this returns Ok.
    pub fn append_message(&self, message: &ChatMessage) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO messages (id, room_id, sender_id, sender_name, content, is_read, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    message.id.to_string(),
                    message.room_id,
                    message.sender_id,
                    message.sender_name,
                    message.content,
                    message.is_read,
                    message.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true),
                ],
            )?;
            Ok(())
        })
    }

    /// Room history, oldest first.
    pub fn messages_by_room(&self, room_id: &str, limit: u32) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| query_messages(conn, room_id, limit))
    }

    pub fn message_by_id(&self, id: &str) -> Result<Option<MessageRow>> {
        self.with_conn(|conn| query_message_by_id(conn, id))
    }

    /// Mark everything in a room that was NOT sent by `excluding_sender_id`
    /// as read. Returns the number of rows touched.
    pub fn mark_room_read(&self, room_id: &str, excluding_sender_id: &str) -> Result<usize> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE messages SET is_read = 1
                 WHERE room_id = ?1 AND sender_id != ?2 AND is_read = 0",
                rusqlite::params![room_id, excluding_sender_id],
            )?;
            Ok(n)
        })
    }

    /// Returns the number of rows touched; 0 means the target is gone.
    pub fn update_message_content(&self, id: &str, content: &str) -> Result<usize> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE messages SET content = ?2 WHERE id = ?1",
                rusqlite::params![id, content],
            )?;
            Ok(n)
        })
    }

    pub fn delete_message(&self, id: &str) -> Result<usize> {
        self.with_conn(|conn| {
            let n = conn.execute("DELETE FROM messages WHERE id = ?1", [id])?;
            Ok(n)
        })
    }

    pub fn delete_room_messages(&self, room_id: &str) -> Result<usize> {
        self.with_conn(|conn| {
            let n = conn.execute("DELETE FROM messages WHERE room_id = ?1", [room_id])?;
            Ok(n)
        })
    }

    /// Purge only one sender's messages from a room. Used for the shared
    /// assistant room, where clearing must not touch other users' history.
    pub fn delete_room_messages_by_sender(&self, room_id: &str, sender_id: &str) -> Result<usize> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "DELETE FROM messages WHERE room_id = ?1 AND sender_id = ?2",
                rusqlite::params![room_id, sender_id],
            )?;
            Ok(n)
        })
    }

    /// Unread direct messages addressed to `user_id`, grouped by sender.
    ///
    /// A DM room id is the two participant ids joined with `_`, so every DM
    /// room involving the user is exactly `sender_id || '_' || user_id` or
    /// the reverse, so no LIKE scans are needed.
    pub fn unread_summary_for(&self, user_id: &str) -> Result<Vec<UnreadSummary>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT sender_name, COUNT(*) FROM messages
                 WHERE is_read = 0
                   AND sender_id != ?1
                   AND (room_id = sender_id || '_' || ?1
                        OR room_id = ?1 || '_' || sender_id)
                 GROUP BY sender_id, sender_name
                 ORDER BY MIN(created_at)",
            )?;

            let rows = stmt
                .query_map([user_id], |row| {
                    Ok(UnreadSummary {
                        sender_name: row.get(0)?,
                        count: row.get(1)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }
}

fn query_messages(conn: &Connection, room_id: &str, limit: u32) -> Result<Vec<MessageRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, room_id, sender_id, sender_name, content, is_read, created_at
         FROM messages
         WHERE room_id = ?1
         ORDER BY created_at ASC
         LIMIT ?2",
    )?;

    let rows = stmt
        .query_map(rusqlite::params![room_id, limit], map_message_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(rows)
}

fn query_message_by_id(conn: &Connection, id: &str) -> Result<Option<MessageRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, room_id, sender_id, sender_name, content, is_read, created_at
         FROM messages
         WHERE id = ?1",
    )?;

    let row = stmt.query_row([id], map_message_row).optional()?;

    Ok(row)
}

fn map_message_row(row: &rusqlite::Row<'_>) -> std::result::Result<MessageRow, rusqlite::Error> {
    Ok(MessageRow {
        id: row.get(0)?,
        room_id: row.get(1)?,
        sender_id: row.get(2)?,
        sender_name: row.get(3)?,
        content: row.get(4)?,
        is_read: row.get(5)?,
        created_at: row.get(6)?,
    })
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    fn msg(sender_id: &str, sender_name: &str, room_id: &str, content: &str, offset_secs: i64) -> ChatMessage {
        ChatMessage {
            id: Uuid::new_v4(),
            sender_id: sender_id.into(),
            sender_name: sender_name.into(),
            content: content.into(),
            room_id: room_id.into(),
            timestamp: Utc::now() + Duration::seconds(offset_secs),
            is_read: false,
        }
    }

    #[test]
    fn appended_messages_come_back_in_timestamp_order() {
        let db = Database::open_in_memory().unwrap();
        let second = msg("1", "alice", "global", "second", 10);
        let first = msg("2", "bob", "global", "first", 0);
        db.append_message(&second).unwrap();
        db.append_message(&first).unwrap();

        let rows = db.messages_by_room("global", 100).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].content, "first");
        assert_eq!(rows[1].content, "second");

        // Stored with microsecond precision, so compare at that granularity.
        let restored = rows.into_iter().next().unwrap().into_message();
        assert_eq!(restored.id, first.id);
        assert_eq!(
            restored.timestamp.timestamp_micros(),
            first.timestamp.timestamp_micros()
        );
    }

    #[test]
    fn mark_room_read_skips_the_readers_own_messages() {
        let db = Database::open_in_memory().unwrap();
        db.append_message(&msg("2", "bob", "1_2", "hey", 0)).unwrap();
        db.append_message(&msg("2", "bob", "1_2", "you there?", 1)).unwrap();
        db.append_message(&msg("1", "alice", "1_2", "yes", 2)).unwrap();

        let touched = db.mark_room_read("1_2", "1").unwrap();
        assert_eq!(touched, 2);

        // Alice's own message stays unread for bob's side of the ledger.
        let rows = db.messages_by_room("1_2", 100).unwrap();
        assert!(rows.iter().filter(|r| r.sender_id == "2").all(|r| r.is_read));
        assert!(rows.iter().filter(|r| r.sender_id == "1").all(|r| !r.is_read));
    }

    #[test]
    fn unread_summary_groups_direct_messages_by_sender() {
        let db = Database::open_in_memory().unwrap();
        // Two from bob, one from carol, addressed to alice ("1").
        db.append_message(&msg("2", "bob", "1_2", "a", 0)).unwrap();
        db.append_message(&msg("2", "bob", "1_2", "b", 1)).unwrap();
        db.append_message(&msg("3", "carol", "1_3", "c", 2)).unwrap();
        // Noise that must not count: alice's own DM, and a global message.
        db.append_message(&msg("1", "alice", "1_2", "d", 3)).unwrap();
        db.append_message(&msg("2", "bob", "global", "e", 4)).unwrap();

        let summary = db.unread_summary_for("1").unwrap();
        assert_eq!(
            summary,
            vec![
                UnreadSummary { sender_name: "bob".into(), count: 2 },
                UnreadSummary { sender_name: "carol".into(), count: 1 },
            ]
        );
    }

    #[test]
    fn edit_and_delete_report_touched_rows() {
        let db = Database::open_in_memory().unwrap();
        let m = msg("1", "alice", "global", "tpyo", 0);
        db.append_message(&m).unwrap();

        let id = m.id.to_string();
        assert_eq!(db.update_message_content(&id, "typo").unwrap(), 1);
        let row = db.message_by_id(&id).unwrap().unwrap();
        assert_eq!(row.content, "typo");

        assert_eq!(db.delete_message(&id).unwrap(), 1);
        assert!(db.message_by_id(&id).unwrap().is_none());
        assert_eq!(db.delete_message(&id).unwrap(), 0);
    }

    #[test]
    fn clearing_the_assistant_room_only_touches_one_sender() {
        let db = Database::open_in_memory().unwrap();
        db.append_message(&msg("1", "alice", "ai", "mine", 0)).unwrap();
        db.append_message(&msg("2", "bob", "ai", "his", 1)).unwrap();

        assert_eq!(db.delete_room_messages_by_sender("ai", "1").unwrap(), 1);
        let rows = db.messages_by_room("ai", 100).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].sender_id, "2");

        assert_eq!(db.delete_room_messages("ai").unwrap(), 1);
        assert!(db.messages_by_room("ai", 100).unwrap().is_empty());
    }
}
