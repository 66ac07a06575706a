//! Room identifiers and audience resolution.
//!
//! Stateless and pure. Membership is re-checked on every inbound event
//! rather than trusted from a prior join: room routing is the security
//! boundary and the transport enforces nothing.

use crate::error::GatewayError;

/// The shared room every connection is permanently subscribed to.
pub const GLOBAL_ROOM: &str = "global";

/// The assistant channel. Never fans out to other humans.
pub const AI_ROOM: &str = "ai";

/// Resolved recipient set for an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Audience {
    /// Every currently online connection.
    Global,
    /// The assistant endpoint, plus the sender's own connections.
    Assistant,
    /// Exactly the two participants embedded in the room id.
    Direct([String; 2]),
}

/// Canonical direct-room id for an unordered pair of users: the two ids
/// sorted lexicographically and joined with `_`. Deterministic regardless
/// of who initiates.
pub fn canonical_dm_room_id(a: &str, b: &str) -> String {
    if a <= b {
        format!("{a}_{b}")
    } else {
        format!("{b}_{a}")
    }
}

/// Defensive parser for direct-room ids. Returns the two participant ids,
/// or `None` for anything that does not split into exactly two non-empty
/// tokens.
pub fn parse_dm_room_id(room_id: &str) -> Option<(&str, &str)> {
    let mut parts = room_id.split('_');
    let (a, b) = (parts.next()?, parts.next()?);
    if parts.next().is_some() || a.is_empty() || b.is_empty() {
        return None;
    }
    Some((a, b))
}

/// User ids become room-id tokens, so the DM separator and the reserved
/// room names are off limits.
pub fn is_valid_user_id(user_id: &str) -> bool {
    !user_id.is_empty()
        && !user_id.contains('_')
        && user_id != GLOBAL_ROOM
        && user_id != AI_ROOM
}

/// Decide who may see an event in `room_id`, and whether `sender_id` may
/// post there at all.
pub fn resolve_audience(room_id: &str, sender_id: &str) -> Result<Audience, GatewayError> {
    match room_id {
        GLOBAL_ROOM => Ok(Audience::Global),
        AI_ROOM => Ok(Audience::Assistant),
        _ => {
            let (a, b) = parse_dm_room_id(room_id).ok_or_else(|| {
                GatewayError::Unauthorized(format!("malformed room id '{room_id}'"))
            })?;
            if sender_id != a && sender_id != b {
                return Err(GatewayError::Unauthorized(format!(
                    "'{sender_id}' is not a participant of '{room_id}'"
                )));
            }
            Ok(Audience::Direct([a.to_string(), b.to_string()]))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_id_is_symmetric() {
        assert_eq!(canonical_dm_room_id("1", "2"), "1_2");
        assert_eq!(canonical_dm_room_id("2", "1"), "1_2");
        // Lexicographic, not numeric.
        assert_eq!(canonical_dm_room_id("10", "9"), "10_9");
    }

    #[test]
    fn parser_rejects_malformed_ids() {
        assert_eq!(parse_dm_room_id("1_2"), Some(("1", "2")));
        assert!(parse_dm_room_id("1").is_none());
        assert!(parse_dm_room_id("1_2_3").is_none());
        assert!(parse_dm_room_id("_2").is_none());
        assert!(parse_dm_room_id("1_").is_none());
        assert!(parse_dm_room_id("").is_none());
    }

    #[test]
    fn reserved_rooms_admit_any_sender() {
        assert_eq!(resolve_audience("global", "anyone").unwrap(), Audience::Global);
        assert_eq!(resolve_audience("ai", "anyone").unwrap(), Audience::Assistant);
    }

    #[test]
    fn direct_room_requires_the_sender_to_be_embedded() {
        let audience = resolve_audience("1_2", "1").unwrap();
        assert_eq!(audience, Audience::Direct(["1".into(), "2".into()]));

        // Sender "3" attempting to post to "1_2".
        assert!(matches!(
            resolve_audience("1_2", "3"),
            Err(GatewayError::Unauthorized(_))
        ));
        assert!(matches!(
            resolve_audience("not_a_room_at_all", "not"),
            Err(GatewayError::Unauthorized(_))
        ));
    }

    #[test]
    fn user_ids_cannot_collide_with_room_grammar() {
        assert!(is_valid_user_id("7"));
        assert!(is_valid_user_id("alice"));
        assert!(!is_valid_user_id(""));
        assert!(!is_valid_user_id("a_b"));
        assert!(!is_valid_user_id("global"));
        assert!(!is_valid_user_id("ai"));
    }
}
