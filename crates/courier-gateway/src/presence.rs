//! Live-connection registry: the single piece of shared mutable state.
//!
//! One map, one lock, no I/O while holding it. A user may hold several
//! simultaneous connections (multiple devices/tabs); they go offline only
//! when the last one closes.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{RwLock, mpsc};
use tracing::debug;
use uuid::Uuid;

use courier_types::events::ServerEvent;

/// Sender half of a connection's delivery channel. Anything holding a clone
/// can push events to that client.
pub type ConnectionSender = mpsc::UnboundedSender<ServerEvent>;

struct ConnectionEntry {
    connection_id: Uuid,
    sender: ConnectionSender,
}

/// What `unregister` observed.
#[derive(Debug)]
pub struct Departure {
    pub user_id: String,
    /// True if this was the user's last live connection.
    pub went_offline: bool,
}

#[derive(Clone, Default)]
pub struct PresenceRegistry {
    inner: Arc<RwLock<HashMap<String, Vec<ConnectionEntry>>>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection under a user. Idempotent for a repeated
    /// (user, connection) pair. Returns the updated online-user list and
    /// whether the user just transitioned from offline to online.
    pub async fn register(
        &self,
        user_id: &str,
        connection_id: Uuid,
        sender: ConnectionSender,
    ) -> (Vec<String>, bool) {
        let mut map = self.inner.write().await;
        let newly_online = !map.contains_key(user_id);

        let entries = map.entry(user_id.to_string()).or_default();
        if !entries.iter().any(|e| e.connection_id == connection_id) {
            entries.push(ConnectionEntry {
                connection_id,
                sender,
            });
        }

        debug!(
            user_id = %user_id,
            connections = entries.len(),
            "Connection registered"
        );

        (sorted_ids(&map), newly_online)
    }

    /// Remove a connection wherever it is registered. Returns `None` for an
    /// unknown connection id.
    pub async fn unregister(&self, connection_id: Uuid) -> Option<Departure> {
        let mut map = self.inner.write().await;

        let user_id = map.iter().find_map(|(uid, entries)| {
            entries
                .iter()
                .any(|e| e.connection_id == connection_id)
                .then(|| uid.clone())
        })?;

        let entries = map.get_mut(&user_id)?;
        entries.retain(|e| e.connection_id != connection_id);
        let went_offline = entries.is_empty();
        if went_offline {
            map.remove(&user_id);
        }

        debug!(user_id = %user_id, went_offline, "Connection unregistered");

        Some(Departure {
            user_id,
            went_offline,
        })
    }

    /// Delivery handles for one user. Empty if offline.
    pub async fn connections_for(&self, user_id: &str) -> Vec<ConnectionSender> {
        let map = self.inner.read().await;
        map.get(user_id)
            .map(|entries| entries.iter().map(|e| e.sender.clone()).collect())
            .unwrap_or_default()
    }

    pub async fn online_user_ids(&self) -> Vec<String> {
        let map = self.inner.read().await;
        sorted_ids(&map)
    }

    /// Every live connection's delivery handle.
    pub async fn all_senders(&self) -> Vec<ConnectionSender> {
        let map = self.inner.read().await;
        map.values()
            .flat_map(|entries| entries.iter().map(|e| e.sender.clone()))
            .collect()
    }

    /// Every live connection except one. Used for presence broadcasts where
    /// the new connection already received its own snapshot.
    pub async fn all_senders_except(&self, connection_id: Uuid) -> Vec<ConnectionSender> {
        let map = self.inner.read().await;
        map.values()
            .flat_map(|entries| entries.iter())
            .filter(|e| e.connection_id != connection_id)
            .map(|e| e.sender.clone())
            .collect()
    }

    /// Every live connection not owned by `user_id`. Used for ephemeral
    /// signals, which must never echo back to their sender.
    pub async fn all_senders_except_user(&self, user_id: &str) -> Vec<ConnectionSender> {
        let map = self.inner.read().await;
        map.iter()
            .filter(|(uid, _)| uid.as_str() != user_id)
            .flat_map(|(_, entries)| entries.iter().map(|e| e.sender.clone()))
            .collect()
    }
}

fn sorted_ids(map: &HashMap<String, Vec<ConnectionEntry>>) -> Vec<String> {
    let mut ids: Vec<String> = map.keys().cloned().collect();
    ids.sort();
    ids
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sender() -> ConnectionSender {
        mpsc::unbounded_channel().0
    }

    #[tokio::test]
    async fn user_stays_online_until_the_last_connection_closes() {
        let registry = PresenceRegistry::new();
        let (conn1, conn2) = (Uuid::new_v4(), Uuid::new_v4());

        let (online, newly) = registry.register("u", conn1, sender()).await;
        assert_eq!(online, vec!["u".to_string()]);
        assert!(newly);

        // Second device: no offline->online transition.
        let (_, newly) = registry.register("u", conn2, sender()).await;
        assert!(!newly);

        let departure = registry.unregister(conn1).await.unwrap();
        assert!(!departure.went_offline);
        assert_eq!(registry.online_user_ids().await, vec!["u".to_string()]);

        let departure = registry.unregister(conn2).await.unwrap();
        assert!(departure.went_offline);
        assert!(registry.online_user_ids().await.is_empty());
        assert!(registry.connections_for("u").await.is_empty());
    }

    #[tokio::test]
    async fn register_is_idempotent_per_connection() {
        let registry = PresenceRegistry::new();
        let conn = Uuid::new_v4();

        registry.register("u", conn, sender()).await;
        registry.register("u", conn, sender()).await;

        assert_eq!(registry.connections_for("u").await.len(), 1);
        // One unregister fully removes the user.
        assert!(registry.unregister(conn).await.unwrap().went_offline);
        assert!(registry.unregister(conn).await.is_none());
    }

    #[tokio::test]
    async fn exclusion_helpers_scope_by_connection_and_by_user() {
        let registry = PresenceRegistry::new();
        let (a1, a2, b1) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        registry.register("a", a1, sender()).await;
        registry.register("a", a2, sender()).await;
        registry.register("b", b1, sender()).await;

        assert_eq!(registry.all_senders().await.len(), 3);
        assert_eq!(registry.all_senders_except(a1).await.len(), 2);
        assert_eq!(registry.all_senders_except_user("a").await.len(), 1);
    }
}
