//! Routed delivery of durable messages, ephemeral signals, and control
//! events to the resolved set of live connections.

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tokio::task;
use tracing::{debug, warn};
use uuid::Uuid;

use courier_db::Database;
use courier_types::events::ServerEvent;
use courier_types::models::{ChatMessage, Identity, UnreadSummary};

use crate::error::GatewayError;
use crate::presence::{ConnectionSender, Departure, PresenceRegistry};
use crate::rooms::{self, Audience};

/// Mutations of already-stored messages. Authorization and the storage
/// write both happen before any fan-out.
#[derive(Debug, Clone)]
pub enum ControlEvent {
    Edit {
        id: Uuid,
        content: String,
        room_id: String,
    },
    Delete {
        id: Uuid,
        room_id: String,
    },
    Clear {
        room_id: String,
    },
}

/// Owns the presence registry and the message store handle; everything a
/// connection needs to talk to the rest of the system.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    db: Arc<Database>,
    presence: PresenceRegistry,
    /// The AI collaborator endpoint. Messages routed to the assistant room
    /// are forwarded here and to nobody else (besides the sender's echo).
    assistant: Option<mpsc::UnboundedSender<ChatMessage>>,
    /// Serializes persist+deliver so per-room delivery order equals
    /// persistence order.
    publish_seq: Mutex<()>,
}

impl Dispatcher {
    pub fn new(db: Arc<Database>) -> Self {
        Self::build(db, None)
    }

    /// Attach an assistant endpoint at construction time.
    pub fn with_assistant(db: Arc<Database>, assistant: mpsc::UnboundedSender<ChatMessage>) -> Self {
        Self::build(db, Some(assistant))
    }

    fn build(db: Arc<Database>, assistant: Option<mpsc::UnboundedSender<ChatMessage>>) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                db,
                presence: PresenceRegistry::new(),
                assistant,
                publish_seq: Mutex::new(()),
            }),
        }
    }

    // -- Presence passthroughs used by the connection lifecycle --

    pub async fn register_connection(
        &self,
        user_id: &str,
        connection_id: Uuid,
        sender: ConnectionSender,
    ) -> (Vec<String>, bool) {
        self.inner
            .presence
            .register(user_id, connection_id, sender)
            .await
    }

    pub async fn unregister_connection(&self, connection_id: Uuid) -> Option<Departure> {
        self.inner.presence.unregister(connection_id).await
    }

    pub async fn online_user_ids(&self) -> Vec<String> {
        self.inner.presence.online_user_ids().await
    }

    /// Deliver an event to every live connection.
    pub async fn broadcast(&self, event: &ServerEvent) {
        send_all(self.inner.presence.all_senders().await, event);
    }

    /// Deliver an event to every live connection except one. Used when the
    /// excluded connection already received its own snapshot.
    pub async fn broadcast_except(&self, event: &ServerEvent, connection_id: Uuid) {
        send_all(
            self.inner.presence.all_senders_except(connection_id).await,
            event,
        );
    }

    // -- Publishing --

    /// Persist a message, then fan it out to the resolved audience.
    ///
    /// Durability precedes fan-out: a message that fails to persist is
    /// never broadcast. The audience check runs first of all, so an
    /// unauthorized send touches neither storage nor other connections.
    pub async fn publish_durable(&self, message: ChatMessage) -> Result<ChatMessage, GatewayError> {
        let audience = rooms::resolve_audience(&message.room_id, &message.sender_id)?;

        let _ordering = self.inner.publish_seq.lock().await;

        let stored = message.clone();
        self.with_store(move |db| db.append_message(&stored)).await?;

        if audience == Audience::Assistant {
            match &self.inner.assistant {
                Some(assistant) => {
                    if assistant.send(message.clone()).is_err() {
                        warn!("Assistant endpoint closed; dropping forward");
                    }
                }
                None => debug!("No assistant endpoint attached"),
            }
        }

        self.deliver(
            &audience,
            &message.sender_id,
            false,
            &ServerEvent::NewMessage(message.clone()),
        )
        .await;

        Ok(message)
    }

    /// Relay a typing signal. No persistence; never echoed back to any of
    /// the sender's own connections.
    pub async fn publish_ephemeral(
        &self,
        user_id: &str,
        user_name: &str,
        room_id: &str,
        started: bool,
    ) -> Result<(), GatewayError> {
        let audience = rooms::resolve_audience(room_id, user_id)?;

        let event = if started {
            ServerEvent::UserTyping {
                user_id: user_id.to_string(),
                user_name: user_name.to_string(),
                room_id: room_id.to_string(),
            }
        } else {
            ServerEvent::UserStoppedTyping {
                user_id: user_id.to_string(),
                user_name: user_name.to_string(),
                room_id: room_id.to_string(),
            }
        };

        self.deliver(&audience, user_id, true, &event).await;
        Ok(())
    }

    /// Apply an edit/delete/clear, then notify the room's audience.
    pub async fn publish_control(
        &self,
        actor: &Identity,
        event: ControlEvent,
    ) -> Result<(), GatewayError> {
        match event {
            ControlEvent::Edit { id, content, room_id } => {
                let audience = rooms::resolve_audience(&room_id, &actor.user_id)?;
                let _ordering = self.inner.publish_seq.lock().await;

                self.authorize_message_action(actor, id, &room_id).await?;

                let (id_arg, content_arg) = (id.to_string(), content.clone());
                let touched = self
                    .with_store(move |db| db.update_message_content(&id_arg, &content_arg))
                    .await?;
                if touched == 0 {
                    return Err(GatewayError::NotFound(id));
                }

                self.deliver(
                    &audience,
                    &actor.user_id,
                    false,
                    &ServerEvent::MessageUpdated { id, content, room_id },
                )
                .await;
                Ok(())
            }

            ControlEvent::Delete { id, room_id } => {
                let audience = rooms::resolve_audience(&room_id, &actor.user_id)?;
                let _ordering = self.inner.publish_seq.lock().await;

                self.authorize_message_action(actor, id, &room_id).await?;

                let id_arg = id.to_string();
                let touched = self
                    .with_store(move |db| db.delete_message(&id_arg))
                    .await?;
                if touched == 0 {
                    return Err(GatewayError::NotFound(id));
                }

                self.deliver(
                    &audience,
                    &actor.user_id,
                    false,
                    &ServerEvent::MessageDeleted { id, room_id },
                )
                .await;
                Ok(())
            }

            ControlEvent::Clear { room_id } => {
                let audience = rooms::resolve_audience(&room_id, &actor.user_id)?;

                if audience == Audience::Global && !actor.is_admin {
                    return Err(GatewayError::Unauthorized(
                        "only an administrator may clear the shared room".into(),
                    ));
                }

                let _ordering = self.inner.publish_seq.lock().await;

                let room_arg = room_id.clone();
                if audience == Audience::Assistant {
                    // The assistant room is shared storage; only purge the
                    // caller's side of it.
                    let actor_arg = actor.user_id.clone();
                    self.with_store(move |db| {
                        db.delete_room_messages_by_sender(&room_arg, &actor_arg)
                    })
                    .await?;
                } else {
                    self.with_store(move |db| db.delete_room_messages(&room_arg))
                        .await?;
                }

                self.deliver(
                    &audience,
                    &actor.user_id,
                    false,
                    &ServerEvent::ChatCleared { room_id },
                )
                .await;
                Ok(())
            }
        }
    }

    // -- Storage passthroughs --

    /// Unread-DM reconciliation for a freshly joined connection.
    pub async fn unread_summary(&self, user_id: &str) -> Result<Vec<UnreadSummary>, GatewayError> {
        let user_arg = user_id.to_string();
        self.with_store(move |db| db.unread_summary_for(&user_arg))
            .await
    }

    /// Read receipt: entering a room marks the peer's messages as read.
    pub async fn mark_room_read(&self, room_id: &str, reader_id: &str) -> Result<(), GatewayError> {
        let (room_arg, reader_arg) = (room_id.to_string(), reader_id.to_string());
        self.with_store(move |db| db.mark_room_read(&room_arg, &reader_arg))
            .await?;
        Ok(())
    }

    pub async fn room_history(
        &self,
        room_id: &str,
        limit: u32,
    ) -> Result<Vec<ChatMessage>, GatewayError> {
        let room_arg = room_id.to_string();
        let rows = self
            .with_store(move |db| db.messages_by_room(&room_arg, limit))
            .await?;
        Ok(rows.into_iter().map(|row| row.into_message()).collect())
    }

    // -- Internals --

    /// Push one event to every connection in the audience. Delivery to a
    /// connection that closed mid-flight is a no-op, not an error.
    async fn deliver(
        &self,
        audience: &Audience,
        sender_id: &str,
        exclude_sender: bool,
        event: &ServerEvent,
    ) {
        let presence = &self.inner.presence;

        let targets: Vec<ConnectionSender> = match audience {
            Audience::Global => {
                if exclude_sender {
                    presence.all_senders_except_user(sender_id).await
                } else {
                    presence.all_senders().await
                }
            }
            Audience::Assistant => {
                if exclude_sender {
                    Vec::new()
                } else {
                    presence.connections_for(sender_id).await
                }
            }
            Audience::Direct([a, b]) => {
                let mut targets = Vec::new();
                for participant in [a, b] {
                    if exclude_sender && participant == sender_id {
                        continue;
                    }
                    targets.extend(presence.connections_for(participant).await);
                }
                targets
            }
        };

        send_all(targets, event);
    }

    /// Verify the actor may edit/delete the target message: it must exist,
    /// live in the claimed room, and be theirs (or the actor is an admin).
    async fn authorize_message_action(
        &self,
        actor: &Identity,
        id: Uuid,
        room_id: &str,
    ) -> Result<(), GatewayError> {
        let id_arg = id.to_string();
        let row = self
            .with_store(move |db| db.message_by_id(&id_arg))
            .await?
            .ok_or(GatewayError::NotFound(id))?;

        if row.room_id != room_id {
            return Err(GatewayError::Unauthorized(format!(
                "message {id} does not belong to room '{room_id}'"
            )));
        }
        if row.sender_id != actor.user_id && !actor.is_admin {
            return Err(GatewayError::Unauthorized(
                "only the sender or an administrator may modify a message".into(),
            ));
        }
        Ok(())
    }

    /// Run a blocking store operation off the async runtime.
    async fn with_store<T, F>(&self, f: F) -> Result<T, GatewayError>
    where
        F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.inner.db.clone();
        task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| GatewayError::Persistence(anyhow::anyhow!("storage task failed: {e}")))?
            .map_err(GatewayError::Persistence)
    }
}

fn send_all(targets: Vec<ConnectionSender>, event: &ServerEvent) {
    for target in targets {
        // A closed receiver means the connection is tearing down; the
        // unregister path cleans the registry up.
        let _ = target.send(event.clone());
    }
}
