//! Actor-per-connection lifecycle: handshake, session loop, teardown.
//!
//! A connection moves through Connecting (awaiting `join`), Joined/Active
//! (command loop), and Disconnected (transport close or protocol error).
//! Each connection is its own failure domain: a bad command produces an
//! `error` event for that client and nothing else.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use chrono::Utc;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until, timeout};
use tracing::{debug, info, warn};
use uuid::Uuid;

use courier_types::events::{ClientCommand, ServerEvent};
use courier_types::models::{ChatMessage, Identity};

use crate::dispatcher::{ControlEvent, Dispatcher};
use crate::error::GatewayError;
use crate::presence::ConnectionSender;
use crate::rooms::{self, GLOBAL_ROOM};

/// How long a fresh connection may sit without sending `join`.
const JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// A typing signal with no explicit stop expires on the sender's behalf.
const TYPING_TTL: Duration = Duration::from_secs(6);

/// Per-connection session state once joined.
struct Session {
    /// The active room. `global` additionally stays a standing
    /// subscription for presence and shared broadcasts.
    room: String,
    /// Room the user is currently typing in, with its expiry deadline.
    typing: Option<(String, Instant)>,
}

/// Handle one authenticated WebSocket for its whole lifetime. The identity
/// was verified at the HTTP upgrade; the first frame must still be a
/// matching `join` before anything else is processed.
pub async fn handle_connection(socket: WebSocket, dispatcher: Dispatcher, identity: Identity) {
    let (mut sender, mut receiver) = socket.split();

    if !rooms::is_valid_user_id(&identity.user_id) {
        warn!(user_id = %identity.user_id, "Rejecting identity that collides with room grammar");
        send_direct(
            &mut sender,
            &ServerEvent::Error {
                message: format!("invalid user id '{}'", identity.user_id),
            },
        )
        .await;
        return;
    }

    // Connecting -> Joined
    let requested_room = match wait_for_join(&mut receiver, &identity).await {
        Ok(room) => room,
        Err(e) => {
            warn!(user_id = %identity.user_id, error = %e, "Handshake failed");
            send_direct(&mut sender, &ServerEvent::Error { message: e.to_string() }).await;
            return;
        }
    };

    info!(
        "{} ({}) joined the gateway",
        identity.display_name, identity.user_id
    );

    run_session(sender, receiver, dispatcher, identity, requested_room).await;
}

async fn run_session(
    sender: SplitSink<WebSocket, Message>,
    receiver: SplitStream<WebSocket>,
    dispatcher: Dispatcher,
    identity: Identity,
    requested_room: Option<String>,
) {
    let connection_id = Uuid::new_v4();
    let (tx, rx) = mpsc::unbounded_channel::<ServerEvent>();

    let (online, newly_online) = dispatcher
        .register_connection(&identity.user_id, connection_id, tx.clone())
        .await;

    // The new connection gets its snapshot; everyone else only hears about
    // an actual offline->online transition.
    let _ = tx.send(ServerEvent::ActiveUsers(online.clone()));
    if newly_online {
        dispatcher
            .broadcast_except(&ServerEvent::ActiveUsers(online), connection_id)
            .await;
    }

    // One-shot unread-DM reconciliation; never re-fires after join.
    match dispatcher.unread_summary(&identity.user_id).await {
        Ok(summary) if !summary.is_empty() => {
            let _ = tx.send(ServerEvent::OfflineMessages(summary));
        }
        Ok(_) => {}
        Err(e) => {
            warn!(user_id = %identity.user_id, error = %e, "Unread summary failed");
        }
    }

    // Subscribe to the requested room, falling back to the shared room when
    // the membership check fails.
    let initial_room = match requested_room {
        Some(room) => match rooms::resolve_audience(&room, &identity.user_id) {
            Ok(_) => room,
            Err(e) => {
                let _ = tx.send(ServerEvent::Error { message: e.to_string() });
                GLOBAL_ROOM.to_string()
            }
        },
        None => GLOBAL_ROOM.to_string(),
    };

    let pong_received = Arc::new(AtomicBool::new(true));

    let mut send_task = tokio::spawn(send_loop(sender, rx, pong_received.clone()));
    let mut recv_task = tokio::spawn(recv_loop(
        receiver,
        dispatcher.clone(),
        identity.clone(),
        tx.clone(),
        initial_room,
        pong_received,
    ));

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    // Any state -> Disconnected.
    if let Some(departure) = dispatcher.unregister_connection(connection_id).await {
        if departure.went_offline {
            let online = dispatcher.online_user_ids().await;
            dispatcher.broadcast(&ServerEvent::ActiveUsers(online)).await;
        }
    }

    info!(
        "{} ({}) disconnected from the gateway",
        identity.display_name, identity.user_id
    );
}

/// Wait for the `join` command that completes the handshake. Returns the
/// requested initial room, if any.
async fn wait_for_join(
    receiver: &mut SplitStream<WebSocket>,
    identity: &Identity,
) -> Result<Option<String>, GatewayError> {
    let handshake = timeout(JOIN_TIMEOUT, async {
        while let Some(Ok(msg)) = receiver.next().await {
            let Message::Text(text) = msg else {
                // Control frames are fine while connecting.
                continue;
            };

            return match serde_json::from_str::<ClientCommand>(&text) {
                Ok(ClientCommand::Join { user_id, name, room_id }) => {
                    if user_id != identity.user_id {
                        return Err(GatewayError::Unauthorized(
                            "join identity does not match the authenticated session".into(),
                        ));
                    }
                    debug!(user_id = %user_id, name = %name, "Join received");
                    Ok(room_id)
                }
                Ok(other) => Err(GatewayError::Protocol(format!(
                    "expected join, got {other:?}"
                ))),
                Err(e) => Err(GatewayError::Protocol(format!("malformed event: {e}"))),
            };
        }
        Err(GatewayError::Protocol("connection closed before join".into()))
    })
    .await;

    match handshake {
        Ok(result) => result,
        Err(_) => Err(GatewayError::Protocol("join timeout".into())),
    }
}

/// Writer half: forwards queued events to the socket and drives the
/// heartbeat.
async fn send_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<ServerEvent>,
    pong_received: Arc<AtomicBool>,
) {
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await;
    let mut missed_heartbeats: u8 = 0;

    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else { break };
                let text = serde_json::to_string(&event).unwrap();
                if sender.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            _ = heartbeat.tick() => {
                if pong_received.swap(false, Ordering::Acquire) {
                    missed_heartbeats = 0;
                } else {
                    missed_heartbeats += 1;
                    if missed_heartbeats >= 2 {
                        warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                        break;
                    }
                }
                if sender.send(Message::Ping(vec![].into())).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Reader half: the Joined/Active command loop.
async fn recv_loop(
    mut receiver: SplitStream<WebSocket>,
    dispatcher: Dispatcher,
    identity: Identity,
    tx: ConnectionSender,
    initial_room: String,
    pong_received: Arc<AtomicBool>,
) {
    let mut session = Session {
        room: initial_room,
        typing: None,
    };

    loop {
        // Absolute deadline: unaffected by unrelated traffic restarting the
        // select.
        let typing_deadline = session.typing.as_ref().map(|(_, deadline)| *deadline);

        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientCommand>(&text) {
                            Ok(ClientCommand::Disconnect) => break,
                            Ok(cmd) => {
                                if let Err(e) = handle_command(&dispatcher, &identity, &mut session, cmd).await {
                                    warn!(
                                        "{} ({}) command failed: {}",
                                        identity.display_name, identity.user_id, e
                                    );
                                    let _ = tx.send(ServerEvent::Error { message: e.to_string() });
                                }
                            }
                            Err(e) => {
                                warn!(
                                    "{} ({}) bad command: {} -- raw: {}",
                                    identity.display_name,
                                    identity.user_id,
                                    e,
                                    &text[..text.len().min(200)]
                                );
                                let _ = tx.send(ServerEvent::Error {
                                    message: format!("malformed event: {e}"),
                                });
                            }
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        pong_received.store(true, Ordering::Release);
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(user_id = %identity.user_id, error = %e, "WebSocket receive error");
                        break;
                    }
                }
            }
            _ = maybe_deadline(typing_deadline) => {
                if let Some((room, _)) = session.typing.take() {
                    let _ = dispatcher
                        .publish_ephemeral(&identity.user_id, &identity.display_name, &room, false)
                        .await;
                }
            }
        }
    }

    // Don't leave a dangling typing indicator behind on disconnect.
    if let Some((room, _)) = session.typing.take() {
        let _ = dispatcher
            .publish_ephemeral(&identity.user_id, &identity.display_name, &room, false)
            .await;
    }
}

async fn handle_command(
    dispatcher: &Dispatcher,
    identity: &Identity,
    session: &mut Session,
    cmd: ClientCommand,
) -> Result<(), GatewayError> {
    match cmd {
        ClientCommand::Join { .. } => Err(GatewayError::Protocol("already joined".into())),

        // Handled by the caller before dispatch.
        ClientCommand::Disconnect => Ok(()),

        ClientCommand::SendMessage {
            sender_id,
            sender_name: _,
            content,
            room_id,
        } => {
            // Clients cannot speak for anyone else; the stored name is the
            // authenticated one, not whatever the payload claims.
            if sender_id != identity.user_id {
                return Err(GatewayError::Unauthorized(
                    "sender does not match the authenticated identity".into(),
                ));
            }

            let message = ChatMessage {
                id: Uuid::new_v4(),
                sender_id,
                sender_name: identity.display_name.clone(),
                content,
                room_id,
                timestamp: Utc::now(),
                is_read: false,
            };
            dispatcher.publish_durable(message).await?;
            Ok(())
        }

        ClientCommand::SwitchRoom(room_id) => {
            // Membership is checked here AND again on every send.
            rooms::resolve_audience(&room_id, &identity.user_id)?;

            // Entering a DM room consumes its unread backlog.
            if rooms::parse_dm_room_id(&room_id).is_some() {
                dispatcher.mark_room_read(&room_id, &identity.user_id).await?;
            }

            debug!(
                user_id = %identity.user_id,
                from = %session.room,
                to = %room_id,
                "Room switched"
            );
            session.room = room_id;
            Ok(())
        }

        ClientCommand::Typing { room_id } => {
            dispatcher
                .publish_ephemeral(&identity.user_id, &identity.display_name, &room_id, true)
                .await?;
            session.typing = Some((room_id, Instant::now() + TYPING_TTL));
            Ok(())
        }

        ClientCommand::StopTyping { room_id } => {
            session.typing = None;
            dispatcher
                .publish_ephemeral(&identity.user_id, &identity.display_name, &room_id, false)
                .await
        }

        ClientCommand::EditMessage { id, content, room_id } => {
            dispatcher
                .publish_control(identity, ControlEvent::Edit { id, content, room_id })
                .await
        }

        ClientCommand::DeleteMessage { id, room_id } => {
            dispatcher
                .publish_control(identity, ControlEvent::Delete { id, room_id })
                .await
        }

        ClientCommand::ClearChat { room_id } => {
            dispatcher
                .publish_control(identity, ControlEvent::Clear { room_id })
                .await
        }
    }
}

/// Sleep until the deadline, or forever when there is none.
async fn maybe_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Send one event straight to the sink, for errors raised before the
/// connection is registered.
async fn send_direct(sender: &mut SplitSink<WebSocket, Message>, event: &ServerEvent) {
    let text = serde_json::to_string(event).unwrap();
    let _ = sender.send(Message::Text(text.into())).await;
}
