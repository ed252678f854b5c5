//! Local stand-in for the pickup chat backend.
//!
//! Speaks Socket.IO v4 over WebSocket on `/socket.io/` and serves stored history on
//! `GET /messages/{conversation}` from the same router. Rooms are keyed by conversation id;
//! every `sendMessage` is echoed to all members of the room, the sender included.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use kerbside_session::events::{
    JOIN_CHAT_EVENT, JoinChat, LEAVE_CHAT_EVENT, LeaveChat, MESSAGE_RECEIVED_EVENT,
    SEND_MESSAGE_EVENT, SendMessage, USER_JOINED_EVENT, USER_LEFT_EVENT,
};
use kerbside_transport::codec::{self, EnginePacket, Handshake, SocketPacket};
use serde_json::{Value, json};
use tokio::sync::mpsc;

const PING_INTERVAL: Duration = Duration::from_secs(25);
const PING_TIMEOUT: Duration = Duration::from_secs(20);

struct Member {
    client: u64,
    user_id: String,
    outgoing: mpsc::UnboundedSender<String>,
}

#[derive(Default)]
struct Room {
    members: Vec<Member>,
    history: Vec<Value>,
}

#[derive(Default)]
struct Rooms {
    rooms: Mutex<HashMap<String, Room>>,
    next_client: AtomicU64,
}

impl Rooms {
    fn join(&self, conversation: &str, member: Member, announce: &str) {
        let Ok(mut rooms) = self.rooms.lock() else {
            return;
        };
        let room = rooms.entry(conversation.to_string()).or_default();
        room.members.retain(|existing| existing.client != member.client);
        broadcast(room, announce);
        room.members.push(member);
    }

    fn leave(&self, conversation: &str, client: u64, reason: &str) {
        let Ok(mut rooms) = self.rooms.lock() else {
            return;
        };
        let Some(room) = rooms.get_mut(conversation) else {
            return;
        };
        let Some(index) = room
            .members
            .iter()
            .position(|member| member.client == client)
        else {
            return;
        };
        let member = room.members.remove(index);
        if let Some(frame) = event_frame(
            USER_LEFT_EVENT,
            json!({ "userId": member.user_id, "reason": reason }),
        ) {
            broadcast(room, &frame);
        }
    }

    fn leave_all(&self, client: u64, reason: &str) {
        let conversations = match self.rooms.lock() {
            Ok(rooms) => rooms
                .iter()
                .filter(|(_, room)| room.members.iter().any(|member| member.client == client))
                .map(|(conversation, _)| conversation.clone())
                .collect::<Vec<_>>(),
            Err(_) => return,
        };
        for conversation in conversations {
            self.leave(&conversation, client, reason);
        }
    }

    fn publish(&self, message: &SendMessage) {
        let Ok(mut rooms) = self.rooms.lock() else {
            return;
        };
        let room = rooms
            .entry(message.conversation_id.as_str().to_string())
            .or_default();
        let now = Utc::now().to_rfc3339();
        room.history.push(json!({
            "senderId": message.participant_id.as_str(),
            "firstName": message.display_name,
            "text": message.text,
            "createdAt": now,
        }));
        if let Some(frame) = event_frame(
            MESSAGE_RECEIVED_EVENT,
            json!({
                "firstName": message.display_name,
                "text": message.text,
                "userId": message.participant_id.as_str(),
                "timestamp": now,
            }),
        ) {
            broadcast(room, &frame);
        }
    }

    fn history(&self, conversation: &str) -> Vec<Value> {
        self.rooms
            .lock()
            .ok()
            .and_then(|rooms| rooms.get(conversation).map(|room| room.history.clone()))
            .unwrap_or_default()
    }
}

/// Sends `frame` to every member, pruning members whose connection is gone.
fn broadcast(room: &mut Room, frame: &str) {
    room.members
        .retain(|member| member.outgoing.send(frame.to_string()).is_ok());
}

fn event_frame(name: &str, payload: Value) -> Option<String> {
    codec::encode(&EnginePacket::Message(SocketPacket::event(name, payload))).ok()
}

/// Routes for the history endpoint and the Socket.IO upgrade, backed by fresh empty rooms.
pub fn router() -> Router {
    Router::new()
        .route("/messages/{conversation}", get(history_handler))
        .route("/socket.io/", get(socket_handler))
        .with_state(Arc::new(Rooms::default()))
}

async fn history_handler(
    State(rooms): State<Arc<Rooms>>,
    Path(conversation): Path<String>,
) -> Json<Value> {
    let data = rooms.history(&conversation);
    tracing::debug!(conversation = %conversation, rows = data.len(), "served history");
    Json(json!({ "success": true, "data": data }))
}

async fn socket_handler(ws: WebSocketUpgrade, State(rooms): State<Arc<Rooms>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_socket(socket, rooms))
}

async fn send_text(ws: &mut WebSocket, frame: String) -> bool {
    ws.send(Message::Text(frame.into())).await.is_ok()
}

async fn serve_socket(mut ws: WebSocket, rooms: Arc<Rooms>) {
    let client = rooms.next_client.fetch_add(1, Ordering::Relaxed);
    let sid = format!("mock-{client}");
    let open = EnginePacket::Open(Handshake {
        sid: sid.clone(),
        upgrades: Vec::new(),
        ping_interval: PING_INTERVAL.as_millis() as u64,
        ping_timeout: PING_TIMEOUT.as_millis() as u64,
        max_payload: Some(1_000_000),
    });
    let Ok(open) = codec::encode(&open) else {
        return;
    };
    if !send_text(&mut ws, open).await {
        return;
    }

    let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<String>();
    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.tick().await;
    tracing::info!(client, "client connected");

    loop {
        tokio::select! {
            _ = ping.tick() => {
                if !send_text(&mut ws, "2".to_string()).await {
                    break;
                }
            }
            outgoing = outgoing_rx.recv() => {
                let Some(frame) = outgoing else { break };
                if !send_text(&mut ws, frame).await {
                    break;
                }
            }
            incoming = ws.recv() => {
                let text = match incoming {
                    Some(Ok(Message::Text(text))) => text.as_str().to_string(),
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => continue,
                };
                let packet = match codec::decode(&text) {
                    Ok(packet) => packet,
                    Err(error) => {
                        tracing::warn!(client, error = %error, "dropping malformed frame");
                        continue;
                    }
                };
                match packet {
                    EnginePacket::Message(SocketPacket::Connect(_)) => {
                        let ack = EnginePacket::Message(SocketPacket::Connect(Some(json!({ "sid": sid }))));
                        let Ok(ack) = codec::encode(&ack) else { break };
                        if !send_text(&mut ws, ack).await {
                            break;
                        }
                    }
                    EnginePacket::Message(SocketPacket::Event { name, payload }) => {
                        on_event(&rooms, client, &outgoing_tx, &name, payload);
                    }
                    EnginePacket::Message(SocketPacket::Disconnect) | EnginePacket::Close => break,
                    _ => {}
                }
            }
        }
    }

    rooms.leave_all(client, "disconnected");
    tracing::info!(client, "client disconnected");
}

fn on_event(
    rooms: &Rooms,
    client: u64,
    outgoing: &mpsc::UnboundedSender<String>,
    name: &str,
    payload: Value,
) {
    match name {
        JOIN_CHAT_EVENT => {
            let Ok(join) = serde_json::from_value::<JoinChat>(payload) else {
                tracing::warn!(client, "malformed joinChat");
                return;
            };
            let Some(announce) = event_frame(
                USER_JOINED_EVENT,
                json!({ "userId": join.participant_id.as_str(), "firstName": join.display_name }),
            ) else {
                return;
            };
            tracing::info!(client, conversation = %join.conversation_id, "joined");
            rooms.join(
                join.conversation_id.as_str(),
                Member {
                    client,
                    user_id: join.participant_id.as_str().to_string(),
                    outgoing: outgoing.clone(),
                },
                &announce,
            );
        }
        LEAVE_CHAT_EVENT => {
            if let Ok(leave) = serde_json::from_value::<LeaveChat>(payload) {
                rooms.leave(leave.conversation_id.as_str(), client, "left");
            }
        }
        SEND_MESSAGE_EVENT => match serde_json::from_value::<SendMessage>(payload) {
            Ok(message) => rooms.publish(&message),
            Err(error) => tracing::warn!(client, error = %error, "malformed sendMessage"),
        },
        other => tracing::debug!(client, event = other, "ignoring event"),
    }
}
