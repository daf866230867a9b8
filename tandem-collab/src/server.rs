//! Multi-room relay server.
//!
//! ```text
//! Client A ──┐                        ┌──► operations router ──┐
//!            ├── reader task ── stamp ┤                        ├── room
//! Client B ──┘                        └──► sync router ────────┘ members
//! ```
//!
//! Each connection gets its own reader task. Readers never touch other
//! clients directly: everything funnels through two long-lived router
//! tasks — operations (`join`, `operation`, anything unexpected) and
//! sync (`docSync`, `users`) — which resolve the sender's room and fan
//! out through that room's client registry. The relay never inspects
//! operation payloads; convergence is the CRDT's job on each client.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use uuid::Uuid;

use crate::protocol::{Message, MessageKind, ProtocolError};
use crate::registry::Client;
use crate::rooms::{Room, RoomRegistry};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen address. A bare `:port` binds every interface.
    pub bind_addr: String,
    /// Bound on the WebSocket upgrade; reads within an established
    /// session are unbounded.
    pub handshake_timeout_secs: u64,
    /// Capacity of the router channels.
    pub channel_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: ":8084".to_owned(),
            handshake_timeout_secs: 120,
            channel_capacity: 256,
        }
    }
}

/// The relay server.
pub struct CollabServer {
    config: ServerConfig,
    rooms: Arc<RoomRegistry>,
    /// Monotonic site id allocator, shared by every connection handler.
    next_site_id: Arc<AtomicU64>,
}

impl CollabServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            rooms: Arc::new(RoomRegistry::new()),
            next_site_id: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn rooms(&self) -> &Arc<RoomRegistry> {
        &self.rooms
    }

    /// Bind and serve forever. Call from an async runtime.
    pub async fn run(&self) -> Result<(), ProtocolError> {
        let addr = normalize_addr(&self.config.bind_addr);
        let listener = TcpListener::bind(&addr).await?;
        log::info!("relay listening on {addr}");

        let (op_tx, op_rx) = mpsc::channel(self.config.channel_capacity);
        let (sync_tx, sync_rx) = mpsc::channel(self.config.channel_capacity);
        tokio::spawn(route_operations(
            op_rx,
            self.rooms.clone(),
            sync_tx.clone(),
        ));
        tokio::spawn(route_sync(sync_rx, self.rooms.clone()));

        loop {
            let (stream, peer) = listener.accept().await?;
            log::debug!("new tcp connection from {peer}");

            let rooms = self.rooms.clone();
            let next_site_id = self.next_site_id.clone();
            let op_tx = op_tx.clone();
            let sync_tx = sync_tx.clone();
            let handshake = Duration::from_secs(self.config.handshake_timeout_secs);

            tokio::spawn(async move {
                if let Err(e) =
                    handle_connection(stream, rooms, next_site_id, op_tx, sync_tx, handshake)
                        .await
                {
                    log::warn!("connection from {peer} ended: {e}");
                }
            });
        }
    }
}

/// A bare `:port` listen address means every interface.
fn normalize_addr(addr: &str) -> String {
    match addr.strip_prefix(':') {
        Some(port) => format!("0.0.0.0:{port}"),
        None => addr.to_owned(),
    }
}

/// Pull the `room` parameter out of a raw query string, decoding
/// percent-encoded names the way the connection URL encodes them.
fn room_from_query(query: &str) -> Option<String> {
    url::form_urlencoded::parse(query.as_bytes())
        .find_map(|(key, value)| (key == "room" && !value.is_empty()).then(|| value.into_owned()))
}

/// Upgrade one connection, register the client, seed its sync, then
/// pump its messages into the routers until the transport fails.
async fn handle_connection(
    stream: TcpStream,
    rooms: Arc<RoomRegistry>,
    next_site_id: Arc<AtomicU64>,
    op_tx: mpsc::Sender<Message>,
    sync_tx: mpsc::Sender<Message>,
    handshake: Duration,
) -> Result<(), ProtocolError> {
    // Capture the room name during the upgrade; a request without one is
    // rejected before the WebSocket is established.
    let mut room_name: Option<String> = None;
    let upgrade = accept_hdr_async(stream, |req: &Request, resp: Response| {
        match req.uri().query().and_then(room_from_query) {
            Some(name) => {
                room_name = Some(name);
                Ok(resp)
            }
            None => {
                let mut reject = ErrorResponse::new(Some("room name required".to_owned()));
                *reject.status_mut() = StatusCode::BAD_REQUEST;
                Err(reject)
            }
        }
    });
    let ws = timeout(handshake, upgrade)
        .await
        .map_err(|_| ProtocolError::HandshakeTimeout)??;
    let room_name = room_name.ok_or(ProtocolError::MissingRoom)?;

    let (room, created) = rooms.get_or_create(&room_name).await;
    if created {
        log::info!("created room {room_name}");
    }

    let client_id = Uuid::new_v4();
    let site_id = (next_site_id.fetch_add(1, Ordering::SeqCst) + 1).to_string();
    let (writer, mut reader) = ws.split();
    room.clients
        .add(Client::new(client_id, site_id.clone(), writer))
        .await;
    log::info!("client {client_id} joined room {room_name} as site {site_id}");

    // Seed the newcomer: its site id, a snapshot request to any existing
    // peer, and a fresh users list for the whole room.
    room.clients
        .broadcast_one(&Message::site_id(client_id, &site_id), client_id)
        .await;
    room.clients
        .broadcast_one_except(&Message::doc_req(client_id), client_id)
        .await;
    send_usernames(&room, &sync_tx).await;

    while let Some(frame) = reader.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("read failed for client {client_id}: {e}");
                break;
            }
        };
        let text = match frame {
            WsMessage::Text(text) => text,
            WsMessage::Close(_) => break,
            _ => continue,
        };

        let mut msg = match Message::decode(&text) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("protocol violation from client {client_id}: {e}");
                break;
            }
        };

        if msg.kind == MessageKind::DocSync {
            // Addressed frame: `id` already names the recipient.
            if sync_tx.send(msg).await.is_err() {
                break;
            }
        } else {
            msg.id = client_id;
            if op_tx.send(msg).await.is_err() {
                break;
            }
        }
    }

    log::info!("client {client_id} left room {room_name}");
    room.clients.delete(client_id).await;
    send_usernames(&room, &sync_tx).await;
    rooms.remove_if_empty(&room_name).await;
    Ok(())
}

/// Compose a `users` frame for the room and hand it to the sync router.
/// Skipped when the room has emptied out.
async fn send_usernames(room: &Room, sync_tx: &mpsc::Sender<Message>) {
    if let Some((member, names)) = room.clients.roster().await {
        let _ = sync_tx.send(Message::users(member, names.join(","))).await;
    }
}

/// Operations sink: everything except `docSync`, stamped with the
/// sender's id by the connection handler.
async fn route_operations(
    mut rx: mpsc::Receiver<Message>,
    rooms: Arc<RoomRegistry>,
    sync_tx: mpsc::Sender<Message>,
) {
    while let Some(msg) = rx.recv().await {
        let Some(room) = rooms.lookup_by_client(msg.id).await else {
            log::warn!(
                "dropping {:?} message from client {} with no room",
                msg.kind,
                msg.id
            );
            continue;
        };

        match msg.kind {
            MessageKind::Join => {
                room.clients
                    .update_name(msg.id, msg.username.clone())
                    .await;
                log::info!("{} joined room {}", msg.username, room.name);
                send_usernames(&room, &sync_tx).await;
                room.clients.broadcast_all_except(&msg, msg.id).await;
            }
            MessageKind::Operation => {
                log::debug!("routing operation from {} in room {}", msg.id, room.name);
                room.clients.broadcast_all_except(&msg, msg.id).await;
            }
            other => {
                log::warn!(
                    "unexpected {other:?} message from {} on the operations channel",
                    msg.id
                );
                send_usernames(&room, &sync_tx).await;
            }
        }
    }
}

/// Sync sink: `docSync` frames addressed to a single recipient, plus
/// room-wide `users` refreshes.
async fn route_sync(mut rx: mpsc::Receiver<Message>, rooms: Arc<RoomRegistry>) {
    while let Some(msg) = rx.recv().await {
        let Some(room) = rooms.lookup_by_client(msg.id).await else {
            log::warn!(
                "dropping {:?} message for client {} with no room",
                msg.kind,
                msg.id
            );
            continue;
        };

        match msg.kind {
            MessageKind::DocSync => {
                room.clients.broadcast_one(&msg, msg.id).await;
            }
            MessageKind::Users => {
                log::debug!("usernames in room {}: {}", room.name, msg.text);
                room.clients.broadcast_all(&msg).await;
            }
            other => {
                log::warn!("unexpected {other:?} message on the sync channel");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_addr_expands_bare_port() {
        assert_eq!(normalize_addr(":8084"), "0.0.0.0:8084");
        assert_eq!(normalize_addr("127.0.0.1:9000"), "127.0.0.1:9000");
    }

    #[test]
    fn test_room_from_query() {
        assert_eq!(room_from_query("room=notes"), Some("notes".to_owned()));
        assert_eq!(
            room_from_query("debug=1&room=notes"),
            Some("notes".to_owned())
        );
        assert_eq!(room_from_query("room="), None);
        assert_eq!(room_from_query("r=notes"), None);
        assert_eq!(room_from_query(""), None);
    }

    #[test]
    fn test_room_from_query_percent_decodes() {
        assert_eq!(
            room_from_query("room=my%20room"),
            Some("my room".to_owned())
        );
        // An encoded `&` inside the value is part of the name, not a
        // field separator.
        assert_eq!(room_from_query("room=a%26b"), Some("a&b".to_owned()));
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, ":8084");
        assert_eq!(config.handshake_timeout_secs, 120);
        assert_eq!(config.channel_capacity, 256);
    }

    #[test]
    fn test_server_creation() {
        let server = CollabServer::with_defaults();
        assert_eq!(server.bind_addr(), ":8084");
    }
}
