//! WebSocket sync client.
//!
//! Owns a [`Replica`] of the shared document and the protocol reflexes
//! around it: a `siteID` frame seeds the replica's identity, a `docReq`
//! is answered with a snapshot addressed to the requesting newcomer, a
//! `docSync` replaces local state, and inbound `operation` frames are
//! integrated as they arrive. Local edits mutate the replica first and
//! then emit the operation to the relay.
//!
//! The editor front-end stays decoupled: it calls [`CollabClient::insert`]
//! and [`CollabClient::delete`] and watches the event stream.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use tandem_crdt::{snapshot, CrdtError, Document, Replica};

use crate::protocol::{Message, MessageKind, ProtocolError};

/// Bound on the WebSocket upgrade, matching the relay's.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(120);

/// Connection options.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Relay network address, `host:port`.
    pub server: String,
    /// Use `wss://` instead of `ws://`.
    pub secure: bool,
    /// Room to join; empty selects `"default"`.
    pub room: String,
    /// Name announced to the room after connecting; empty skips the
    /// announcement.
    pub username: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: "localhost:8084".to_owned(),
            secure: false,
            room: String::new(),
            username: String::new(),
        }
    }
}

/// Events surfaced to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// The relay assigned this client its site id.
    SiteIdAssigned(u64),
    /// A peer's snapshot replaced the local document.
    DocSynced,
    /// A remote operation was integrated.
    RemoteEdit,
    /// The room's current usernames.
    Users(Vec<String>),
    /// A peer announced itself.
    PeerJoined(String),
    /// The transport is gone.
    Disconnected,
}

#[derive(Error, Debug)]
pub enum ClientError {
    #[error(transparent)]
    Crdt(#[from] CrdtError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// A connected participant: replica plus transport.
pub struct CollabClient {
    config: ClientConfig,
    replica: Arc<Mutex<Replica>>,
    outgoing: Option<mpsc::Sender<Message>>,
    event_tx: mpsc::Sender<ClientEvent>,
    event_rx: Option<mpsc::Receiver<ClientEvent>>,
}

impl CollabClient {
    pub fn new(config: ClientConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            config,
            replica: Arc::new(Mutex::new(Replica::new(0))),
            outgoing: None,
            event_tx,
            event_rx: Some(event_rx),
        }
    }

    /// Take the event receiver (can only be taken once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    /// Connect to the relay and spawn the reader and writer tasks.
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        let scheme = if self.config.secure { "wss" } else { "ws" };
        let room = if self.config.room.is_empty() {
            "default"
        } else {
            self.config.room.as_str()
        };
        let url = format!("{scheme}://{}/?room={room}", self.config.server);
        log::debug!("connecting to {url}");

        let (ws, _) = timeout(HANDSHAKE_TIMEOUT, connect_async(url.as_str()))
            .await
            .map_err(|_| ProtocolError::HandshakeTimeout)?
            .map_err(ProtocolError::from)?;
        let (mut writer, mut reader) = ws.split();

        // Writer task: the single owner of the outbound half.
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(256);
        self.outgoing = Some(out_tx.clone());
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let frame = match msg.encode() {
                    Ok(frame) => frame,
                    Err(e) => {
                        log::error!("failed to encode outbound frame: {e}");
                        continue;
                    }
                };
                if writer.send(WsMessage::Text(frame.into())).await.is_err() {
                    break;
                }
            }
        });

        if !self.config.username.is_empty() {
            let _ = out_tx.send(Message::join(&self.config.username)).await;
        }

        // Reader task: protocol reflexes plus application events.
        let replica = self.replica.clone();
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            while let Some(frame) = reader.next().await {
                let text = match frame {
                    Ok(WsMessage::Text(text)) => text,
                    Ok(WsMessage::Close(_)) | Err(_) => break,
                    _ => continue,
                };
                let msg = match Message::decode(&text) {
                    Ok(msg) => msg,
                    Err(e) => {
                        log::warn!("ignoring malformed frame: {e}");
                        continue;
                    }
                };
                handle_frame(msg, &replica, &out_tx, &event_tx).await;
            }
            let _ = event_tx.send(ClientEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Insert `value` as the `pos`-th visible character (1-based) and
    /// replicate the edit.
    pub async fn insert(&self, pos: usize, value: char) -> Result<(), ClientError> {
        let op = self.replica.lock().await.local_insert(pos, value)?;
        self.send(Message::operation(op)).await
    }

    /// Delete the `pos`-th visible character (1-based) and replicate.
    pub async fn delete(&self, pos: usize) -> Result<(), ClientError> {
        let op = self.replica.lock().await.local_delete(pos)?;
        self.send(Message::operation(op)).await
    }

    /// The current user-facing text.
    pub async fn content(&self) -> String {
        self.replica.lock().await.content()
    }

    /// The site id the relay assigned; 0 until the `siteID` frame lands.
    pub async fn site_id(&self) -> u64 {
        self.replica.lock().await.site_id()
    }

    /// A copy of the current document, e.g. for saving to disk.
    pub async fn document(&self) -> Document {
        self.replica.lock().await.document().clone()
    }

    async fn send(&self, msg: Message) -> Result<(), ClientError> {
        let tx = self
            .outgoing
            .as_ref()
            .ok_or(ProtocolError::NotConnected)?;
        tx.send(msg)
            .await
            .map_err(|_| ProtocolError::NotConnected)?;
        Ok(())
    }
}

/// React to one inbound frame.
async fn handle_frame(
    msg: Message,
    replica: &Arc<Mutex<Replica>>,
    out_tx: &mpsc::Sender<Message>,
    event_tx: &mpsc::Sender<ClientEvent>,
) {
    match msg.kind {
        MessageKind::SiteId => match msg.text.parse::<u64>() {
            Ok(site) => {
                replica.lock().await.set_site_id(site);
                let _ = event_tx.send(ClientEvent::SiteIdAssigned(site)).await;
            }
            Err(_) => log::warn!("unparseable site id {:?}", msg.text),
        },
        MessageKind::DocReq => {
            // A newcomer needs the document; answer with a snapshot
            // addressed back to them.
            let encoded = {
                let replica = replica.lock().await;
                snapshot::save(replica.document())
                    .ok()
                    .and_then(|bytes| String::from_utf8(bytes).ok())
            };
            match encoded {
                Some(text) => {
                    let _ = out_tx.send(Message::doc_sync(msg.id, text)).await;
                }
                None => log::error!("failed to encode snapshot for newcomer {}", msg.id),
            }
        }
        MessageKind::DocSync => match snapshot::load(msg.text.as_bytes()) {
            Ok(doc) => {
                let adopted = replica.lock().await.adopt(doc);
                match adopted {
                    Ok(()) => {
                        let _ = event_tx.send(ClientEvent::DocSynced).await;
                    }
                    Err(e) => log::error!("failed to adopt snapshot: {e}"),
                }
            }
            Err(e) => log::warn!("discarding bad snapshot: {e}"),
        },
        MessageKind::Operation => match msg.operation {
            Some(op) => {
                let applied = replica.lock().await.apply(op);
                match applied {
                    Ok(()) => {
                        let _ = event_tx.send(ClientEvent::RemoteEdit).await;
                    }
                    Err(e) => log::warn!("failed to integrate remote operation: {e}"),
                }
            }
            None => log::warn!("operation frame without payload"),
        },
        MessageKind::Users => {
            let users = msg.text.split(',').map(str::to_owned).collect();
            let _ = event_tx.send(ClientEvent::Users(users)).await;
        }
        MessageKind::Join => {
            let _ = event_tx.send(ClientEvent::PeerJoined(msg.username)).await;
        }
    }
}
