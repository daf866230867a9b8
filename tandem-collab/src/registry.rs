//! Serialized monitor over the connected clients of one room.
//!
//! The client set is mutated from two directions — connection handlers
//! add and remove entries, the routers enumerate them to broadcast — so
//! membership is owned by a single worker task and every access goes
//! through its FIFO request queue. Requests from one caller are serviced
//! in issue order, and a `read_all` issued after an `add` or `delete`
//! completes observes the effect.
//!
//! Sends are deliberately *not* serialized by the monitor: each client's
//! outbound half sits behind its own lock, so a slow peer stalls only
//! writers to that peer, never the membership worker.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::protocol::{Message, ProtocolError};

/// Outbound half of a server-side client connection.
pub type ClientSink = SplitSink<WebSocketStream<TcpStream>, WsMessage>;

/// A connected client as the relay sees it.
#[derive(Clone)]
pub struct Client {
    pub id: Uuid,
    pub site_id: String,
    pub username: String,
    writer: Arc<Mutex<ClientSink>>,
}

impl Client {
    pub fn new(id: Uuid, site_id: String, writer: ClientSink) -> Self {
        Self {
            id,
            site_id,
            username: String::new(),
            writer: Arc::new(Mutex::new(writer)),
        }
    }

    /// Send one frame, holding this client's write lock for the duration.
    pub async fn send(&self, msg: &Message) -> Result<(), ProtocolError> {
        let frame = msg.encode()?;
        let mut writer = self.writer.lock().await;
        writer.send(WsMessage::Text(frame.into())).await?;
        Ok(())
    }

    async fn close(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.close().await;
    }
}

enum Request {
    Add(Client),
    ReadOne {
        id: Uuid,
        resp: oneshot::Sender<Option<Client>>,
    },
    ReadAll {
        resp: oneshot::Sender<mpsc::Receiver<Client>>,
    },
    UpdateName {
        id: Uuid,
        username: String,
    },
    Delete {
        id: Uuid,
        done: oneshot::Sender<()>,
    },
}

/// Handle to one room's membership worker.
#[derive(Clone)]
pub struct ClientRegistry {
    requests: mpsc::Sender<Request>,
}

impl ClientRegistry {
    /// Spawn the worker that owns this room's client map.
    pub fn spawn() -> Self {
        let (tx, mut rx) = mpsc::channel(256);
        tokio::spawn(async move {
            let mut clients: HashMap<Uuid, Client> = HashMap::new();
            while let Some(req) = rx.recv().await {
                match req {
                    Request::Add(client) => {
                        clients.insert(client.id, client);
                    }
                    Request::ReadOne { id, resp } => {
                        let _ = resp.send(clients.get(&id).cloned());
                    }
                    Request::ReadAll { resp } => {
                        // Capacity covers the whole snapshot, so the
                        // worker never blocks on a slow consumer.
                        let (stream_tx, stream_rx) =
                            mpsc::channel(clients.len().max(1));
                        for client in clients.values() {
                            let _ = stream_tx.try_send(client.clone());
                        }
                        let _ = resp.send(stream_rx);
                    }
                    Request::UpdateName { id, username } => {
                        if let Some(client) = clients.get_mut(&id) {
                            client.username = username;
                        }
                    }
                    Request::Delete { id, done } => {
                        if let Some(client) = clients.remove(&id) {
                            client.close().await;
                        }
                        let _ = done.send(());
                    }
                }
            }
        });
        Self { requests: tx }
    }

    /// Insert a client. Does not wait for the worker to process it.
    pub async fn add(&self, client: Client) {
        let _ = self.requests.send(Request::Add(client)).await;
    }

    /// The client with the given id, if connected.
    pub async fn read_one(&self, id: Uuid) -> Option<Client> {
        let (resp, rx) = oneshot::channel();
        if self.requests.send(Request::ReadOne { id, resp }).await.is_err() {
            return None;
        }
        rx.await.ok().flatten()
    }

    /// A snapshot of every client, as a stream that ends when drained.
    pub async fn read_all(&self) -> mpsc::Receiver<Client> {
        let (resp, rx) = oneshot::channel();
        if self.requests.send(Request::ReadAll { resp }).await.is_err() {
            // Worker gone: an empty, closed stream.
            return mpsc::channel(1).1;
        }
        match rx.await {
            Ok(stream) => stream,
            Err(_) => mpsc::channel(1).1,
        }
    }

    pub async fn update_name(&self, id: Uuid, username: String) {
        let _ = self
            .requests
            .send(Request::UpdateName { id, username })
            .await;
    }

    /// Close the client's transport and remove it. Resolves once the
    /// removal is visible to subsequent reads.
    pub async fn delete(&self, id: Uuid) {
        let (done, rx) = oneshot::channel();
        if self.requests.send(Request::Delete { id, done }).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Number of connected clients.
    pub async fn count(&self) -> usize {
        let mut members = self.read_all().await;
        let mut n = 0;
        while members.recv().await.is_some() {
            n += 1;
        }
        n
    }

    /// The usernames of every connected client, with the id of one
    /// member to resolve the room by. `None` when the room is empty.
    pub async fn roster(&self) -> Option<(Uuid, Vec<String>)> {
        let mut members = self.read_all().await;
        let mut member_id = None;
        let mut names = Vec::new();
        while let Some(client) = members.recv().await {
            member_id.get_or_insert(client.id);
            names.push(client.username);
        }
        member_id.map(|id| (id, names))
    }

    /// Send to every client. A failed send evicts that client and the
    /// enumeration continues.
    pub async fn broadcast_all(&self, msg: &Message) {
        let mut members = self.read_all().await;
        while let Some(client) = members.recv().await {
            self.send_or_evict(&client, msg).await;
        }
    }

    /// Send to every client except `except`.
    pub async fn broadcast_all_except(&self, msg: &Message, except: Uuid) {
        let mut members = self.read_all().await;
        while let Some(client) = members.recv().await {
            if client.id == except {
                continue;
            }
            self.send_or_evict(&client, msg).await;
        }
    }

    /// Send to the single client with id `recipient`.
    pub async fn broadcast_one(&self, msg: &Message, recipient: Uuid) {
        if let Some(client) = self.read_one(recipient).await {
            self.send_or_evict(&client, msg).await;
        }
    }

    /// Send to any one client other than `except`. A no-op when there is
    /// no other member; a failed candidate is evicted and the next one
    /// is tried.
    pub async fn broadcast_one_except(&self, msg: &Message, except: Uuid) {
        let mut members = self.read_all().await;
        while let Some(client) = members.recv().await {
            if client.id == except {
                continue;
            }
            if client.send(msg).await.is_ok() {
                break;
            }
            log::error!("evicting client {}: send failed", client.id);
            self.delete(client.id).await;
        }
    }

    async fn send_or_evict(&self, client: &Client, msg: &Message) {
        if let Err(e) = client.send(msg).await {
            log::error!("evicting client {}: send failed: {e}", client.id);
            self.delete(client.id).await;
        }
    }
}
