//! Named rooms and the registry that maps names to them.
//!
//! Rooms isolate clients: messages never cross a room boundary. The map
//! lock is held only around create/lookup; everything inside a room goes
//! through its own [`ClientRegistry`] worker.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use uuid::Uuid;

use crate::registry::ClientRegistry;

/// A named isolation boundary with its connected clients.
pub struct Room {
    pub name: String,
    pub clients: ClientRegistry,
}

impl Room {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            clients: ClientRegistry::spawn(),
        }
    }
}

/// Maps room names to rooms, creating them on first use.
#[derive(Default)]
pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, Arc<Room>>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The room with the given name, created if absent. The second
    /// element is true for exactly one of any set of concurrent
    /// first-time callers.
    pub async fn get_or_create(&self, name: &str) -> (Arc<Room>, bool) {
        // Fast path: read lock.
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(name) {
                return (room.clone(), false);
            }
        }

        // Slow path: write lock, re-checking after acquisition.
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(name) {
            return (room.clone(), false);
        }
        let room = Arc::new(Room::new(name));
        rooms.insert(name.to_owned(), room.clone());
        (room, true)
    }

    /// The room containing the given client, if any. The map lock is
    /// held only while snapshotting the room list.
    pub async fn lookup_by_client(&self, client_id: Uuid) -> Option<Arc<Room>> {
        let rooms: Vec<Arc<Room>> =
            self.rooms.read().await.values().cloned().collect();
        for room in rooms {
            if room.clients.read_one(client_id).await.is_some() {
                return Some(room);
            }
        }
        None
    }

    /// Drop the named room if its last client has left.
    pub async fn remove_if_empty(&self, name: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(name) {
            if room.clients.count().await == 0 {
                rooms.remove(name);
                log::info!("room {name} removed (empty)");
                return true;
            }
        }
        false
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_or_create_is_created_exactly_once() {
        let registry = RoomRegistry::new();

        let (room1, created1) = registry.get_or_create("novel").await;
        let (room2, created2) = registry.get_or_create("novel").await;

        assert!(created1);
        assert!(!created2);
        assert!(Arc::ptr_eq(&room1, &room2));
        assert_eq!(registry.room_count().await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_first_use_yields_one_creation() {
        let registry = Arc::new(RoomRegistry::new());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry.get_or_create("shared").await.1
            }));
        }

        let mut creations = 0;
        for handle in handles {
            if handle.await.unwrap() {
                creations += 1;
            }
        }
        assert_eq!(creations, 1);
        assert_eq!(registry.room_count().await, 1);
    }

    #[tokio::test]
    async fn test_rooms_are_distinct_per_name() {
        let registry = RoomRegistry::new();
        let (a, _) = registry.get_or_create("a").await;
        let (b, _) = registry.get_or_create("b").await;
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(registry.room_count().await, 2);
    }

    #[tokio::test]
    async fn test_lookup_unknown_client_is_none() {
        let registry = RoomRegistry::new();
        registry.get_or_create("busy").await;
        assert!(registry.lookup_by_client(Uuid::new_v4()).await.is_none());
    }

    #[tokio::test]
    async fn test_remove_if_empty_drops_clientless_room() {
        let registry = RoomRegistry::new();
        registry.get_or_create("ghost-town").await;
        assert!(registry.remove_if_empty("ghost-town").await);
        assert_eq!(registry.room_count().await, 0);
        // Removing a missing room is a no-op.
        assert!(!registry.remove_if_empty("ghost-town").await);
    }
}
