//! In-memory room table for socket fan-out.
//!
//! Each live socket registers a connection with a bounded outbound queue.
//! Connections join named rooms (`user:<id>`, `project:<id>`,
//! `conversation:<id>`) and emits target a room, optionally skipping the
//! connection that triggered them. Rooms exist only while they have members.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{RwLock, mpsc};
use tracing::{debug, warn};

use super::events::ServerEvent;

/// Outbound frames buffered per connection before new ones are dropped.
pub const OUTBOUND_QUEUE: usize = 256;

pub type ConnId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Room {
    User(i64),
    Project(i64),
    Conversation(i64),
}

impl fmt::Display for Room {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Room::User(id) => write!(f, "user:{}", id),
            Room::Project(id) => write!(f, "project:{}", id),
            Room::Conversation(id) => write!(f, "conversation:{}", id),
        }
    }
}

struct Connection {
    user_id: i64,
    tx: mpsc::Sender<Arc<String>>,
    rooms: HashSet<Room>,
}

#[derive(Default)]
struct Inner {
    connections: HashMap<ConnId, Connection>,
    rooms: HashMap<Room, HashSet<ConnId>>,
}

impl Inner {
    fn join(&mut self, conn_id: ConnId, room: Room) -> bool {
        let Some(conn) = self.connections.get_mut(&conn_id) else {
            return false;
        };
        conn.rooms.insert(room);
        self.rooms.entry(room).or_default().insert(conn_id)
    }

    fn leave(&mut self, conn_id: ConnId, room: Room) -> bool {
        if let Some(conn) = self.connections.get_mut(&conn_id) {
            conn.rooms.remove(&room);
        }
        let Some(members) = self.rooms.get_mut(&room) else {
            return false;
        };
        let removed = members.remove(&conn_id);
        if members.is_empty() {
            self.rooms.remove(&room);
        }
        removed
    }
}

/// Shared registry of socket connections and the rooms they are in.
pub struct RoomRegistry {
    inner: RwLock<Inner>,
    next_id: AtomicU64,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a connection for `user_id` and join its personal room.
    /// The receiver yields serialized frames; it closes when the connection
    /// is unregistered or the registry is shut down.
    pub async fn register(&self, user_id: i64) -> (ConnId, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        let conn_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.write().await;
        inner.connections.insert(
            conn_id,
            Connection {
                user_id,
                tx,
                rooms: HashSet::new(),
            },
        );
        inner.join(conn_id, Room::User(user_id));
        (conn_id, rx)
    }

    /// Remove a connection from every room it joined.
    pub async fn unregister(&self, conn_id: ConnId) {
        let mut inner = self.inner.write().await;
        let Some(conn) = inner.connections.remove(&conn_id) else {
            return;
        };
        for room in conn.rooms {
            if let Some(members) = inner.rooms.get_mut(&room) {
                members.remove(&conn_id);
                if members.is_empty() {
                    inner.rooms.remove(&room);
                }
            }
        }
    }

    /// Returns `false` if the connection is unknown or already in the room.
    pub async fn join(&self, conn_id: ConnId, room: Room) -> bool {
        let joined = self.inner.write().await.join(conn_id, room);
        if joined {
            debug!(conn_id, room = %room, "joined room");
        }
        joined
    }

    pub async fn leave(&self, conn_id: ConnId, room: Room) -> bool {
        let left = self.inner.write().await.leave(conn_id, room);
        if left {
            debug!(conn_id, room = %room, "left room");
        }
        left
    }

    /// Remove every connection of `user_id` from a room, e.g. after they
    /// lose access to a project.
    pub async fn evict_user(&self, user_id: i64, room: Room) {
        let mut inner = self.inner.write().await;
        let conn_ids: Vec<ConnId> = inner
            .connections
            .iter()
            .filter(|(_, c)| c.user_id == user_id)
            .map(|(id, _)| *id)
            .collect();
        for conn_id in conn_ids {
            inner.leave(conn_id, room);
        }
    }

    /// Send an event to every connection in `room` except `except`.
    /// Returns the number of connections the frame was queued for.
    pub async fn emit(&self, room: Room, event: &ServerEvent, except: Option<ConnId>) -> usize {
        let Some(json) = serialize(event) else {
            return 0;
        };
        let inner = self.inner.read().await;
        let Some(members) = inner.rooms.get(&room) else {
            return 0;
        };
        let mut delivered = 0;
        for conn_id in members {
            if Some(*conn_id) == except {
                continue;
            }
            if let Some(conn) = inner.connections.get(conn_id) {
                if enqueue(*conn_id, conn, &json) {
                    delivered += 1;
                }
            }
        }
        debug!(room = %room, event = event.name(), recipients = delivered, "emit");
        delivered
    }

    /// Send an event to every socket the user has open.
    pub async fn emit_to_user(&self, user_id: i64, event: &ServerEvent) -> usize {
        self.emit(Room::User(user_id), event, None).await
    }

    /// Send an event to a single connection.
    pub async fn emit_to_conn(&self, conn_id: ConnId, event: &ServerEvent) -> bool {
        let Some(json) = serialize(event) else {
            return false;
        };
        let inner = self.inner.read().await;
        match inner.connections.get(&conn_id) {
            Some(conn) => enqueue(conn_id, conn, &json),
            None => false,
        }
    }

    pub async fn is_in_room(&self, conn_id: ConnId, room: Room) -> bool {
        let inner = self.inner.read().await;
        inner
            .rooms
            .get(&room)
            .map(|m| m.contains(&conn_id))
            .unwrap_or(false)
    }

    pub async fn room_size(&self, room: Room) -> usize {
        let inner = self.inner.read().await;
        inner.rooms.get(&room).map(HashSet::len).unwrap_or(0)
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.read().await.connections.len()
    }

    /// Drop every connection. Their outbound receivers close, which ends
    /// each socket loop.
    pub async fn close_all(&self) {
        let mut inner = self.inner.write().await;
        let count = inner.connections.len();
        inner.connections.clear();
        inner.rooms.clear();
        debug!(connections = count, "closed all sockets");
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn serialize(event: &ServerEvent) -> Option<Arc<String>> {
    match serde_json::to_string(event) {
        Ok(json) => Some(Arc::new(json)),
        Err(e) => {
            warn!(event = event.name(), error = %e, "failed to serialize event");
            None
        }
    }
}

fn enqueue(conn_id: ConnId, conn: &Connection, json: &Arc<String>) -> bool {
    match conn.tx.try_send(Arc::clone(json)) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!(conn_id, user_id = conn.user_id, "outbound queue full, dropping frame");
            false
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}
