use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::warn;

pub type ConnId = u64;

/// Bounded queue of serialized frames owned by one connection's writer.
pub type Outbox = mpsc::Sender<Arc<str>>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Room {
    Tenant(String),
    Privileged,
}

impl fmt::Display for Room {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Room::Tenant(id) => write!(f, "tenant:{id}"),
            Room::Privileged => f.write_str("privileged"),
        }
    }
}

/// Live connections and their room memberships.
pub struct RoomRegistry {
    next_id: AtomicU64,
    outboxes: DashMap<ConnId, Outbox>,
    members: DashMap<Room, HashSet<ConnId>>,
    joined: DashMap<ConnId, HashSet<Room>>,
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            outboxes: DashMap::new(),
            members: DashMap::new(),
            joined: DashMap::new(),
        }
    }

    pub fn register(&self, outbox: Outbox) -> ConnId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.outboxes.insert(id, outbox);
        self.joined.insert(id, HashSet::new());
        id
    }

    /// Add `conn` to `room`. Returns false if it was already a member or is
    /// not registered.
    pub fn join(&self, conn: ConnId, room: Room) -> bool {
        let Some(mut rooms) = self.joined.get_mut(&conn) else {
            return false;
        };
        if !rooms.insert(room.clone()) {
            return false;
        }
        // Lock order: joined, then members. disconnect follows the same order.
        self.members.entry(room).or_default().insert(conn);
        true
    }

    /// Remove `conn` from every room and drop its outbox.
    pub fn disconnect(&self, conn: ConnId) {
        self.outboxes.remove(&conn);
        let Some((_, rooms)) = self.joined.remove(&conn) else {
            return;
        };
        for room in rooms {
            if let Some(mut set) = self.members.get_mut(&room) {
                set.remove(&conn);
            }
            self.members.remove_if(&room, |_, set| set.is_empty());
        }
    }

    /// Queue `frame` for every member of `room` without waiting. Returns the
    /// number of outboxes that accepted it.
    pub fn broadcast(&self, room: &Room, frame: &Arc<str>) -> usize {
        let targets = self.members(room);
        let mut delivered = 0;
        for conn in targets {
            let Some(outbox) = self.outboxes.get(&conn).map(|o| o.value().clone()) else {
                continue;
            };
            match outbox.try_send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!("outbox full, dropping push to connection {conn} in {room}");
                    metrics::counter!(crate::observability::PUSHES_DROPPED_TOTAL).increment(1);
                }
                // Connection is shutting down; its guard will disconnect it.
                Err(TrySendError::Closed(_)) => {}
            }
        }
        delivered
    }

    pub fn members(&self, room: &Room) -> Vec<ConnId> {
        self.members
            .get(room)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn rooms_of(&self, conn: ConnId) -> Vec<Room> {
        self.joined
            .get(&conn)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn connection_count(&self) -> usize {
        self.outboxes.len()
    }
}
