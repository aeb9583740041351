//! Watched room set.
//!
//! Keeps watch intents in insertion order so replays after a reconnect are
//! deterministic. Watching is idempotent: only the first watch of a room
//! reports a change, so only that one produces wire traffic.

use std::collections::HashSet;

use roomcast_proto::RoomId;

/// Rooms the client currently watches.
#[derive(Debug, Clone, Default)]
pub struct Subscriptions {
    order: Vec<RoomId>,
    members: HashSet<RoomId>,
}

impl Subscriptions {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a room. Returns `false` if it was already watched.
    pub fn watch(&mut self, room: RoomId) -> bool {
        if !self.members.insert(room.clone()) {
            return false;
        }
        self.order.push(room);
        true
    }

    /// Remove a room. Returns `false` if it was not watched.
    pub fn unwatch(&mut self, room: &RoomId) -> bool {
        if !self.members.remove(room) {
            return false;
        }
        self.order.retain(|watched| watched != room);
        true
    }

    /// Whether a room is watched.
    pub fn contains(&self, room: &RoomId) -> bool {
        self.members.contains(room)
    }

    /// Watched rooms in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &RoomId> + '_ {
        self.order.iter()
    }

    /// Number of watched rooms.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// True when nothing is watched.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
