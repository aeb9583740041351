//! Post Ledger
//!
//! Per-room, arrival-ordered record of received posts.
//!
//! ## Invariants
//!
//! - Posts in a room are kept in arrival order and never reordered
//! - Arrival indices within a room start at 0 and increase by one per
//!   recorded post, even after old posts are evicted
//! - A delivery id is recorded at most once per room; a redelivery returns
//!   the original post and is flagged as a duplicate
//!
//! Each room's posts sit behind an `Arc`. [`PostLedger::snapshot`] hands out
//! a shared reference without copying; the next `record` copies the posts
//! only if that snapshot is still alive.

use std::{
    collections::{HashMap, hash_map::Entry},
    num::NonZeroUsize,
    sync::Arc,
};

use roomcast_proto::{Payload, RoomId};

use crate::error::ValidationError;

/// A recorded post. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Post {
    /// Room the post belongs to.
    pub room: RoomId,
    /// Fixed-width payload.
    pub payload: Payload,
    /// Arrival index within the room.
    pub index: u64,
    /// Server-assigned delivery id, if the server sent one.
    pub delivery: Option<u64>,
    /// Server clock when the post was accepted (ms), if sent.
    pub server_time: Option<i64>,
}

/// Delivery metadata supplied by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Delivery {
    /// Dedup key. `None` means the transport never redelivers.
    pub id: Option<u64>,
    /// Server clock when the post was accepted (ms).
    pub server_time: Option<i64>,
}

/// Result of [`PostLedger::record`].
#[derive(Debug, Clone, Copy)]
pub struct Recorded<'a> {
    /// The new post, or the original one for a duplicate.
    pub post: &'a Post,
    /// The room's full ordered history after recording.
    pub history: &'a [Post],
    /// True when the delivery id had already been recorded.
    pub duplicate: bool,
}

#[derive(Debug, Clone, Default)]
struct RoomLedger {
    posts: Arc<Vec<Post>>,
    /// Delivery id -> arrival index.
    seen: HashMap<u64, u64>,
    next_index: u64,
}

impl RoomLedger {
    fn position(&self, index: u64) -> Option<usize> {
        let first = self.posts.first()?.index;
        let offset = usize::try_from(index.checked_sub(first)?).ok()?;
        (offset < self.posts.len()).then_some(offset)
    }

    fn evict_to(&mut self, limit: NonZeroUsize) -> usize {
        let excess = self.posts.len().saturating_sub(limit.get());
        if excess == 0 {
            return 0;
        }
        for evicted in Arc::make_mut(&mut self.posts).drain(..excess) {
            if let Some(id) = evicted.delivery {
                self.seen.remove(&id);
            }
        }
        excess
    }
}

/// Arrival-ordered posts for every room seen in this session.
#[derive(Debug, Clone)]
pub struct PostLedger {
    room_width: usize,
    history_limit: Option<NonZeroUsize>,
    rooms: HashMap<RoomId, RoomLedger>,
}

impl PostLedger {
    /// Create an empty ledger for rooms of `room_width` bytes.
    pub fn new(room_width: usize) -> Self {
        Self { room_width, history_limit: None, rooms: HashMap::new() }
    }

    /// Keep at most `limit` posts per room, evicting the oldest.
    ///
    /// Evicted delivery ids are forgotten, so a redelivery of an evicted
    /// post is recorded again.
    pub fn with_history_limit(mut self, limit: Option<NonZeroUsize>) -> Self {
        self.history_limit = limit;
        self
    }

    fn check_room(&self, room: &RoomId) -> Result<(), ValidationError> {
        if room.width() != self.room_width {
            return Err(ValidationError::RoomWidth {
                expected: self.room_width,
                actual: room.width(),
            });
        }
        Ok(())
    }

    /// Create an empty entry for a room if there is none yet.
    pub fn ensure_room(&mut self, room: &RoomId) -> Result<(), ValidationError> {
        self.check_room(room)?;
        if !self.rooms.contains_key(room) {
            self.rooms.insert(room.clone(), RoomLedger::default());
        }
        Ok(())
    }

    /// Append a post to its room.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::RoomWidth` if the room id does not have the
    /// configured width. Duplicates are not errors.
    pub fn record(
        &mut self,
        room: RoomId,
        payload: Payload,
        delivery: Delivery,
    ) -> Result<Recorded<'_>, ValidationError> {
        self.check_room(&room)?;
        let limit = self.history_limit;

        let entry = match self.rooms.entry(room.clone()) {
            Entry::Occupied(occupied) => occupied.into_mut(),
            Entry::Vacant(vacant) => vacant.insert(RoomLedger::default()),
        };

        if let Some(id) = delivery.id
            && let Some(position) = entry.seen.get(&id).and_then(|index| entry.position(*index))
        {
            tracing::debug!("dropping duplicate delivery {} in room {}", id, room);
            return Ok(Recorded {
                post: &entry.posts[position],
                history: &entry.posts,
                duplicate: true,
            });
        }

        let index = entry.next_index;
        entry.next_index += 1;
        Arc::make_mut(&mut entry.posts).push(Post {
            room,
            payload,
            index,
            delivery: delivery.id,
            server_time: delivery.server_time,
        });
        if let Some(id) = delivery.id {
            entry.seen.insert(id, index);
        }

        if let Some(limit) = limit {
            let evicted = entry.evict_to(limit);
            if evicted > 0 {
                tracing::debug!("evicted {} posts past history limit {}", evicted, limit);
            }
        }

        let last = entry.posts.len() - 1;
        Ok(Recorded { post: &entry.posts[last], history: &entry.posts, duplicate: false })
    }

    /// Ordered history of a room; empty if the room is unknown.
    pub fn history(&self, room: &RoomId) -> &[Post] {
        self.rooms.get(room).map(|entry| entry.posts.as_slice()).unwrap_or(&[])
    }

    /// Shared handle to a room's history as of now. O(1).
    pub fn snapshot(&self, room: &RoomId) -> Arc<Vec<Post>> {
        self.rooms.get(room).map(|entry| Arc::clone(&entry.posts)).unwrap_or_default()
    }

    /// Whether the ledger has an entry for a room.
    pub fn knows(&self, room: &RoomId) -> bool {
        self.rooms.contains_key(room)
    }

    /// Drop a room's entry. Returns `false` if there was none.
    pub fn forget(&mut self, room: &RoomId) -> bool {
        self.rooms.remove(room).is_some()
    }

    /// Number of rooms with an entry.
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}
