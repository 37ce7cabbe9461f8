//! Room membership index.
//!
//! Bookkeeping only: which live connection mirrors which room. Authorization
//! happens before anything reaches this layer.
//!
//! Two indices kept in step:
//! - `subscriptions`: connection -> rooms (makes `leave_all` O(rooms of the connection))
//! - `members`: room -> connections (the broadcast read path)
//!
//! Lock order is always `subscriptions` entry first, then `members`.

use crate::models::{ConnectionId, Room};
use dashmap::DashMap;
use std::collections::HashSet;

/// Result of a guarded join.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined,
    NotAttached,
    /// The guard said no.
    Refused,
}

#[derive(Default)]
pub struct RoomMembership {
    subscriptions: DashMap<ConnectionId, HashSet<Room>>,
    members: DashMap<Room, HashSet<ConnectionId>>,
}

impl RoomMembership {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a connection. Joins are refused for connections that
    /// are not attached, so a join racing a disconnect cannot leave a ghost
    /// membership behind.
    pub fn attach(&self, connection_id: ConnectionId) -> bool {
        let mut attached = false;
        self.subscriptions.entry(connection_id).or_insert_with(|| {
            attached = true;
            HashSet::new()
        });
        attached
    }

    pub fn is_attached(&self, connection_id: ConnectionId) -> bool {
        self.subscriptions.contains_key(&connection_id)
    }

    /// Idempotent. Returns false only when the connection is not attached.
    pub fn join_room(&self, connection_id: ConnectionId, room: Room) -> bool {
        self.join_room_if(connection_id, room, || true) == JoinOutcome::Joined
    }

    /// Join only if `allowed` holds. The guard runs while the connection's
    /// subscription entry is locked, so anything that removes memberships
    /// through `leave_room` after the guard passed also sees the join.
    pub fn join_room_if<F>(&self, connection_id: ConnectionId, room: Room, allowed: F) -> JoinOutcome
    where
        F: FnOnce() -> bool,
    {
        let Some(mut rooms) = self.subscriptions.get_mut(&connection_id) else {
            return JoinOutcome::NotAttached;
        };
        if !allowed() {
            return JoinOutcome::Refused;
        }
        rooms.insert(room);
        self.members.entry(room).or_default().insert(connection_id);
        JoinOutcome::Joined
    }

    /// Idempotent. Returns whether a membership was actually removed.
    pub fn leave_room(&self, connection_id: ConnectionId, room: Room) -> bool {
        let Some(mut rooms) = self.subscriptions.get_mut(&connection_id) else {
            return false;
        };
        let removed = rooms.remove(&room);
        if removed {
            self.remove_member(room, connection_id);
        }
        removed
    }

    /// Detach a connection and drop it from every room it was in.
    /// Returns the rooms it left.
    pub fn leave_all(&self, connection_id: ConnectionId) -> HashSet<Room> {
        let Some((_, rooms)) = self.subscriptions.remove(&connection_id) else {
            return HashSet::new();
        };
        for room in &rooms {
            self.remove_member(*room, connection_id);
        }
        rooms
    }

    /// Snapshot of the connections currently in `room`.
    pub fn members_of(&self, room: Room) -> HashSet<ConnectionId> {
        self.members
            .get(&room)
            .map(|members| members.value().clone())
            .unwrap_or_default()
    }

    pub fn is_member(&self, connection_id: ConnectionId, room: Room) -> bool {
        self.members
            .get(&room)
            .map(|members| members.contains(&connection_id))
            .unwrap_or(false)
    }

    pub fn rooms_of(&self, connection_id: ConnectionId) -> HashSet<Room> {
        self.subscriptions
            .get(&connection_id)
            .map(|rooms| rooms.value().clone())
            .unwrap_or_default()
    }

    /// Union of rooms across several connections (all devices of one user).
    pub fn rooms_of_all<I>(&self, connections: I) -> HashSet<Room>
    where
        I: IntoIterator<Item = ConnectionId>,
    {
        let mut union = HashSet::new();
        for connection_id in connections {
            if let Some(rooms) = self.subscriptions.get(&connection_id) {
                union.extend(rooms.iter().copied());
            }
        }
        union
    }

    /// Remove the given connections from `room`. Returns how many were
    /// actually members.
    pub fn evict<I>(&self, connections: I, room: Room) -> usize
    where
        I: IntoIterator<Item = ConnectionId>,
    {
        connections
            .into_iter()
            .filter(|connection_id| self.leave_room(*connection_id, room))
            .count()
    }

    /// Drop a room entirely (its entity was deleted). Returns the connections
    /// that were removed from it.
    pub fn close_room(&self, room: Room) -> HashSet<ConnectionId> {
        self.members_of(room)
            .into_iter()
            .filter(|connection_id| self.leave_room(*connection_id, room))
            .collect()
    }

    pub fn room_count(&self) -> usize {
        self.members.len()
    }

    pub fn attached_count(&self) -> usize {
        self.subscriptions.len()
    }

    fn remove_member(&self, room: Room, connection_id: ConnectionId) {
        if let Some(mut members) = self.members.get_mut(&room) {
            members.remove(&connection_id);
        }
        self.members.remove_if(&room, |_, members| members.is_empty());
    }
}
