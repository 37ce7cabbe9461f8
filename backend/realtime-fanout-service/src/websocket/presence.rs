//! Presence and typing.
//!
//! Presence is edge-triggered off the connection registry: the first
//! connection of a user emits `user_online`, the last one going away emits
//! `user_offline`, everything in between is silent. Each peer connection that
//! shares a room with the user gets exactly one presence envelope.
//!
//! Typing is a pulse. `typing_start` arms a timer; if neither a fresh
//! `typing_start` nor a `typing_stop` arrives before it fires, a
//! `typing_stop` is synthesized. Timers are matched by generation so a stale
//! timer never cancels a newer pulse.

use super::broadcast::fan_out;
use super::events::{EventEnvelope, EventKind};
use super::registry::{ConnectionRegistry, PresenceObserver};
use super::rooms::RoomMembership;
use crate::metrics;
use crate::models::{ConnectionId, Room, UserId};
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub struct PresenceTracker {
    registry: Arc<ConnectionRegistry>,
    rooms: Arc<RoomMembership>,
    typing: DashMap<(UserId, Room), u64>,
    next_generation: AtomicU64,
    typing_timeout: Duration,
}

impl PresenceTracker {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        rooms: Arc<RoomMembership>,
        typing_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            rooms,
            typing: DashMap::new(),
            next_generation: AtomicU64::new(1),
            typing_timeout,
        }
    }

    /// Observer for a single register/unregister call. Connections that fail
    /// while receiving the announcement are collected and must be torn down
    /// by the caller once the registry call has returned.
    pub fn batch(&self) -> PresenceBatch<'_> {
        PresenceBatch {
            tracker: self,
            failed: Vec::new(),
        }
    }

    pub fn is_online(&self, user_id: UserId) -> bool {
        self.registry.is_online(user_id)
    }

    /// Peers of `connection_id`: every other connection in any of its rooms.
    fn peers_of(&self, connection_id: ConnectionId) -> HashSet<ConnectionId> {
        let mut peers = HashSet::new();
        for room in self.rooms.rooms_of(connection_id) {
            peers.extend(self.rooms.members_of(room));
        }
        peers.remove(&connection_id);
        peers
    }

    fn announce(&self, kind: EventKind, user_id: UserId, connection_id: ConnectionId) -> Vec<ConnectionId> {
        let peers = self.peers_of(connection_id);
        let envelope = EventEnvelope::presence(kind, user_id);
        let report = fan_out(&self.registry, peers, &envelope.to_frame());
        metrics::record_event_published(kind.as_str());
        tracing::info!(
            user_id = %user_id,
            event_type = kind.as_str(),
            peers = report.attempted,
            "presence changed"
        );
        report.failed
    }

    pub fn typing_timeout(&self) -> Duration {
        self.typing_timeout
    }

    /// Record a typing pulse. Returns the generation the expiry timer must
    /// present to [`expire_typing`](Self::expire_typing).
    pub fn typing_started(&self, user_id: UserId, room: Room) -> u64 {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        self.typing.insert((user_id, room), generation);
        generation
    }

    /// Explicit stop. Returns whether the user was marked as typing.
    pub fn typing_stopped(&self, user_id: UserId, room: Room) -> bool {
        self.typing.remove(&(user_id, room)).is_some()
    }

    /// Timer expiry. Only clears the state if no newer pulse replaced it.
    pub fn expire_typing(&self, user_id: UserId, room: Room, generation: u64) -> bool {
        self.typing
            .remove_if(&(user_id, room), |_, current| *current == generation)
            .is_some()
    }

    pub fn is_typing(&self, user_id: UserId, room: Room) -> bool {
        self.typing.contains_key(&(user_id, room))
    }
}

pub struct PresenceBatch<'a> {
    tracker: &'a PresenceTracker,
    failed: Vec<ConnectionId>,
}

impl PresenceBatch<'_> {
    pub fn into_failed(self) -> Vec<ConnectionId> {
        self.failed
    }
}

impl PresenceObserver for PresenceBatch<'_> {
    fn came_online(&mut self, user_id: UserId, connection_id: ConnectionId) {
        metrics::record_presence_transition("online");
        let failed = self
            .tracker
            .announce(EventKind::UserOnline, user_id, connection_id);
        self.failed.extend(failed);
    }

    fn went_offline(&mut self, user_id: UserId, connection_id: ConnectionId) {
        metrics::record_presence_transition("offline");
        let failed = self
            .tracker
            .announce(EventKind::UserOffline, user_id, connection_id);
        self.failed.extend(failed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    struct Fixture {
        registry: Arc<ConnectionRegistry>,
        rooms: Arc<RoomMembership>,
        tracker: PresenceTracker,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(ConnectionRegistry::new());
        let rooms = Arc::new(RoomMembership::new());
        let tracker = PresenceTracker::new(registry.clone(), rooms.clone(), Duration::from_secs(5));
        Fixture {
            registry,
            rooms,
            tracker,
        }
    }

    impl Fixture {
        fn connect(&self, user: UserId, rooms: &[Room]) -> (ConnectionId, mpsc::Receiver<String>) {
            let conn = ConnectionId::new();
            let (tx, rx) = mpsc::channel(16);
            self.rooms.attach(conn);
            for room in rooms {
                self.rooms.join_room(conn, *room);
            }
            let mut batch = self.tracker.batch();
            self.registry.register(user, conn, tx, &mut batch).unwrap();
            assert!(batch.into_failed().is_empty());
            (conn, rx)
        }

        fn disconnect(&self, conn: ConnectionId) {
            let mut batch = self.tracker.batch();
            self.registry.unregister(conn, &mut batch);
            self.rooms.leave_all(conn);
        }
    }

    fn drain(rx: &mut mpsc::Receiver<String>) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(serde_json::from_str(&frame).unwrap());
        }
        frames
    }

    #[tokio::test]
    async fn test_online_offline_edges() {
        let f = fixture();
        let (a, b) = (Room::channel(Uuid::new_v4()), Room::workspace(Uuid::new_v4()));
        let watcher = Uuid::new_v4();
        let (_w, mut watcher_rx) = f.connect(watcher, &[a, b]);
        drain(&mut watcher_rx);

        let user = Uuid::new_v4();
        let (c1, _rx1) = f.connect(user, &[a, b]);
        let (c2, _rx2) = f.connect(user, &[a]);

        // Shared two rooms, still exactly one envelope.
        let frames = drain(&mut watcher_rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["type"], "user_online");
        assert_eq!(frames[0]["userId"], user.to_string());

        f.disconnect(c1);
        assert!(drain(&mut watcher_rx).is_empty());
        assert!(f.tracker.is_online(user));

        f.disconnect(c2);
        let frames = drain(&mut watcher_rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["type"], "user_offline");
        assert!(!f.tracker.is_online(user));
    }

    #[tokio::test]
    async fn test_presence_not_sent_outside_shared_rooms() {
        let f = fixture();
        let (_stranger, mut stranger_rx) = f.connect(Uuid::new_v4(), &[Room::channel(Uuid::new_v4())]);
        let user = Uuid::new_v4();
        let (_c, mut own_rx) = f.connect(user, &[Room::channel(Uuid::new_v4())]);

        assert!(drain(&mut stranger_rx).is_empty());
        assert!(drain(&mut own_rx).is_empty());
    }

    #[tokio::test]
    async fn test_failed_peer_is_reported() {
        let f = fixture();
        let room = Room::channel(Uuid::new_v4());
        let (dead, dead_rx) = f.connect(Uuid::new_v4(), &[room]);
        drop(dead_rx);

        let conn = ConnectionId::new();
        let (tx, _rx) = mpsc::channel(4);
        f.rooms.attach(conn);
        f.rooms.join_room(conn, room);
        let mut batch = f.tracker.batch();
        f.registry.register(Uuid::new_v4(), conn, tx, &mut batch).unwrap();

        assert_eq!(batch.into_failed(), vec![dead]);
    }

    #[test]
    fn test_typing_generations() {
        let f = fixture();
        let user = Uuid::new_v4();
        let room = Room::channel(Uuid::new_v4());

        let first = f.tracker.typing_started(user, room);
        let second = f.tracker.typing_started(user, room);
        assert_ne!(first, second);

        // The first timer is stale and must not clear the newer pulse.
        assert!(!f.tracker.expire_typing(user, room, first));
        assert!(f.tracker.is_typing(user, room));
        assert!(f.tracker.expire_typing(user, room, second));
        assert!(!f.tracker.is_typing(user, room));

        let third = f.tracker.typing_started(user, room);
        assert!(f.tracker.typing_stopped(user, room));
        assert!(!f.tracker.expire_typing(user, room, third));
        assert!(!f.tracker.typing_stopped(user, room));
    }
}
