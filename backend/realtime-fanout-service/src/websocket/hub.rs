//! The realtime context object.
//!
//! Built once at startup and shared by the gateway, the internal API and the
//! idle sweeper. Owns the registry, the room index, presence and the
//! broadcaster, and composes them into connection-level operations.

use super::broadcast::Broadcaster;
use super::events::{EventEnvelope, EventKind};
use super::message_types::ControlFrame;
use super::presence::PresenceTracker;
use super::registry::{ConnectionInfo, ConnectionRegistry, NoPresence};
use super::rooms::{JoinOutcome, RoomMembership};
use crate::error::RealtimeError;
use crate::metrics;
use crate::models::{ConnectionId, Identity, Room, Session, UserId};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
pub struct HubSettings {
    /// Outbound frame queue per connection. Also bounds the intent queue.
    pub outbound_buffer: usize,
    pub typing_timeout: Duration,
    /// How long a revocation is remembered for refusing joins whose store
    /// check started before it. Must outlast the slowest store check.
    pub revocation_retention: Duration,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            outbound_buffer: 256,
            typing_timeout: Duration::from_secs(5),
            revocation_retention: Duration::from_secs(60),
        }
    }
}

/// A freshly admitted connection: its session and the receiving end of its
/// outbound queue. The transport drains `outbound`; when the hub drops the
/// sending side the stream ends and the transport closes the socket.
pub struct Admission {
    pub session: Session,
    pub rooms: Vec<Room>,
    pub outbound: mpsc::Receiver<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionOutcome {
    Evicted(usize),
    /// The user had no live connection in the room. Expected steady state
    /// when the user is offline or never joined; not an error.
    NoLiveMembership,
}

#[derive(Debug, Clone, Serialize)]
pub struct HubStats {
    pub connections: usize,
    pub online_users: usize,
    pub rooms: usize,
    pub shutting_down: bool,
}

pub struct RealtimeHub {
    registry: Arc<ConnectionRegistry>,
    rooms: Arc<RoomMembership>,
    presence: Arc<PresenceTracker>,
    broadcaster: Broadcaster,
    settings: HubSettings,
    shutting_down: AtomicBool,
    /// Bumped on every eviction. A reader takes a mark before asking the
    /// store and refuses to apply the answer if a revocation newer than the
    /// mark exists for that user and room.
    revoke_seq: AtomicU64,
    revocations: DashMap<(UserId, Room), (u64, Instant)>,
}

impl RealtimeHub {
    pub fn new(settings: HubSettings) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let rooms = Arc::new(RoomMembership::new());
        let presence = Arc::new(PresenceTracker::new(
            registry.clone(),
            rooms.clone(),
            settings.typing_timeout,
        ));
        let broadcaster = Broadcaster::new(registry.clone(), rooms.clone(), presence.clone());
        Self {
            registry,
            rooms,
            presence,
            broadcaster,
            settings,
            shutting_down: AtomicBool::new(false),
            revoke_seq: AtomicU64::new(0),
            revocations: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn rooms(&self) -> &RoomMembership {
        &self.rooms
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    pub fn settings(&self) -> &HubSettings {
        &self.settings
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Take before reading memberships from the store; pass to
    /// [`admit_since`](Self::admit_since) or [`join_checked`](Self::join_checked).
    pub fn revocation_mark(&self) -> u64 {
        self.revoke_seq.load(Ordering::Acquire)
    }

    fn revoked_since(&self, user_id: UserId, room: Room, mark: u64) -> bool {
        self.revocations
            .get(&(user_id, room))
            .map(|entry| entry.value().0 > mark)
            .unwrap_or(false)
    }

    /// Admit with memberships read from the store just now.
    pub fn admit<I>(&self, identity: &Identity, rooms: I) -> Result<Admission, RealtimeError>
    where
        I: IntoIterator<Item = Room>,
    {
        self.admit_since(identity, rooms, self.revocation_mark())
    }

    /// Admit an authenticated connection.
    ///
    /// The connection is joined to its rooms (always including the user's
    /// inbox) before it is registered, so the `user_online` announcement
    /// reaches everyone who shares a room with it. Rooms revoked after
    /// `mark` are left out. A `ready` frame is queued last.
    pub fn admit_since<I>(
        &self,
        identity: &Identity,
        rooms: I,
        mark: u64,
    ) -> Result<Admission, RealtimeError>
    where
        I: IntoIterator<Item = Room>,
    {
        if self.is_shutting_down() {
            return Err(RealtimeError::ShuttingDown);
        }

        let connection_id = ConnectionId::new();
        let session = Session::new(connection_id, identity);
        let (tx, outbound) = mpsc::channel(self.settings.outbound_buffer);

        let mut joined: Vec<Room> = rooms.into_iter().collect::<HashSet<_>>().into_iter().collect();
        let inbox = Room::user_inbox(identity.user_id);
        if !joined.contains(&inbox) {
            joined.push(inbox);
        }
        joined.sort();

        let user_id = identity.user_id;
        self.rooms.attach(connection_id);
        joined.retain(|room| {
            let outcome = self.rooms.join_room_if(connection_id, *room, || {
                *room == inbox || !self.revoked_since(user_id, *room, mark)
            });
            outcome == JoinOutcome::Joined
        });

        let mut batch = self.presence.batch();
        if let Err(e) = self
            .registry
            .register(identity.user_id, connection_id, tx, &mut batch)
        {
            self.rooms.leave_all(connection_id);
            return Err(e);
        }
        let failed = batch.into_failed();
        self.broadcaster.teardown(failed);

        // An eviction that ran before we were registered could not see this
        // connection. Its revocation is already recorded, so catch it here.
        joined.retain(|room| {
            let revoked = *room != inbox && self.revoked_since(user_id, *room, mark);
            if revoked {
                self.rooms.leave_room(connection_id, *room);
            }
            !revoked
        });

        // Shutdown may have started while we were registering.
        if self.is_shutting_down() {
            self.disconnect(connection_id);
            return Err(RealtimeError::ShuttingDown);
        }

        self.broadcaster.send_control(
            connection_id,
            &ControlFrame::Ready {
                connection_id,
                user_id: identity.user_id,
                rooms: joined.clone(),
            },
        );

        tracing::info!(
            connection_id = %connection_id,
            user_id = %identity.user_id,
            rooms = joined.len(),
            "connection admitted"
        );

        Ok(Admission {
            session,
            rooms: joined,
            outbound,
        })
    }

    /// Disconnect cleanup: unregister (may announce offline), then leave
    /// every room. Safe to call more than once.
    pub fn disconnect(&self, connection_id: ConnectionId) -> bool {
        self.broadcaster.teardown([connection_id]) > 0
    }

    /// Join after a store check that started at `mark`. Refused when the
    /// membership was revoked in the meantime. `Ok(false)` means the
    /// connection is already gone.
    pub fn join_checked(
        &self,
        session: &Session,
        room: Room,
        mark: u64,
    ) -> Result<bool, RealtimeError> {
        let outcome = self.rooms.join_room_if(session.connection_id, room, || {
            !self.revoked_since(session.user_id, room, mark)
        });
        match outcome {
            JoinOutcome::Joined => Ok(true),
            JoinOutcome::NotAttached => Ok(false),
            JoinOutcome::Refused => Err(RealtimeError::AuthorizationViolation { room }),
        }
    }

    pub fn leave_room(&self, connection_id: ConnectionId, room: Room) -> bool {
        self.rooms.leave_room(connection_id, room)
    }

    /// Union of the rooms across all of the user's live connections.
    pub fn rooms_of_user(&self, user_id: UserId) -> HashSet<Room> {
        self.rooms
            .rooms_of_all(self.registry.connections_for(user_id))
    }

    /// Membership revoked in the store: pull every device of the user out of
    /// the room.
    pub fn evict_membership(&self, user_id: UserId, room: Room) -> EvictionOutcome {
        // Recorded before looking for connections; see `admit_since`.
        let seq = self.revoke_seq.fetch_add(1, Ordering::AcqRel) + 1;
        self.revocations.insert((user_id, room), (seq, Instant::now()));

        let connections = self.registry.connections_for(user_id);
        let evicted = self.rooms.evict(connections, room);
        if evicted == 0 {
            tracing::debug!(user_id = %user_id, room = %room, "eviction found no live membership");
            return EvictionOutcome::NoLiveMembership;
        }
        metrics::record_evictions(evicted);
        tracing::info!(user_id = %user_id, room = %room, evicted, "membership evicted");
        EvictionOutcome::Evicted(evicted)
    }

    /// Membership created in the store: join every live device of the user.
    /// Returns how many connections are now in the room.
    pub fn grant_membership(&self, user_id: UserId, room: Room) -> usize {
        let joined = self
            .registry
            .connections_for(user_id)
            .into_iter()
            .filter(|connection_id| self.rooms.join_room(*connection_id, room))
            .count();
        tracing::info!(user_id = %user_id, room = %room, joined, "membership granted");
        joined
    }

    /// The room's entity was deleted. Returns how many connections were in it.
    pub fn close_room(&self, room: Room) -> usize {
        let removed = self.rooms.close_room(room).len();
        tracing::info!(room = %room, removed, "room closed");
        removed
    }

    /// Forward a typing pulse to the room (minus the typist) and arm the
    /// expiry timer. Needs a Tokio runtime.
    pub fn typing_start(&self, session: &Session, room: Room) -> usize {
        let user_id = session.user_id;
        let origin = session.connection_id;
        let generation = self.presence.typing_started(user_id, room);
        let envelope = EventEnvelope::typing(EventKind::TypingStart, room, user_id);
        let attempted = self.broadcaster.publish_envelope(room, &envelope, Some(origin));

        let presence = self.presence.clone();
        let broadcaster = self.broadcaster.clone();
        let timeout = presence.typing_timeout();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if presence.expire_typing(user_id, room, generation) {
                tracing::debug!(user_id = %user_id, room = %room, "typing expired");
                let envelope = EventEnvelope::typing(EventKind::TypingStop, room, user_id);
                broadcaster.publish_envelope(room, &envelope, Some(origin));
            }
        });

        attempted
    }

    pub fn typing_stop(&self, session: &Session, room: Room) -> usize {
        self.presence.typing_stopped(session.user_id, room);
        let envelope = EventEnvelope::typing(EventKind::TypingStop, room, session.user_id);
        self.broadcaster
            .publish_envelope(room, &envelope, Some(session.connection_id))
    }

    pub fn touch(&self, connection_id: ConnectionId) -> bool {
        self.registry.touch(connection_id)
    }

    /// Tear down every connection idle for at least `max_idle`.
    pub fn reap_idle(&self, max_idle: Duration) -> usize {
        let idle = self.registry.idle_connections(max_idle);
        if idle.is_empty() {
            return 0;
        }
        let reaped = self.broadcaster.teardown(idle);
        tracing::info!(reaped, "reaped idle connections");
        reaped
    }

    /// Forget revocations older than the retention window.
    pub fn prune_revocations(&self) -> usize {
        let retention = self.settings.revocation_retention;
        let before = self.revocations.len();
        self.revocations
            .retain(|_, (_, recorded_at)| recorded_at.elapsed() < retention);
        before.saturating_sub(self.revocations.len())
    }

    /// Run [`reap_idle`](Self::reap_idle) and revocation pruning every `every`.
    pub fn spawn_idle_sweeper(hub: Arc<Self>, every: Duration, max_idle: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if hub.is_shutting_down() {
                    break;
                }
                hub.reap_idle(max_idle);
                hub.prune_revocations();
            }
        })
    }

    pub fn connection_info(&self, connection_id: ConnectionId) -> Option<ConnectionInfo> {
        self.registry.info(connection_id)
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            connections: self.registry.connection_count(),
            online_users: self.registry.online_user_count(),
            rooms: self.rooms.room_count(),
            shutting_down: self.is_shutting_down(),
        }
    }

    /// Refuse new admissions and close every connection. Dropping the
    /// registry handles ends each outbound stream, which makes the socket
    /// actors close. No presence events are sent. Returns how many
    /// connections were closed.
    pub fn shutdown(&self) -> usize {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return 0;
        }
        let mut closed = 0;
        for connection_id in self.registry.connection_ids() {
            if self.registry.unregister(connection_id, &mut NoPresence).is_some() {
                closed += 1;
            }
            self.rooms.leave_all(connection_id);
        }
        tracing::info!(closed, "realtime hub shut down");
        closed
    }
}
