//! Connection registry: which live sockets each user currently owns.
//!
//! Two indices, both sharded by `DashMap`:
//! - `connections`: connection id -> handle (owner, outbound queue, activity)
//! - `by_user`: user id -> set of connection ids
//!
//! Presence transitions are reported to a [`PresenceObserver`] while the
//! user's `by_user` entry is locked, so online/offline for one user are
//! observed in the order they happened. Observers must not touch `by_user`.

use crate::error::{DeliveryFailure, RealtimeError};
use crate::metrics;
use crate::models::{ConnectionId, UserId};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::Instant;

/// Receives first-connection / last-connection transitions.
pub trait PresenceObserver {
    fn came_online(&mut self, user_id: UserId, connection_id: ConnectionId);
    fn went_offline(&mut self, user_id: UserId, connection_id: ConnectionId);
}

/// Observer that ignores transitions (shutdown, tests).
pub struct NoPresence;

impl PresenceObserver for NoPresence {
    fn came_online(&mut self, _user_id: UserId, _connection_id: ConnectionId) {}
    fn went_offline(&mut self, _user_id: UserId, _connection_id: ConnectionId) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Queued,
    /// Not registered (never was, or already torn down).
    Gone,
    Failed(DeliveryFailure),
}

struct ConnectionHandle {
    user_id: UserId,
    connected_at: DateTime<Utc>,
    /// Milliseconds since the registry epoch.
    last_activity_ms: AtomicU64,
    sender: mpsc::Sender<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub connection_id: ConnectionId,
    pub user_id: UserId,
    pub connected_at: DateTime<Utc>,
    pub idle_ms: u64,
}

pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, ConnectionHandle>,
    by_user: DashMap<UserId, HashSet<ConnectionId>>,
    epoch: Instant,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            by_user: DashMap::new(),
            epoch: Instant::now(),
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Add a connection under a user. The first connection of a user fires
    /// `came_online` before this returns.
    pub fn register(
        &self,
        user_id: UserId,
        connection_id: ConnectionId,
        sender: mpsc::Sender<String>,
        observer: &mut dyn PresenceObserver,
    ) -> Result<(), RealtimeError> {
        match self.connections.entry(connection_id) {
            Entry::Occupied(_) => {
                tracing::error!(
                    connection_id = %connection_id,
                    user_id = %user_id,
                    "duplicate connection id, rejecting new connection"
                );
                return Err(RealtimeError::DuplicateConnection(connection_id));
            }
            Entry::Vacant(slot) => {
                slot.insert(ConnectionHandle {
                    user_id,
                    connected_at: Utc::now(),
                    last_activity_ms: AtomicU64::new(self.now_ms()),
                    sender,
                });
            }
        }

        {
            let mut conns = self.by_user.entry(user_id).or_default();
            conns.insert(connection_id);
            if conns.len() == 1 {
                observer.came_online(user_id, connection_id);
            }
        }

        self.update_gauges();
        tracing::debug!(connection_id = %connection_id, user_id = %user_id, "connection registered");
        Ok(())
    }

    /// Remove a connection. Absent ids are ignored so duplicate disconnect
    /// signals are harmless. Returns the owner if something was removed.
    pub fn unregister(
        &self,
        connection_id: ConnectionId,
        observer: &mut dyn PresenceObserver,
    ) -> Option<UserId> {
        let (_, handle) = self.connections.remove(&connection_id)?;
        let user_id = handle.user_id;

        if let Some(mut conns) = self.by_user.get_mut(&user_id) {
            conns.remove(&connection_id);
            if conns.is_empty() {
                observer.went_offline(user_id, connection_id);
            }
        }
        self.by_user.remove_if(&user_id, |_, conns| conns.is_empty());

        self.update_gauges();
        tracing::debug!(connection_id = %connection_id, user_id = %user_id, "connection unregistered");
        Some(user_id)
    }

    pub fn connections_for(&self, user_id: UserId) -> HashSet<ConnectionId> {
        self.by_user
            .get(&user_id)
            .map(|conns| conns.value().clone())
            .unwrap_or_default()
    }

    pub fn is_online(&self, user_id: UserId) -> bool {
        self.by_user
            .get(&user_id)
            .map(|conns| !conns.is_empty())
            .unwrap_or(false)
    }

    pub fn is_registered(&self, connection_id: ConnectionId) -> bool {
        self.connections.contains_key(&connection_id)
    }

    pub fn owner_of(&self, connection_id: ConnectionId) -> Option<UserId> {
        self.connections.get(&connection_id).map(|h| h.user_id)
    }

    /// Queue a frame without waiting. A full queue counts as a failure so
    /// one slow client never stalls a broadcast.
    pub fn try_send(&self, connection_id: ConnectionId, frame: String) -> SendOutcome {
        let Some(handle) = self.connections.get(&connection_id) else {
            return SendOutcome::Gone;
        };
        match handle.sender.try_send(frame) {
            Ok(()) => SendOutcome::Queued,
            Err(TrySendError::Full(_)) => SendOutcome::Failed(DeliveryFailure::Backpressure),
            Err(TrySendError::Closed(_)) => SendOutcome::Failed(DeliveryFailure::Closed),
        }
    }

    /// Record inbound activity (any client frame or heartbeat reply).
    pub fn touch(&self, connection_id: ConnectionId) -> bool {
        match self.connections.get(&connection_id) {
            Some(handle) => {
                handle.last_activity_ms.store(self.now_ms(), Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    pub fn idle_connections(&self, max_idle: Duration) -> Vec<ConnectionId> {
        let now = self.now_ms();
        let max_idle = max_idle.as_millis() as u64;
        self.connections
            .iter()
            .filter(|entry| {
                now.saturating_sub(entry.last_activity_ms.load(Ordering::Relaxed)) >= max_idle
            })
            .map(|entry| *entry.key())
            .collect()
    }

    pub fn info(&self, connection_id: ConnectionId) -> Option<ConnectionInfo> {
        let now = self.now_ms();
        self.connections.get(&connection_id).map(|h| ConnectionInfo {
            connection_id,
            user_id: h.user_id,
            connected_at: h.connected_at,
            idle_ms: now.saturating_sub(h.last_activity_ms.load(Ordering::Relaxed)),
        })
    }

    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.connections.iter().map(|entry| *entry.key()).collect()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn online_user_count(&self) -> usize {
        self.by_user.len()
    }

    fn update_gauges(&self) {
        metrics::set_active_connections(self.connection_count());
        metrics::set_online_users(self.online_user_count());
    }
}
