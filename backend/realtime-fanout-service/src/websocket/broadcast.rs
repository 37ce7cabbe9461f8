//! Event fan-out.
//!
//! A publish snapshots the target set, releases every index lock, then queues
//! the serialized frame into each target's outbound channel. Failed targets
//! are torn down only after the loop, so one bad socket never cuts delivery
//! short for the rest of the room.

use super::events::{EventEnvelope, EventKind};
use super::message_types::ControlFrame;
use super::presence::PresenceTracker;
use super::registry::{ConnectionRegistry, SendOutcome};
use super::rooms::RoomMembership;
use crate::error::RealtimeError;
use crate::metrics;
use crate::models::{ConnectionId, Room, UserId};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;

#[derive(Debug, Default)]
pub(crate) struct FanoutReport {
    pub attempted: usize,
    pub failed: Vec<ConnectionId>,
}

/// Queue `frame` to every target. Targets that are no longer registered are
/// skipped and not counted.
pub(crate) fn fan_out<I>(registry: &ConnectionRegistry, targets: I, frame: &str) -> FanoutReport
where
    I: IntoIterator<Item = ConnectionId>,
{
    let mut report = FanoutReport::default();
    let mut queued = 0;
    for connection_id in targets {
        match registry.try_send(connection_id, frame.to_owned()) {
            SendOutcome::Queued => {
                report.attempted += 1;
                queued += 1;
            }
            SendOutcome::Gone => {}
            SendOutcome::Failed(reason) => {
                report.attempted += 1;
                let err = RealtimeError::TransientDeliveryFailure {
                    connection_id,
                    reason,
                };
                tracing::warn!(error = %err, "send failed, dropping connection");
                metrics::record_delivery_failure(reason.as_str());
                report.failed.push(connection_id);
            }
        }
    }
    metrics::record_deliveries(queued);
    report
}

#[derive(Clone)]
pub struct Broadcaster {
    registry: Arc<ConnectionRegistry>,
    rooms: Arc<RoomMembership>,
    presence: Arc<PresenceTracker>,
}

impl Broadcaster {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        rooms: Arc<RoomMembership>,
        presence: Arc<PresenceTracker>,
    ) -> Self {
        Self {
            registry,
            rooms,
            presence,
        }
    }

    /// Deliver to every connection currently in `room`. Returns the number of
    /// connections a send was attempted on.
    pub fn publish(&self, room: Room, kind: EventKind, payload: Value) -> usize {
        self.publish_envelope(room, &EventEnvelope::for_room(kind, room, payload), None)
    }

    /// Like [`publish`](Self::publish) but skips one connection, typically
    /// the one the event originated from.
    pub fn publish_except(
        &self,
        room: Room,
        kind: EventKind,
        payload: Value,
        skip: ConnectionId,
    ) -> usize {
        self.publish_envelope(room, &EventEnvelope::for_room(kind, room, payload), Some(skip))
    }

    pub(crate) fn publish_envelope(
        &self,
        room: Room,
        envelope: &EventEnvelope,
        skip: Option<ConnectionId>,
    ) -> usize {
        let mut targets = self.rooms.members_of(room);
        if let Some(skip) = skip {
            targets.remove(&skip);
        }
        let report = fan_out(&self.registry, targets, &envelope.to_frame());
        metrics::record_event_published(envelope.kind.as_str());
        tracing::debug!(
            room = %room,
            event_type = envelope.kind.as_str(),
            attempted = report.attempted,
            failed = report.failed.len(),
            "room event published"
        );
        self.teardown(report.failed);
        report.attempted
    }

    /// Deliver to every live connection of a user, regardless of rooms.
    pub fn publish_to_user(&self, user_id: UserId, kind: EventKind, payload: Value) -> usize {
        let envelope = EventEnvelope::for_user(kind, user_id, payload);
        let targets = self.registry.connections_for(user_id);
        let report = fan_out(&self.registry, targets, &envelope.to_frame());
        metrics::record_event_published(kind.as_str());
        tracing::debug!(
            user_id = %user_id,
            event_type = kind.as_str(),
            attempted = report.attempted,
            "user event published"
        );
        self.teardown(report.failed);
        report.attempted
    }

    /// Returns false when the connection is already gone, or the send failed
    /// and the connection was torn down.
    pub fn publish_to_connection(&self, connection_id: ConnectionId, envelope: &EventEnvelope) -> bool {
        metrics::record_event_published(envelope.kind.as_str());
        self.send_frame(connection_id, envelope.to_frame())
    }

    pub fn send_control(&self, connection_id: ConnectionId, frame: &ControlFrame) -> bool {
        self.send_frame(connection_id, frame.to_frame())
    }

    fn send_frame(&self, connection_id: ConnectionId, frame: String) -> bool {
        let report = fan_out(&self.registry, [connection_id], &frame);
        let delivered = report.attempted == 1 && report.failed.is_empty();
        self.teardown(report.failed);
        delivered
    }

    /// Unregister and detach connections. Offline announcements caused by the
    /// teardown can fail further connections; those are drained here too.
    /// Returns how many connections were actually removed.
    pub fn teardown<I>(&self, connections: I) -> usize
    where
        I: IntoIterator<Item = ConnectionId>,
    {
        let mut queue: VecDeque<ConnectionId> = connections.into_iter().collect();
        let mut removed = 0;
        while let Some(connection_id) = queue.pop_front() {
            let mut batch = self.presence.batch();
            let owner = self.registry.unregister(connection_id, &mut batch);
            self.rooms.leave_all(connection_id);
            queue.extend(batch.into_failed());
            if let Some(user_id) = owner {
                removed += 1;
                tracing::info!(
                    connection_id = %connection_id,
                    user_id = %user_id,
                    "connection torn down"
                );
            }
        }
        removed
    }
}
