//! Outbound event envelope.
//!
//! Every event pushed to a client has the same top-level shape:
//!
//! ```json
//! {
//!     "type": "new_message",
//!     "room": "channel:5f0c6a2e-...",
//!     "payload": { ... },
//!     "timestamp": "2025-10-26T10:30:00Z"
//! }
//! ```
//!
//! Events addressed to a user instead of a room carry `"userId"` in place of
//! `"room"`. The payload is opaque to the fan-out layer; write-path
//! controllers decide what goes in it.

use crate::models::{Room, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    // Messages
    NewMessage,
    MessageUpdated,
    MessageDeleted,
    NewDirectMessage,
    DirectMessageUpdated,
    DirectMessageDeleted,

    // Channels
    ChannelCreated,
    ChannelUpdated,
    ChannelDeleted,
    ChannelMemberAdded,
    ChannelMemberRemoved,

    // Reactions, threads, pins
    NewReaction,
    ReactionRemoved,
    NewThreadReply,
    ThreadReplyUpdated,
    ThreadReplyDeleted,
    NewPin,
    PinRemoved,

    // Users and presence
    UserStatusUpdate,
    UserOnline,
    UserOffline,
    TypingStart,
    TypingStop,

    // Notifications
    NewNotification,
    NotificationUpdated,
    AllNotificationsRead,
    NotificationPreferencesUpdated,

    // Workspaces
    WorkspaceCreated,
    WorkspaceUpdated,
    WorkspaceDeleted,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NewMessage => "new_message",
            Self::MessageUpdated => "message_updated",
            Self::MessageDeleted => "message_deleted",
            Self::NewDirectMessage => "new_direct_message",
            Self::DirectMessageUpdated => "direct_message_updated",
            Self::DirectMessageDeleted => "direct_message_deleted",
            Self::ChannelCreated => "channel_created",
            Self::ChannelUpdated => "channel_updated",
            Self::ChannelDeleted => "channel_deleted",
            Self::ChannelMemberAdded => "channel_member_added",
            Self::ChannelMemberRemoved => "channel_member_removed",
            Self::NewReaction => "new_reaction",
            Self::ReactionRemoved => "reaction_removed",
            Self::NewThreadReply => "new_thread_reply",
            Self::ThreadReplyUpdated => "thread_reply_updated",
            Self::ThreadReplyDeleted => "thread_reply_deleted",
            Self::NewPin => "new_pin",
            Self::PinRemoved => "pin_removed",
            Self::UserStatusUpdate => "user_status_update",
            Self::UserOnline => "user_online",
            Self::UserOffline => "user_offline",
            Self::TypingStart => "typing_start",
            Self::TypingStop => "typing_stop",
            Self::NewNotification => "new_notification",
            Self::NotificationUpdated => "notification_updated",
            Self::AllNotificationsRead => "all_notifications_read",
            Self::NotificationPreferencesUpdated => "notification_preferences_updated",
            Self::WorkspaceCreated => "workspace_created",
            Self::WorkspaceUpdated => "workspace_updated",
            Self::WorkspaceDeleted => "workspace_deleted",
        }
    }

    /// Kinds the server generates itself. Write-path callers may not publish these.
    pub fn is_server_generated(&self) -> bool {
        matches!(
            self,
            Self::UserOnline | Self::UserOffline | Self::TypingStart | Self::TypingStop
        )
    }
}

/// Who an envelope is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventScope {
    Room(Room),
    User(UserId),
}

#[derive(Debug, Clone)]
pub struct EventEnvelope {
    pub kind: EventKind,
    pub scope: EventScope,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl EventEnvelope {
    pub fn new(kind: EventKind, scope: EventScope, payload: Value) -> Self {
        Self {
            kind,
            scope,
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn for_room(kind: EventKind, room: Room, payload: Value) -> Self {
        Self::new(kind, EventScope::Room(room), payload)
    }

    pub fn for_user(kind: EventKind, user_id: UserId, payload: Value) -> Self {
        Self::new(kind, EventScope::User(user_id), payload)
    }

    pub fn presence(kind: EventKind, user_id: UserId) -> Self {
        Self::for_user(kind, user_id, json!({ "userId": user_id }))
    }

    pub fn typing(kind: EventKind, room: Room, user_id: UserId) -> Self {
        Self::for_room(kind, room, json!({ "userId": user_id, "room": room }))
    }

    pub fn to_value(&self) -> Value {
        let mut obj = Map::with_capacity(4);
        obj.insert("type".into(), json!(self.kind.as_str()));
        match self.scope {
            EventScope::Room(room) => obj.insert("room".into(), json!(room)),
            EventScope::User(user_id) => obj.insert("userId".into(), json!(user_id)),
        };
        obj.insert("payload".into(), self.payload.clone());
        obj.insert("timestamp".into(), json!(self.timestamp.to_rfc3339()));
        Value::Object(obj)
    }

    /// Serialized once per publish and cloned into each target queue.
    pub fn to_frame(&self) -> String {
        self.to_value().to_string()
    }
}
