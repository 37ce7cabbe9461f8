//! Room keys.
//!
//! A room is a computed broadcast scope, never a persisted row. The wire form
//! is `<kind>:<uuid>`, e.g. `channel:5f0c6a2e-...`, which is also the shape the
//! write-path controllers use when they publish.

use crate::error::RealtimeError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RoomKind {
    Workspace,
    Channel,
    Conversation,
    /// Per-user inbox, used for notifications that follow the user across devices.
    UserInbox,
}

impl RoomKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoomKind::Workspace => "workspace",
            RoomKind::Channel => "channel",
            RoomKind::Conversation => "conversation",
            RoomKind::UserInbox => "user",
        }
    }
}

impl FromStr for RoomKind {
    type Err = RealtimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "workspace" => Ok(RoomKind::Workspace),
            "channel" => Ok(RoomKind::Channel),
            "conversation" => Ok(RoomKind::Conversation),
            "user" | "user-inbox" => Ok(RoomKind::UserInbox),
            other => Err(RealtimeError::InvalidRoom(format!("unknown room kind '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Room {
    pub kind: RoomKind,
    pub id: Uuid,
}

impl Room {
    pub fn new(kind: RoomKind, id: Uuid) -> Self {
        Self { kind, id }
    }

    pub fn workspace(id: Uuid) -> Self {
        Self::new(RoomKind::Workspace, id)
    }

    pub fn channel(id: Uuid) -> Self {
        Self::new(RoomKind::Channel, id)
    }

    pub fn conversation(id: Uuid) -> Self {
        Self::new(RoomKind::Conversation, id)
    }

    pub fn user_inbox(user_id: Uuid) -> Self {
        Self::new(RoomKind::UserInbox, user_id)
    }

    pub fn is_inbox_of(&self, user_id: Uuid) -> bool {
        self.kind == RoomKind::UserInbox && self.id == user_id
    }
}

impl fmt::Display for Room {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.id)
    }
}

impl FromStr for Room {
    type Err = RealtimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, id) = s
            .split_once(':')
            .ok_or_else(|| RealtimeError::InvalidRoom(format!("missing ':' in '{s}'")))?;
        let kind = kind.parse::<RoomKind>()?;
        let id = Uuid::parse_str(id)
            .map_err(|e| RealtimeError::InvalidRoom(format!("bad room id '{id}': {e}")))?;
        Ok(Room { kind, id })
    }
}

impl TryFrom<String> for Room {
    type Error = RealtimeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Room> for String {
    fn from(room: Room) -> Self {
        room.to_string()
    }
}
