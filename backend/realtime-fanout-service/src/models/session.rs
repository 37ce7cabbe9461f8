use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub type UserId = Uuid;

/// Opaque id of one live socket. Minted by the hub, unique per admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Result of credential validation, before the connection is admitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: UserId,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Identity {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            expires_at: None,
        }
    }
}

/// Typed session state for one admitted connection.
///
/// Built once at handshake and handed to every component that acts on behalf
/// of the connection, so nothing has to look the owner up again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub connection_id: ConnectionId,
    pub user_id: UserId,
    pub connected_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn new(connection_id: ConnectionId, identity: &Identity) -> Self {
        Self {
            connection_id,
            user_id: identity.user_id,
            connected_at: Utc::now(),
            expires_at: identity.expires_at,
        }
    }
}
