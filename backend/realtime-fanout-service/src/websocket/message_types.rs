use crate::models::{ConnectionId, Room, UserId};
use serde::{Deserialize, Serialize};

/// Inbound WebSocket intents from client to server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientIntent {
    JoinRoom { room: Room },
    LeaveRoom { room: Room },
    TypingStart { room: Room },
    TypingStop { room: Room },
}

impl ClientIntent {
    pub fn room(&self) -> Room {
        match self {
            ClientIntent::JoinRoom { room }
            | ClientIntent::LeaveRoom { room }
            | ClientIntent::TypingStart { room }
            | ClientIntent::TypingStop { room } => *room,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ClientIntent::JoinRoom { .. } => "join_room",
            ClientIntent::LeaveRoom { .. } => "leave_room",
            ClientIntent::TypingStart { .. } => "typing_start",
            ClientIntent::TypingStop { .. } => "typing_stop",
        }
    }
}

/// Server-to-client frames that are not events: handshake result, intent
/// acknowledgements and rejections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlFrame {
    #[serde(rename_all = "camelCase")]
    Ready {
        connection_id: ConnectionId,
        user_id: UserId,
        rooms: Vec<Room>,
    },
    Joined {
        room: Room,
    },
    Left {
        room: Room,
    },
    Error {
        code: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room: Option<Room>,
    },
}

impl ControlFrame {
    pub fn error(code: impl Into<String>, message: impl Into<String>, room: Option<Room>) -> Self {
        ControlFrame::Error {
            code: code.into(),
            message: message.into(),
            room,
        }
    }

    pub fn to_frame(&self) -> String {
        // Only ids and strings; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}
