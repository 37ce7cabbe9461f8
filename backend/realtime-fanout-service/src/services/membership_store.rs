//! Read access to persisted memberships.
//!
//! Consulted at connect time and on explicit join requests only, never on
//! the broadcast path.

use crate::error::RealtimeError;
use crate::models::{Room, RoomKind, UserId};
use async_trait::async_trait;
use sqlx::{Pool, Postgres};
use uuid::Uuid;

#[async_trait]
pub trait MembershipStore: Send + Sync {
    /// Every room the user currently belongs to, from the source of truth.
    async fn current_rooms(&self, user_id: UserId) -> Result<Vec<Room>, RealtimeError>;

    async fn is_member(&self, user_id: UserId, room: Room) -> Result<bool, RealtimeError>;
}

const CURRENT_ROOMS_SQL: &str = r#"
SELECT 'workspace' AS kind, workspace_id AS id
  FROM core.workspace_members WHERE user_id = $1
UNION ALL
SELECT 'channel' AS kind, channel_id AS id
  FROM messaging.channel_members WHERE user_id = $1
UNION ALL
SELECT 'conversation' AS kind, conversation_id AS id
  FROM messaging.conversation_participants WHERE user_id = $1
"#;

fn membership_check_sql(kind: RoomKind) -> Option<&'static str> {
    match kind {
        RoomKind::Workspace => Some(
            "SELECT 1 FROM core.workspace_members WHERE workspace_id = $1 AND user_id = $2 LIMIT 1",
        ),
        RoomKind::Channel => Some(
            "SELECT 1 FROM messaging.channel_members WHERE channel_id = $1 AND user_id = $2 LIMIT 1",
        ),
        RoomKind::Conversation => Some(
            "SELECT 1 FROM messaging.conversation_participants WHERE conversation_id = $1 AND user_id = $2 LIMIT 1",
        ),
        RoomKind::UserInbox => None,
    }
}

#[derive(Clone)]
pub struct PgMembershipStore {
    db: Pool<Postgres>,
}

impl PgMembershipStore {
    pub fn new(db: Pool<Postgres>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl MembershipStore for PgMembershipStore {
    async fn current_rooms(&self, user_id: UserId) -> Result<Vec<Room>, RealtimeError> {
        let rows: Vec<(String, Uuid)> = sqlx::query_as(CURRENT_ROOMS_SQL)
            .bind(user_id)
            .fetch_all(&self.db)
            .await?;

        let mut rooms = Vec::with_capacity(rows.len() + 1);
        for (kind, id) in rows {
            match kind.parse::<RoomKind>() {
                Ok(kind) => rooms.push(Room::new(kind, id)),
                Err(e) => tracing::warn!(error = %e, "skipping unknown membership kind"),
            }
        }
        rooms.push(Room::user_inbox(user_id));
        Ok(rooms)
    }

    async fn is_member(&self, user_id: UserId, room: Room) -> Result<bool, RealtimeError> {
        let Some(sql) = membership_check_sql(room.kind) else {
            return Ok(room.is_inbox_of(user_id));
        };
        let rec = sqlx::query(sql)
            .bind(room.id)
            .bind(user_id)
            .fetch_optional(&self.db)
            .await?;
        Ok(rec.is_some())
    }
}
