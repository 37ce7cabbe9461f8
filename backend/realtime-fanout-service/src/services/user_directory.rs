//! Identity-provider subject to internal user id.

use crate::error::RealtimeError;
use crate::models::UserId;
use async_trait::async_trait;
use sqlx::{Pool, Postgres};

#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// `None` when no user is linked to the subject.
    async fn user_for_subject(&self, subject: &str) -> Result<Option<UserId>, RealtimeError>;
}

const USER_FOR_SUBJECT_SQL: &str = "SELECT user_id FROM core.users WHERE auth0_id = $1 LIMIT 1";

#[derive(Clone)]
pub struct PgUserDirectory {
    db: Pool<Postgres>,
}

impl PgUserDirectory {
    pub fn new(db: Pool<Postgres>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl UserDirectory for PgUserDirectory {
    async fn user_for_subject(&self, subject: &str) -> Result<Option<UserId>, RealtimeError> {
        let row: Option<(UserId,)> = sqlx::query_as(USER_FOR_SUBJECT_SQL)
            .bind(subject)
            .fetch_optional(&self.db)
            .await?;
        Ok(row.map(|(user_id,)| user_id))
    }
}
