//! Persistence collaborators: chat history and room participation.

use crate::models::ChatMessage;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::Pool;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("connection pool error: {0}")]
    Pool(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("persistence timed out")]
    Timeout,
}

impl From<deadpool_postgres::PoolError> for PersistError {
    fn from(e: deadpool_postgres::PoolError) -> Self {
        PersistError::Pool(e.to_string())
    }
}

impl From<tokio_postgres::Error> for PersistError {
    fn from(e: tokio_postgres::Error) -> Self {
        PersistError::Database(e.to_string())
    }
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Stores `message` and returns it with `id` and `created_at` assigned
    async fn persist(&self, message: ChatMessage) -> Result<ChatMessage, PersistError>;
}

#[async_trait]
pub trait MembershipStore: Send + Sync {
    async fn rooms_for_user(&self, user_id: &str) -> Result<Vec<String>, PersistError>;

    /// Idempotent
    async fn add_participant(&self, room_id: &str, user_id: &str) -> Result<(), PersistError>;

    async fn remove_participant(&self, room_id: &str, user_id: &str) -> Result<(), PersistError>;
}

#[derive(Clone)]
pub struct PgMessageStore {
    pool: Pool,
}

impl PgMessageStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MessageStore for PgMessageStore {
    async fn persist(&self, mut message: ChatMessage) -> Result<ChatMessage, PersistError> {
        let client = self.pool.get().await?;

        let row = client
            .query_one(
                r#"
                INSERT INTO chat_messages (room_id, sender_id, username, content)
                VALUES ($1, $2, $3, $4)
                RETURNING id, created_at
                "#,
                &[
                    &message.room_id,
                    &message.sender_id,
                    &message.sender_username,
                    &message.content,
                ],
            )
            .await?;

        let id: Uuid = row.get(0);
        let created_at: DateTime<Utc> = row.get(1);
        message.id = Some(id.to_string());
        message.created_at = Some(created_at);

        tracing::debug!(message_id = %id, room_id = %message.room_id, "message persisted");
        Ok(message)
    }
}

#[derive(Clone)]
pub struct PgMembershipStore {
    pool: Pool,
}

impl PgMembershipStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MembershipStore for PgMembershipStore {
    async fn rooms_for_user(&self, user_id: &str) -> Result<Vec<String>, PersistError> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT room_id FROM room_participants WHERE user_id = $1",
                &[&user_id],
            )
            .await?;

        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    async fn add_participant(&self, room_id: &str, user_id: &str) -> Result<(), PersistError> {
        let client = self.pool.get().await?;
        client
            .execute(
                r#"
                INSERT INTO room_participants (room_id, user_id)
                VALUES ($1, $2)
                ON CONFLICT (room_id, user_id) DO NOTHING
                "#,
                &[&room_id, &user_id],
            )
            .await?;
        Ok(())
    }

    async fn remove_participant(&self, room_id: &str, user_id: &str) -> Result<(), PersistError> {
        let client = self.pool.get().await?;
        client
            .execute(
                "DELETE FROM room_participants WHERE room_id = $1 AND user_id = $2",
                &[&room_id, &user_id],
            )
            .await?;
        Ok(())
    }
}
