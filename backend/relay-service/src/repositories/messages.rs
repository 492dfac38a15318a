use async_trait::async_trait;
use sqlx::PgPool;

use crate::error::Result;
use crate::models::Message;

/// Durable sink for successfully processed events.
///
/// `create` assigns the record's id and `received_at` timestamp and must be
/// safe to call concurrently; the pool is the only shared state.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn create(&self, email: &str, message: &str) -> Result<Message>;

    /// Read access for downstream collaborators, ordered by insertion.
    async fn get_by_email(&self, email: &str) -> Result<Vec<Message>>;
}

/// Postgres-backed message store.
#[derive(Clone)]
pub struct MessageRepository {
    pool: PgPool,
}

impl MessageRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MessageStore for MessageRepository {
    async fn create(&self, email: &str, message: &str) -> Result<Message> {
        let record = sqlx::query_as::<_, Message>(
            r#"
            INSERT INTO messages (email, message)
            VALUES ($1, $2)
            RETURNING id, email, message, received_at
            "#,
        )
        .bind(email)
        .bind(message)
        .fetch_one(&self.pool)
        .await?;

        Ok(record)
    }

    async fn get_by_email(&self, email: &str) -> Result<Vec<Message>> {
        let records = sqlx::query_as::<_, Message>(
            r#"
            SELECT id, email, message, received_at
            FROM messages
            WHERE email = $1
            ORDER BY id
            "#,
        )
        .bind(email)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }
}
