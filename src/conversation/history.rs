//! Durable conversation history (SQLite).

use crate::conversation::{Message, Role};
use crate::error::{MemoryError, Result};

use anyhow::Context as _;
use sqlx::{Row as _, SqlitePool};

/// Default table holding conversation messages.
pub const DEFAULT_TABLE: &str = "chat_memory";

/// Parameterized SQL for one storage table, built once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryDialect {
    pub create_table: String,
    pub select_messages: String,
    pub insert_message: String,
    pub select_conversation_ids: String,
    pub delete_messages: String,
}

impl QueryDialect {
    /// SQLite statements against `table`.
    ///
    /// The table name is interpolated, so it must be a plain identifier.
    pub fn sqlite(table: &str) -> Result<Self> {
        if !is_identifier(table) {
            return Err(crate::error::ConfigError::Invalid(format!(
                "table name must be alphanumeric or underscore, got {table:?}"
            ))
            .into());
        }

        Ok(Self {
            create_table: format!(
                "CREATE TABLE IF NOT EXISTS {table} ( \
                    conversation_id TEXT NOT NULL, \
                    insert_sequence INTEGER NOT NULL, \
                    content TEXT NOT NULL, \
                    role TEXT NOT NULL CHECK (role IN ('user', 'assistant', 'system', 'tool')), \
                    occurred_at TIMESTAMP NOT NULL, \
                    PRIMARY KEY (conversation_id, insert_sequence) \
                )"
            ),
            select_messages: format!(
                "SELECT content, role, occurred_at FROM {table} \
                 WHERE conversation_id = ? ORDER BY insert_sequence ASC"
            ),
            insert_message: format!(
                "INSERT INTO {table} (conversation_id, insert_sequence, content, role, occurred_at) \
                 VALUES (?, ?, ?, ?, ?)"
            ),
            select_conversation_ids: format!("SELECT DISTINCT conversation_id FROM {table}"),
            delete_messages: format!("DELETE FROM {table} WHERE conversation_id = ?"),
        })
    }
}

fn is_identifier(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with(|c: char| c.is_ascii_digit())
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Full conversation history keyed by conversation id.
///
/// Writes go through [`replace_all`](Self::replace_all), which swaps a
/// conversation's whole history in a single transaction. Replaying the same
/// call leaves the same state behind.
#[derive(Debug, Clone)]
pub struct MemoryRepository {
    pool: SqlitePool,
    dialect: QueryDialect,
}

impl MemoryRepository {
    pub fn new(pool: SqlitePool, dialect: QueryDialect) -> Self {
        Self { pool, dialect }
    }

    /// Create the history table if it doesn't exist.
    pub async fn initialize(&self) -> Result<()> {
        sqlx::query(&self.dialect.create_table)
            .execute(&self.pool)
            .await
            .map_err(|error| crate::error::DbError::Schema(error.to_string()))?;

        Ok(())
    }

    /// Every conversation id with at least one stored message. Unordered.
    pub async fn list_conversation_ids(&self) -> Result<Vec<String>> {
        let ids = sqlx::query_scalar::<_, String>(&self.dialect.select_conversation_ids)
            .fetch_all(&self.pool)
            .await
            .context("failed to list conversation ids")
            .map_err(MemoryError::from)?;

        Ok(ids)
    }

    /// Full history, oldest first. Unknown ids yield an empty list.
    pub async fn load(&self, conversation_id: &str) -> Result<Vec<Message>> {
        validate_conversation_id(conversation_id)?;

        let rows = sqlx::query(&self.dialect.select_messages)
            .bind(conversation_id)
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("failed to load conversation {conversation_id}"))
            .map_err(MemoryError::from)?;

        rows.into_iter().map(message_from_row).collect()
    }

    /// Atomically replace a conversation's history with `messages`.
    ///
    /// On any failure the transaction is rolled back, the previous history is
    /// untouched, and a single `PersistenceFailed` error is returned.
    pub async fn replace_all(&self, conversation_id: &str, messages: &[Message]) -> Result<()> {
        validate_conversation_id(conversation_id)?;

        if let Err(error) = self.write_all(conversation_id, messages).await {
            let reason = format!("{error:#}");
            tracing::warn!(%conversation_id, %reason, "history replace rolled back");
            return Err(MemoryError::PersistenceFailed {
                conversation_id: conversation_id.to_string(),
                reason,
            }
            .into());
        }

        tracing::debug!(%conversation_id, count = messages.len(), "history replaced");
        Ok(())
    }

    async fn write_all(&self, conversation_id: &str, messages: &[Message]) -> anyhow::Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to open history transaction")?;

        sqlx::query(&self.dialect.delete_messages)
            .bind(conversation_id)
            .execute(&mut *tx)
            .await
            .context("failed to clear previous history")?;

        for (sequence, message) in messages.iter().enumerate() {
            sqlx::query(&self.dialect.insert_message)
                .bind(conversation_id)
                .bind(sequence as i64)
                .bind(message.text())
                .bind(message.role().as_str())
                .bind(message.occurred_at())
                .execute(&mut *tx)
                .await
                .with_context(|| format!("failed to insert message #{sequence}"))?;
        }

        // Dropping `tx` on an early return rolls back.
        tx.commit()
            .await
            .context("failed to commit history transaction")?;

        Ok(())
    }

    /// Remove a conversation's history. Deleting an unknown id succeeds.
    pub async fn delete(&self, conversation_id: &str) -> Result<()> {
        validate_conversation_id(conversation_id)?;

        let result = sqlx::query(&self.dialect.delete_messages)
            .bind(conversation_id)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to delete conversation {conversation_id}"))
            .map_err(MemoryError::from)?;

        tracing::debug!(%conversation_id, removed = result.rows_affected(), "history deleted");
        Ok(())
    }
}

fn validate_conversation_id(conversation_id: &str) -> Result<()> {
    if conversation_id.trim().is_empty() {
        return Err(MemoryError::InvalidConversationId.into());
    }
    Ok(())
}

fn message_from_row(row: sqlx::sqlite::SqliteRow) -> Result<Message> {
    let role_value: String = row
        .try_get("role")
        .context("failed to read message role")
        .map_err(MemoryError::from)?;
    let role = Role::parse(&role_value).ok_or(MemoryError::UnknownRole(role_value))?;
    let content: String = row
        .try_get("content")
        .context("failed to read message content")
        .map_err(MemoryError::from)?;
    let occurred_at = row
        .try_get::<chrono::DateTime<chrono::Utc>, _>("occurred_at")
        .map_err(|error| MemoryError::CorruptRow(format!("occurred_at: {error}")))?;

    Ok(Message::new(role, content, occurred_at))
}
