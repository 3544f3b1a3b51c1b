//! Persistence facade over SQLite. Conversations and messages only; the
//! stream path never touches the database until a turn terminates.

use crate::constants::{DB_CLEANUP_RETENTION_DAYS, DB_PRAGMAS};
use crate::types::{BeebotError, ChatMessage, Result, Role};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;

#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ConversationRecord {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub id: String,
    pub conversation_id: String,
    pub role: String,
    pub content: String,
    pub metadata: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl MessageRecord {
    pub fn to_chat_message(&self) -> ChatMessage {
        ChatMessage {
            role: Role::from_str(&self.role).unwrap_or(Role::User),
            content: Some(self.content.clone()),
            tool_call_id: None,
        }
    }
}

#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    pub async fn init<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_str = match path.as_ref().to_str() {
            Some(s) => s,
            None => {
                return Err(BeebotError::Internal(
                    "Invalid database path: Path contains non-UTF8 characters".to_string(),
                    tracing_error::SpanTrace::capture(),
                )
                .into())
            }
        };
        let url = format!("sqlite:{}?mode=rwc", path_str);
        let pool = SqlitePool::connect(&url).await?;

        for pragma in DB_PRAGMAS {
            sqlx::query(pragma).execute(&pool).await?;
        }

        if let Err(e) = sqlx::migrate!("./migrations").run(&pool).await {
            return Err(BeebotError::Internal(
                format!("Migration failed: {}", e),
                tracing_error::SpanTrace::capture(),
            )
            .into());
        }

        let storage = Self { pool };
        storage.verify_schema_version().await;
        if let Err(e) = storage.cleanup_old_data(DB_CLEANUP_RETENTION_DAYS).await {
            tracing::warn!("Database cleanup failed: {}", e);
        }
        Ok(storage)
    }

    async fn verify_schema_version(&self) {
        let version_row: std::result::Result<(String,), sqlx::Error> =
            sqlx::query_as("SELECT value FROM schema_metadata WHERE key = 'schema_version'")
                .fetch_one(&self.pool)
                .await;
        match version_row {
            Ok((version,)) => {
                tracing::info!("Database initialized. Schema version: {}", version);
            }
            Err(e) => {
                tracing::warn!("Could not verify schema version: {}", e);
            }
        }
    }

    /// Deletes conversations idle for longer than the retention window;
    /// their messages go with them via the FK cascade.
    pub async fn cleanup_old_data(&self, retention_days: i64) -> Result<()> {
        let threshold = format!("-{} days", retention_days);
        let deleted =
            sqlx::query("DELETE FROM conversations WHERE updated_at < datetime('now', ?)")
                .bind(&threshold)
                .execute(&self.pool)
                .await?;
        if deleted.rows_affected() > 0 {
            tracing::info!(
                "Cleanup complete: removed {} conversations older than {} days",
                deleted.rows_affected(),
                retention_days
            );
        }
        Ok(())
    }

    pub async fn create_conversation(&self, user_id: &str, title: &str) -> Result<ConversationRecord> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO conversations (id, user_id, title, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(user_id)
        .bind(title)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(ConversationRecord {
            id,
            user_id: user_id.to_string(),
            title: title.to_string(),
            created_at: now,
            updated_at: now,
        })
    }

    pub async fn get_conversation(&self, id: &str) -> Result<Option<ConversationRecord>> {
        let record = sqlx::query_as::<_, ConversationRecord>(
            "SELECT id, user_id, title, created_at, updated_at FROM conversations WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    /// Most recently active first.
    pub async fn list_conversations(&self, user_id: &str) -> Result<Vec<ConversationRecord>> {
        let records = sqlx::query_as::<_, ConversationRecord>(
            "SELECT id, user_id, title, created_at, updated_at FROM conversations \
             WHERE user_id = ? ORDER BY updated_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    pub async fn update_conversation_title(&self, id: &str, title: &str) -> Result<()> {
        sqlx::query("UPDATE conversations SET title = ?, updated_at = ? WHERE id = ?")
            .bind(title)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn touch_conversation(&self, id: &str) -> Result<()> {
        sqlx::query("UPDATE conversations SET updated_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_conversation(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM conversations WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn create_message(
        &self,
        conversation_id: &str,
        role: Role,
        content: &str,
        metadata: Option<&str>,
    ) -> Result<MessageRecord> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO messages (id, conversation_id, role, content, metadata, created_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(conversation_id)
        .bind(role.as_str())
        .bind(content)
        .bind(metadata)
        .bind(now)
        .execute(&self.pool)
        .await?;
        self.touch_conversation(conversation_id).await?;
        Ok(MessageRecord {
            id,
            conversation_id: conversation_id.to_string(),
            role: role.as_str().to_string(),
            content: content.to_string(),
            metadata: metadata.map(str::to_string),
            created_at: now,
        })
    }

    /// Transcript in insertion order.
    pub async fn messages_by_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<MessageRecord>> {
        let records = sqlx::query_as::<_, MessageRecord>(
            "SELECT id, conversation_id, role, content, metadata, created_at FROM messages \
             WHERE conversation_id = ? ORDER BY created_at ASC, rowid ASC",
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    pub async fn message_count(&self, conversation_id: &str) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM messages WHERE conversation_id = ?")
            .bind(conversation_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("n"))
    }
}
