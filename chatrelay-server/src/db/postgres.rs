//! Postgres-backed conversation store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::{
    config::server::DatabaseConfig,
    models::{Conversation, ConversationSummary, LastMessage, Message, MessageRole, Timestamp},
};
use sqlx::{PgPool, postgres::PgPoolOptions};
use tracing::{debug, info};
use uuid::Uuid;

use crate::services::store::{ConversationStore, StoreError};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS conversations (
        id UUID PRIMARY KEY,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS messages (
        conversation_id UUID NOT NULL REFERENCES conversations (id) ON DELETE CASCADE,
        seq BIGINT NOT NULL,
        role TEXT NOT NULL CHECK (role IN ('user', 'assistant')),
        content TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        PRIMARY KEY (conversation_id, seq)
    )",
    "CREATE INDEX IF NOT EXISTS conversations_updated_at_idx
        ON conversations (updated_at DESC, id DESC)",
];

/// Creates the connection pool described by `db`.
///
/// # Errors
/// Returns an error if no URL is configured or the pool cannot connect.
pub async fn create_pool(db: &DatabaseConfig) -> Result<PgPool, sqlx::Error> {
    let url = db
        .url
        .as_deref()
        .ok_or_else(|| sqlx::Error::Configuration("database url is not configured".into()))?;
    let pool = PgPoolOptions::new()
        .max_connections(db.max_connections)
        .connect(url)
        .await?;
    metrics::gauge!("chatrelay_db_pool_max_connections").set(f64::from(db.max_connections));
    Ok(pool)
}

/// Creates the tables used by [`PgConversationStore`] when they are missing.
///
/// # Errors
/// Returns the first failing statement's error.
pub async fn ensure_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    let mut transaction = pool.begin().await?;
    for statement in SCHEMA {
        sqlx::query(statement).execute(&mut *transaction).await?;
    }
    transaction.commit().await?;
    info!(statements = SCHEMA.len(), "conversation schema ensured");
    Ok(())
}

/// Liveness probe used by `/readyz`.
///
/// # Errors
/// Returns the driver error when the database is unreachable.
pub async fn ping(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await.map(|_| ())
}

#[derive(Debug, sqlx::FromRow)]
struct ConversationRow {
    id: Uuid,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
struct MessageRow {
    seq: i64,
    role: String,
    content: String,
    created_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
struct SummaryRow {
    id: Uuid,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    messages_count: i64,
    last_role: Option<String>,
    last_content: Option<String>,
    last_created_at: Option<DateTime<Utc>>,
}

fn parse_role(raw: &str) -> Result<MessageRole, StoreError> {
    MessageRole::try_from(raw).map_err(|err| StoreError::Database(sqlx::Error::Decode(err.into())))
}

impl TryFrom<MessageRow> for Message {
    type Error = StoreError;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        Ok(Self {
            role: parse_role(&row.role)?,
            content: row.content,
            created_at: Timestamp(row.created_at),
            sequence: u64::try_from(row.seq).unwrap_or_default(),
        })
    }
}

impl TryFrom<SummaryRow> for ConversationSummary {
    type Error = StoreError;

    fn try_from(row: SummaryRow) -> Result<Self, Self::Error> {
        let last_message = match (row.last_role, row.last_content, row.last_created_at) {
            (Some(role), Some(content), Some(created_at)) => Some(LastMessage {
                role: parse_role(&role)?,
                content,
                created_at: Timestamp(created_at),
            }),
            _ => None,
        };

        Ok(Self {
            id: row.id,
            created_at: Timestamp(row.created_at),
            updated_at: Timestamp(row.updated_at),
            messages_count: usize::try_from(row.messages_count).unwrap_or_default(),
            last_message,
        })
    }
}

#[derive(Debug, Clone)]
pub struct PgConversationStore {
    pool: PgPool,
}

impl PgConversationStore {
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl ConversationStore for PgConversationStore {
    async fn create_conversation(&self) -> Result<Conversation, StoreError> {
        let now = Timestamp::now();
        let row: ConversationRow = sqlx::query_as(
            "INSERT INTO conversations (id, created_at, updated_at)
             VALUES ($1, $2, $2)
             RETURNING id, created_at, updated_at",
        )
        .bind(Uuid::new_v4())
        .bind(now.0)
        .fetch_one(&self.pool)
        .await?;

        debug!(conversation_id = %row.id, "conversation inserted");
        let mut conversation = Conversation::new(row.id, Timestamp(row.created_at));
        conversation.updated_at = Timestamp(row.updated_at);
        Ok(conversation)
    }

    async fn append_message(
        &self,
        conversation_id: Uuid,
        role: MessageRole,
        content: &str,
        created_at: Timestamp,
    ) -> Result<Conversation, StoreError> {
        let mut transaction = self.pool.begin().await?;

        // Row lock serializes sequence allocation per conversation.
        let locked: Option<(Uuid,)> =
            sqlx::query_as("SELECT id FROM conversations WHERE id = $1 FOR UPDATE")
                .bind(conversation_id)
                .fetch_optional(&mut *transaction)
                .await?;
        if locked.is_none() {
            return Err(StoreError::NotFound(conversation_id));
        }

        sqlx::query(
            "INSERT INTO messages (conversation_id, seq, role, content, created_at)
             SELECT $1, COALESCE(MAX(seq) + 1, 0), $2, $3, $4
             FROM messages WHERE conversation_id = $1",
        )
        .bind(conversation_id)
        .bind(role.as_str())
        .bind(content)
        .bind(created_at.0)
        .execute(&mut *transaction)
        .await?;

        sqlx::query(
            "UPDATE conversations SET updated_at = GREATEST(now(), $2) WHERE id = $1",
        )
        .bind(conversation_id)
        .bind(created_at.0)
        .execute(&mut *transaction)
        .await?;

        transaction.commit().await?;
        self.get_conversation(conversation_id).await
    }

    async fn get_conversation(&self, conversation_id: Uuid) -> Result<Conversation, StoreError> {
        let row: ConversationRow = sqlx::query_as(
            "SELECT id, created_at, updated_at FROM conversations WHERE id = $1",
        )
        .bind(conversation_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound(conversation_id))?;

        let messages: Vec<MessageRow> = sqlx::query_as(
            "SELECT seq, role, content, created_at FROM messages
             WHERE conversation_id = $1 ORDER BY seq ASC",
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(Conversation {
            id: row.id,
            messages: messages
                .into_iter()
                .map(Message::try_from)
                .collect::<Result<_, _>>()?,
            created_at: Timestamp(row.created_at),
            updated_at: Timestamp(row.updated_at),
        })
    }

    async fn list_conversations(
        &self,
        limit: usize,
    ) -> Result<Vec<ConversationSummary>, StoreError> {
        let rows: Vec<SummaryRow> = sqlx::query_as(
            "SELECT c.id, c.created_at, c.updated_at,
                    (SELECT COUNT(*) FROM messages m WHERE m.conversation_id = c.id) AS messages_count,
                    last.role AS last_role,
                    last.content AS last_content,
                    last.created_at AS last_created_at
             FROM conversations c
             LEFT JOIN LATERAL (
                 SELECT role, content, created_at FROM messages m
                 WHERE m.conversation_id = c.id
                 ORDER BY m.seq DESC LIMIT 1
             ) last ON TRUE
             ORDER BY c.updated_at DESC, c.id DESC
             LIMIT $1",
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ConversationSummary::try_from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary_row(last: bool) -> SummaryRow {
        let now = Utc::now();
        SummaryRow {
            id: Uuid::new_v4(),
            created_at: now,
            updated_at: now,
            messages_count: i64::from(last),
            last_role: last.then(|| "assistant".to_string()),
            last_content: last.then(|| "hi".to_string()),
            last_created_at: last.then_some(now),
        }
    }

    #[test]
    fn test_summary_rows_map_last_message() {
        let summary = ConversationSummary::try_from(summary_row(true)).unwrap();
        assert_eq!(summary.messages_count, 1);
        let last = summary.last_message.unwrap();
        assert_eq!(last.role, MessageRole::Assistant);
        assert_eq!(last.content, "hi");

        let empty = ConversationSummary::try_from(summary_row(false)).unwrap();
        assert!(empty.last_message.is_none());
    }

    #[test]
    fn test_unknown_roles_are_decode_errors() {
        let row = MessageRow {
            seq: 0,
            role: "system".into(),
            content: String::new(),
            created_at: Utc::now(),
        };
        assert!(matches!(
            Message::try_from(row),
            Err(StoreError::Database(sqlx::Error::Decode(_)))
        ));
    }

    #[test]
    fn test_schema_statements_are_single_commands() {
        for statement in SCHEMA {
            assert!(!statement.trim_end().ends_with(';'));
            assert!(!statement.contains(';'));
        }
    }

    #[tokio::test]
    async fn test_create_pool_requires_url() {
        let db = DatabaseConfig {
            url: None,
            ..DatabaseConfig::default()
        };
        assert!(matches!(
            create_pool(&db).await,
            Err(sqlx::Error::Configuration(_))
        ));
    }
}
