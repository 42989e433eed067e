//! SQLite message store
//!
//! One `messages` table. `status_rank` mirrors `status` so that forward-only
//! transitions are a single conditional UPDATE.

use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tracing::info;

use super::{MessageFilter, MessageStore};
use crate::error::{RelayError, Result};
use crate::models::{ContentType, DeliveryStatus, Envelope};

type MessageRow = (String, String, String, String, String, String, String, String);

const SELECT_COLUMNS: &str =
    "SELECT id, sender, recipient, content, content_type, metadata, created_at, status FROM messages";

pub struct SqliteMessageStore {
    pool: SqlitePool,
}

impl SqliteMessageStore {
    /// Open (creating if needed) the database file at `path`.
    pub async fn open(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        let store = Self { pool };
        store.init_db().await?;
        info!("[Store] SQLite message store at {:?}", path);
        Ok(store)
    }

    /// Private in-memory database; a single connection keeps it alive.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.init_db().await?;
        Ok(store)
    }

    async fn init_db(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                sender TEXT NOT NULL,
                recipient TEXT NOT NULL,
                content TEXT NOT NULL,
                content_type TEXT NOT NULL,
                metadata TEXT NOT NULL,
                created_at TEXT NOT NULL,
                status TEXT NOT NULL,
                status_rank INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_messages_route ON messages (sender, recipient, created_at)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_recipient ON messages (recipient, created_at)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

fn envelope_from_row(row: MessageRow) -> Result<Envelope> {
    let (id, sender, recipient, content, content_type, metadata, created_at, status) = row;
    let created_at = DateTime::parse_from_rfc3339(&created_at)
        .map_err(|e| RelayError::Internal(format!("bad created_at on {id}: {e}")))?
        .with_timezone(&Utc);
    Ok(Envelope {
        sender,
        recipient,
        content,
        content_type: content_type.parse::<ContentType>()?,
        metadata: serde_json::from_str(&metadata)?,
        created_at,
        status: status.parse::<DeliveryStatus>()?,
        id,
    })
}

#[async_trait]
impl MessageStore for SqliteMessageStore {
    async fn create_message(&self, envelope: &Envelope) -> Result<String> {
        sqlx::query(
            "INSERT OR IGNORE INTO messages (id, sender, recipient, content, content_type, metadata, created_at, status, status_rank) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&envelope.id)
        .bind(&envelope.sender)
        .bind(&envelope.recipient)
        .bind(&envelope.content)
        .bind(envelope.content_type.as_str())
        .bind(serde_json::to_string(&envelope.metadata)?)
        .bind(envelope.created_at.to_rfc3339_opts(SecondsFormat::Nanos, true))
        .bind(envelope.status.as_str())
        .bind(envelope.status.rank())
        .execute(&self.pool)
        .await?;

        Ok(envelope.id.clone())
    }

    async fn update_status(&self, id: &str, status: DeliveryStatus) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE messages SET status = ?, status_rank = ? WHERE id = ? AND status_rank < ?",
        )
        .bind(status.as_str())
        .bind(status.rank())
        .bind(id)
        .bind(status.rank())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn find_messages(&self, filter: &MessageFilter) -> Result<Vec<Envelope>> {
        let mut clauses = Vec::new();
        let mut binds: Vec<String> = Vec::new();

        if let Some((a, b)) = &filter.conversation {
            clauses.push("((sender = ? AND recipient = ?) OR (sender = ? AND recipient = ?))");
            binds.extend([a.clone(), b.clone(), b.clone(), a.clone()]);
        }
        if let Some(recipient) = &filter.recipient {
            clauses.push("recipient = ?");
            binds.push(recipient.clone());
        }
        if let Some(status) = filter.status {
            clauses.push("status = ?");
            binds.push(status.as_str().to_string());
        }

        let mut sql = SELECT_COLUMNS.to_string();
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY created_at ASC, rowid ASC");
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let mut query = sqlx::query_as::<_, MessageRow>(&sql);
        for value in binds {
            query = query.bind(value);
        }
        let rows = query.fetch_all(&self.pool).await?;

        rows.into_iter().map(envelope_from_row).collect()
    }

    async fn get_message(&self, id: &str) -> Result<Option<Envelope>> {
        let sql = format!("{SELECT_COLUMNS} WHERE id = ?");
        let row: Option<MessageRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(envelope_from_row).transpose()
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChatRequest;
    use tempfile::tempdir;

    fn envelope(sender: &str, recipient: &str, content: &str) -> Envelope {
        Envelope::from_request(ChatRequest {
            sender: sender.into(),
            recipient: recipient.into(),
            content: content.into(),
            content_type: ContentType::Voice,
            metadata: serde_json::json!({ "duration": 4 }),
        })
    }

    #[tokio::test]
    async fn stored_envelope_reads_back_equal() {
        let store = SqliteMessageStore::in_memory().await.unwrap();
        let e = envelope("U1", "U2", "hi");
        store.create_message(&e).await.unwrap();

        let stored = store.get_message(&e.id).await.unwrap().unwrap();
        assert_eq!(stored, e);
    }

    #[tokio::test]
    async fn status_never_regresses() {
        let store = SqliteMessageStore::in_memory().await.unwrap();
        let e = envelope("U1", "U2", "hi");
        store.create_message(&e).await.unwrap();

        assert!(store.update_status(&e.id, DeliveryStatus::Sent).await.unwrap());
        assert!(!store.update_status(&e.id, DeliveryStatus::Sent).await.unwrap());
        assert!(!store.update_status(&e.id, DeliveryStatus::Pending).await.unwrap());

        let stored = store.get_message(&e.id).await.unwrap().unwrap();
        assert_eq!(stored.status, DeliveryStatus::Sent);
    }

    #[tokio::test]
    async fn history_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("messages.sqlite");

        let first = envelope("U1", "U2", "one");
        let second = envelope("U2", "U1", "two");
        {
            let store = SqliteMessageStore::open(&path).await.unwrap();
            store.create_message(&first).await.unwrap();
            store.create_message(&second).await.unwrap();
            store.create_message(&envelope("U1", "U3", "other")).await.unwrap();
            store.close().await;
        }

        let store = SqliteMessageStore::open(&path).await.unwrap();
        let history = store
            .find_messages(&MessageFilter::conversation("U1", "U2"))
            .await
            .unwrap();
        let contents: Vec<_> = history.iter().map(|e| e.content.as_str()).collect();
        assert_eq!(contents, vec!["one", "two"]);

        let pending = store
            .find_messages(&MessageFilter::default().with_status(DeliveryStatus::Pending).with_limit(2))
            .await
            .unwrap();
        assert_eq!(pending.len(), 2);
    }
}
