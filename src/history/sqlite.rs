//! SQLite-backed [`HistoryStore`].
//!
//! Migration is applied inline via `include_str!` on open. Messages are
//! upserted by uid, so persisting the same message after a status change
//! updates the row instead of duplicating it.

use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::{debug, trace};

use super::{HistoryError, HistoryStore};
use crate::chat::{ChatSummary, Direction, Message, MessageStatus};

/// Row type for chat queries.
type ChatRow = (String, Option<String>, String, i64, bool);

/// Row type for message queries.
type MessageRow = (
    String,
    String,
    String,
    String,
    Option<String>,
    String,
    Option<String>,
);

/// A message row as stored on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    /// Persistence uid.
    pub uid: String,
    /// Inbound or outbound.
    pub direction: Direction,
    /// Last persisted status.
    pub status: MessageStatus,
    /// Text body.
    pub body: String,
    /// Sender number for inbound messages.
    pub sender: Option<String>,
    /// RFC 3339 send/receive time.
    pub sent_at: String,
    /// RFC 3339 delivery time, if reported.
    pub delivered_at: Option<String>,
}

/// Chat history in a SQLite database.
#[derive(Debug, Clone)]
pub struct SqliteHistory {
    pool: SqlitePool,
}

impl SqliteHistory {
    /// Open (or create) the history database at `path` and apply the schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migration fails.
    pub async fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create history directory {}", parent.display())
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .pragma("foreign_keys", "ON");

        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open history db at {}", path.display()))?;

        Self::with_pool(pool).await
    }

    /// Open a private in-memory database (one connection, so one database).
    ///
    /// # Errors
    ///
    /// Returns an error if the pool cannot be created or migration fails.
    pub async fn in_memory() -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(":memory:")
            .pragma("foreign_keys", "ON");
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("failed to open in-memory history db")?;
        Self::with_pool(pool).await
    }

    /// Wrap an existing pool, applying the schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the migration fails.
    pub async fn with_pool(pool: SqlitePool) -> anyhow::Result<Self> {
        let schema = include_str!("../../migrations/001_schema.sql");
        sqlx::raw_sql(schema)
            .execute(&pool)
            .await
            .context("failed to apply history schema")?;
        debug!("history schema applied");
        Ok(Self { pool })
    }

    /// Returns a reference to the underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Load a chat's stored messages, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError`] on database failure or undecodable rows.
    pub async fn messages(&self, chat_key: &str) -> Result<Vec<StoredMessage>, HistoryError> {
        let rows: Vec<MessageRow> = sqlx::query_as(
            "SELECT uid, direction, status, body, sender, sent_at, delivered_at \
             FROM messages WHERE chat_key = ?1 ORDER BY sent_at ASC, rowid ASC",
        )
        .bind(chat_key)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(
                |(uid, direction, status, body, sender, sent_at, delivered_at)| {
                    Ok(StoredMessage {
                        uid,
                        direction: Direction::parse(&direction).ok_or(HistoryError::Corrupt {
                            field: "direction",
                            value: direction.clone(),
                        })?,
                        status: MessageStatus::parse(&status).ok_or(HistoryError::Corrupt {
                            field: "status",
                            value: status.clone(),
                        })?,
                        body,
                        sender,
                        sent_at,
                        delivered_at,
                    })
                },
            )
            .collect()
    }

    async fn upsert_chat<'e, E>(executor: E, chat: &ChatSummary) -> Result<(), HistoryError>
    where
        E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
    {
        let members = serde_json::to_string(&chat.members).unwrap_or_else(|_| "[]".to_owned());
        sqlx::query(
            "INSERT INTO chats (key, name, members, unread_count, archived, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, datetime('now')) \
             ON CONFLICT(key) DO UPDATE SET name = excluded.name, \
                 unread_count = excluded.unread_count, archived = excluded.archived, \
                 updated_at = excluded.updated_at",
        )
        .bind(&chat.key)
        .bind(&chat.name)
        .bind(members)
        .bind(i64::from(chat.unread_count))
        .bind(chat.archived)
        .execute(executor)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl HistoryStore for SqliteHistory {
    async fn add_message(&self, chat: &ChatSummary, message: &Message) -> Result<(), HistoryError> {
        let mut tx = self.pool.begin().await?;
        Self::upsert_chat(&mut *tx, chat).await?;
        sqlx::query(
            "INSERT INTO messages \
                 (uid, chat_key, direction, kind, status, body, sender, sent_at, delivered_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
             ON CONFLICT(uid) DO UPDATE SET status = excluded.status, \
                 delivered_at = excluded.delivered_at",
        )
        .bind(&message.uid)
        .bind(&chat.key)
        .bind(message.direction.as_str())
        .bind(message.kind.as_str())
        .bind(message.status.as_str())
        .bind(&message.body)
        .bind(&message.sender)
        .bind(message.timestamp.to_rfc3339())
        .bind(message.delivered_at.map(|t| t.to_rfc3339()))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        trace!(uid = %message.uid, chat = %chat.key, status = message.status.as_str(), "message persisted");
        Ok(())
    }

    async fn load_chats(&self) -> Result<Vec<ChatSummary>, HistoryError> {
        let rows: Vec<ChatRow> = sqlx::query_as(
            "SELECT key, name, members, unread_count, archived FROM chats ORDER BY updated_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut chats = Vec::with_capacity(rows.len());
        for (key, name, members, unread, archived) in rows {
            let members: Vec<String> =
                serde_json::from_str(&members).map_err(|_| HistoryError::Corrupt {
                    field: "members",
                    value: members.clone(),
                })?;
            let last_message: Option<(String,)> = sqlx::query_as(
                "SELECT body FROM messages WHERE chat_key = ?1 \
                 ORDER BY sent_at DESC, rowid DESC LIMIT 1",
            )
            .bind(&key)
            .fetch_optional(&self.pool)
            .await?;
            chats.push(ChatSummary {
                key,
                members,
                name,
                unread_count: u32::try_from(unread).unwrap_or(0),
                archived,
                last_message: last_message.map(|(body,)| body),
            });
        }
        Ok(chats)
    }

    async fn delete_chat(&self, key: &str) -> Result<(), HistoryError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM messages WHERE chat_key = ?1")
            .bind(key)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM chats WHERE key = ?1")
            .bind(key)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        debug!(chat = key, "chat deleted from history");
        Ok(())
    }

    async fn update_chat(&self, chat: &ChatSummary) -> Result<(), HistoryError> {
        Self::upsert_chat(&self.pool, chat).await
    }
}
