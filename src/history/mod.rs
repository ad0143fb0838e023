//! Persistent chat history.
//!
//! The account never writes storage directly; it goes through a
//! [`HistoryStore`]. The success of [`HistoryStore::add_message`] decides
//! whether a modem or delegate queue entry may be deleted, so
//! implementations must only return `Ok` once the write is durable.

pub mod sqlite;

use async_trait::async_trait;

use crate::chat::{ChatSummary, Message};

pub use self::sqlite::SqliteHistory;

/// Errors from history persistence.
#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A stored row could not be decoded.
    #[error("corrupt {field} value: {value:?}")]
    Corrupt {
        /// Which column held the bad value.
        field: &'static str,
        /// The unexpected value.
        value: String,
    },

    /// The store refused the write (used by non-SQL stores).
    #[error("history unavailable: {0}")]
    Unavailable(String),
}

/// Storage backend for chats and messages.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Insert or update `message` in `chat`, creating or updating the chat row.
    async fn add_message(&self, chat: &ChatSummary, message: &Message) -> Result<(), HistoryError>;

    /// Load every stored chat (without messages).
    async fn load_chats(&self) -> Result<Vec<ChatSummary>, HistoryError>;

    /// Remove a chat and all of its messages.
    async fn delete_chat(&self, key: &str) -> Result<(), HistoryError>;

    /// Persist chat metadata (unread count, archive flag) without a message.
    async fn update_chat(&self, chat: &ChatSummary) -> Result<(), HistoryError>;
}
