mod migrations;
pub mod sqlite;

use async_trait::async_trait;
use log::info;
use std::io;
use std::path::Path;
use thiserror::Error;

use crate::models::chat::{ ChatMessage, Conversation };

pub use self::sqlite::SqliteHistoryStore;

/// Upper bound for derived conversation titles, ellipsis included.
pub const MAX_TITLE_LENGTH: usize = 50;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("conversation {0} not found")]
    NotFound(i64),

    #[error("{context}: {source}")]
    Database {
        context: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    #[error("failed to prepare history location: {0}")]
    Io(#[from] io::Error),

    #[error("history task failed: {0}")]
    Task(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Creates the conversation if it has no id yet, then appends every
    /// message without an id, all in one transaction. On success the ids
    /// and timestamps are written back into `conversation`.
    async fn save_conversation(&self, conversation: &mut Conversation) -> Result<i64, StoreError>;

    /// The conversation with all of its messages, oldest first.
    async fn get_conversation(&self, id: i64) -> Result<Conversation, StoreError>;

    /// Newest first, at most `limit`. A non-empty `search` keeps only
    /// conversations whose title or any message contains it, ignoring case.
    /// Case folding covers ASCII letters only: `"É"` does not match `"é"`.
    async fn list_conversations(
        &self,
        limit: usize,
        search: &str
    ) -> Result<Vec<Conversation>, StoreError>;
}

pub fn open_history_store(path: &Path) -> Result<SqliteHistoryStore, StoreError> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }
    info!("Opening chat history at {}", path.display());
    SqliteHistoryStore::open(path)
}

/// Collapses all whitespace runs to single spaces and cuts the result to
/// `max_len` characters, ending in `...` when something was cut.
pub fn truncate(s: &str, max_len: usize) -> String {
    let normalized = s.split_whitespace().collect::<Vec<_>>().join(" ");
    if normalized.chars().count() <= max_len {
        return normalized;
    }
    let mut out: String = normalized.chars().take(max_len.saturating_sub(3)).collect();
    out.push_str("...");
    out
}

/// Title taken from the first user message, or empty if there is none.
pub fn derive_title(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .find(|m| m.role == "user")
        .map(|m| truncate(&m.content, MAX_TITLE_LENGTH))
        .unwrap_or_default()
}
