use async_trait::async_trait;
use chrono::{ DateTime, SecondsFormat, Utc };
use log::debug;
use rusqlite::types::Type;
use rusqlite::{ params, Connection, OptionalExtension, Row };
use std::path::Path;
use std::sync::{ Arc, Mutex };

use super::{ derive_title, migrations, HistoryStore, StoreError };
use crate::models::chat::{ ChatMessage, Conversation };

/// SQLite-backed history. The connection sits behind a mutex and all work
/// runs on the blocking thread pool.
#[derive(Clone)]
pub struct SqliteHistoryStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteHistoryStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(db("failed to open database"))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(db("failed to open database"))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "foreign_keys", "ON").map_err(db("failed to enable foreign keys"))?;
        migrations::run(&conn).map_err(db("failed to run migrations"))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
        where
            T: Send + 'static,
            F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StoreError::Task("history connection poisoned".to_string()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

#[async_trait]
impl HistoryStore for SqliteHistoryStore {
    async fn save_conversation(&self, conversation: &mut Conversation) -> Result<i64, StoreError> {
        let mut working = conversation.clone();
        let (id, working) = self.with_conn(move |conn| {
            let id = save(conn, &mut working)?;
            Ok((id, working))
        }).await?;
        *conversation = working;
        Ok(id)
    }

    async fn get_conversation(&self, id: i64) -> Result<Conversation, StoreError> {
        self.with_conn(move |conn| get(conn, id)).await
    }

    async fn list_conversations(
        &self,
        limit: usize,
        search: &str
    ) -> Result<Vec<Conversation>, StoreError> {
        let search = search.to_string();
        self.with_conn(move |conn| list(conn, limit, &search)).await
    }
}

fn db(context: &'static str) -> impl FnOnce(rusqlite::Error) -> StoreError {
    move |source| StoreError::Database { context, source }
}

/// Fixed-width RFC 3339 so that text order is time order.
fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn timestamp_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn conversation_from_row(row: &Row<'_>) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: Some(row.get(0)?),
        title: row.get(1)?,
        model: row.get(2)?,
        provider: row.get(3)?,
        created_at: timestamp_at(row, 4)?,
        messages: Vec::new(),
    })
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<ChatMessage> {
    Ok(ChatMessage {
        id: Some(row.get(0)?),
        conversation_id: Some(row.get(1)?),
        role: row.get(2)?,
        content: row.get(3)?,
        created_at: timestamp_at(row, 4)?,
    })
}

/// The in-memory conversation is only updated once the commit succeeded, so
/// a failed save can simply be retried.
fn save(conn: &mut Connection, conversation: &mut Conversation) -> Result<i64, StoreError> {
    let tx = conn.transaction().map_err(db("failed to begin transaction"))?;

    let created = match conversation.id {
        Some(id) => {
            let exists = tx
                .query_row("SELECT 1 FROM conversations WHERE id = ?1", [id], |_| Ok(()))
                .optional()
                .map_err(db("failed to look up conversation"))?;
            if exists.is_none() {
                return Err(StoreError::NotFound(id));
            }
            None
        }
        None => {
            let title = if conversation.title.is_empty() {
                derive_title(&conversation.messages)
            } else {
                conversation.title.clone()
            };
            let created_at = Utc::now();
            tx.execute(
                "INSERT INTO conversations (title, model, provider, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![title, conversation.model, conversation.provider, format_timestamp(created_at)]
            ).map_err(db("failed to insert conversation"))?;
            Some((tx.last_insert_rowid(), title, created_at))
        }
    };
    let conversation_id = match &created {
        Some((id, _, _)) => *id,
        None => conversation.id.unwrap_or_default(),
    };

    let mut inserted = Vec::new();
    let mut last_ts: Option<DateTime<Utc>> = None;
    for (index, msg) in conversation.messages.iter().enumerate() {
        if msg.is_persisted() {
            continue;
        }
        // Clock steps backwards must not reorder messages of one save.
        let now = Utc::now();
        let created_at = last_ts.map_or(now, |last| now.max(last));
        last_ts = Some(created_at);

        tx.execute(
            "INSERT INTO messages (conversation_id, role, content, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![conversation_id, msg.role, msg.content, format_timestamp(created_at)]
        ).map_err(db("failed to insert message"))?;
        inserted.push((index, tx.last_insert_rowid(), created_at));
    }

    tx.commit().map_err(db("failed to commit transaction"))?;
    debug!("Saved conversation {} with {} new messages", conversation_id, inserted.len());

    if let Some((id, title, created_at)) = created {
        conversation.id = Some(id);
        conversation.title = title;
        conversation.created_at = created_at;
    }
    for (index, id, created_at) in inserted {
        let msg = &mut conversation.messages[index];
        msg.id = Some(id);
        msg.conversation_id = Some(conversation_id);
        msg.created_at = created_at;
    }

    Ok(conversation_id)
}

fn get(conn: &Connection, id: i64) -> Result<Conversation, StoreError> {
    let mut conversation = conn
        .query_row(
            "SELECT id, title, model, provider, created_at FROM conversations WHERE id = ?1",
            [id],
            conversation_from_row
        )
        .optional()
        .map_err(db("failed to get conversation"))?
        .ok_or(StoreError::NotFound(id))?;

    let mut stmt = conn
        .prepare(
            "SELECT id, conversation_id, role, content, created_at
             FROM messages
             WHERE conversation_id = ?1
             ORDER BY created_at ASC, id ASC"
        )
        .map_err(db("failed to get messages"))?;
    conversation.messages = stmt
        .query_map([id], message_from_row)
        .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
        .map_err(db("failed to read messages"))?;

    Ok(conversation)
}

fn list(conn: &Connection, limit: usize, search: &str) -> Result<Vec<Conversation>, StoreError> {
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    let mut stmt = conn
        .prepare(
            "SELECT c.id, c.title, c.model, c.provider, c.created_at
             FROM conversations c
             WHERE ?1 = ''
                OR instr(lower(c.title), lower(?1)) > 0
                OR EXISTS (
                    SELECT 1 FROM messages m
                    WHERE m.conversation_id = c.id
                      AND instr(lower(m.content), lower(?1)) > 0
                )
             ORDER BY c.created_at DESC, c.id DESC
             LIMIT ?2"
        )
        .map_err(db("failed to list conversations"))?;

    let conversations = stmt
        .query_map(params![search, limit], conversation_from_row)
        .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
        .map_err(db("failed to read conversations"))?;
    Ok(conversations)
}
