use chrono::{ DateTime, Utc };
use serde::{ Serialize, Deserialize };

use crate::llm::chat::Message;

/// A message as stored in history. `id == None` means it has not been
/// persisted yet; a message with an id is never inserted again.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Option<i64>,
    pub conversation_id: Option<i64>,
    pub role: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: None,
            conversation_id: None,
            role: role.into(),
            content: content.into(),
            created_at: Utc::now(),
        }
    }

    pub fn is_persisted(&self) -> bool {
        self.id.is_some()
    }
}

impl From<&ChatMessage> for Message {
    fn from(msg: &ChatMessage) -> Self {
        Message::new(msg.role.clone(), msg.content.clone())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    /// Assigned on first save and fixed afterwards.
    pub id: Option<i64>,
    /// Empty until supplied by the caller or derived on first save.
    pub title: String,
    pub model: String,
    pub provider: String,
    pub created_at: DateTime<Utc>,
    pub messages: Vec<ChatMessage>,
}

impl Conversation {
    pub fn new(model: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            id: None,
            title: String::new(),
            model: model.into(),
            provider: provider.into(),
            created_at: Utc::now(),
            messages: Vec::new(),
        }
    }

    pub fn push(&mut self, role: impl Into<String>, content: impl Into<String>) {
        self.messages.push(ChatMessage::new(role, content));
    }

    /// Messages in the shape providers take as context.
    pub fn provider_messages(&self) -> Vec<Message> {
        self.messages.iter().map(Message::from).collect()
    }

    pub fn unsaved_count(&self) -> usize {
        self.messages.iter().filter(|m| !m.is_persisted()).count()
    }
}
