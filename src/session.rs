//! Caller side of a chat exchange: runs the provider on its own task,
//! forwards tokens to the output and keeps the conversation for history.

use log::{ debug, warn };
use std::io::{ self, Write };
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::history::{ HistoryStore, StoreError };
use crate::llm::chat::{ ChatError, ChatProvider, ChatRequest, Message, DEFAULT_CHANNEL_BUFFER };
use crate::models::chat::Conversation;
use crate::stream::TokenWriter;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Chat(#[from] ChatError),

    #[error("failed to write output: {0}")]
    Output(#[from] io::Error),

    #[error("chat task failed: {0}")]
    Task(String),
}

/// Streams one reply to `writer` and returns the full text.
///
/// Tokens stop being written as soon as `cancel` fires. A failing writer
/// cancels the provider.
pub async fn stream_reply<W: Write>(
    provider: Arc<dyn ChatProvider>,
    cancel: &CancellationToken,
    request: ChatRequest,
    writer: &mut TokenWriter<W>
) -> Result<String, SessionError> {
    let (tx, mut rx) = mpsc::channel(DEFAULT_CHANNEL_BUFFER);
    let task_cancel = cancel.child_token();
    let chat_cancel = task_cancel.clone();
    let handle = tokio::spawn(async move { provider.chat(&chat_cancel, &request, tx).await });

    let mut response = String::new();
    let mut output_error = None;
    loop {
        let token = tokio::select! {
            biased;
            _ = task_cancel.cancelled() => break,
            token = rx.recv() => token,
        };
        let Some(token) = token else {
            break;
        };
        if let Err(e) = writer.write(&token) {
            output_error = Some(e);
            task_cancel.cancel();
            break;
        }
        response.push_str(&token);
    }
    drop(rx);
    writer.flush();

    let result = handle.await.map_err(|e| SessionError::Task(e.to_string()))?;
    if let Some(e) = output_error {
        return Err(e.into());
    }
    result?;
    Ok(response)
}

pub struct ChatSession {
    provider: Arc<dyn ChatProvider>,
    model: String,
    temperature: f64,
    max_tokens: Option<u32>,
    system_prompt: Option<String>,
    conversation: Conversation,
}

impl ChatSession {
    pub fn new(provider: Arc<dyn ChatProvider>, model: String, system_prompt: Option<String>) -> Self {
        let conversation = Self::fresh_conversation(&provider, &model, system_prompt.as_deref());
        Self {
            provider,
            model,
            temperature: 0.0,
            max_tokens: None,
            system_prompt,
            conversation,
        }
    }

    /// Continues a stored conversation; its messages become the context.
    pub fn resume(provider: Arc<dyn ChatProvider>, model: String, conversation: Conversation) -> Self {
        Self {
            provider,
            model,
            temperature: 0.0,
            max_tokens: None,
            system_prompt: None,
            conversation,
        }
    }

    pub fn with_sampling(mut self, temperature: f64, max_tokens: Option<u32>) -> Self {
        self.temperature = temperature;
        self.max_tokens = max_tokens;
        self
    }

    fn fresh_conversation(
        provider: &Arc<dyn ChatProvider>,
        model: &str,
        system_prompt: Option<&str>
    ) -> Conversation {
        let mut conversation = Conversation::new(model, provider.name());
        if let Some(system) = system_prompt.filter(|s| !s.is_empty()) {
            conversation.push("system", system);
        }
        conversation
    }

    /// Drops the context and starts a new conversation.
    pub fn reset(&mut self) {
        self.conversation = Self::fresh_conversation(
            &self.provider,
            &self.model,
            self.system_prompt.as_deref()
        );
    }

    pub fn set_model(&mut self, model: impl Into<String>) {
        self.model = model.into();
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.name()
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    /// Sends `prompt` with the conversation so far as context. The user
    /// message and the reply join the conversation only on success.
    pub async fn turn<W: Write>(
        &mut self,
        prompt: &str,
        cancel: &CancellationToken,
        writer: &mut TokenWriter<W>
    ) -> Result<String, SessionError> {
        let mut messages = self.conversation.provider_messages();
        messages.push(Message::user(prompt));
        let request = ChatRequest {
            messages,
            model: self.model.clone(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };

        let reply = stream_reply(self.provider.clone(), cancel, request, writer).await?;
        self.conversation.push("user", prompt);
        self.conversation.push("assistant", reply.clone());
        Ok(reply)
    }

    /// Saves the messages added since the last save.
    pub async fn persist(&mut self, store: &dyn HistoryStore) -> Result<i64, StoreError> {
        let id = store.save_conversation(&mut self.conversation).await?;
        debug!("Conversation {} saved", id);
        Ok(id)
    }

    /// Like [`ChatSession::persist`], but a failure only produces a warning.
    pub async fn persist_or_warn(&mut self, store: &dyn HistoryStore) -> Option<i64> {
        match self.persist(store).await {
            Ok(id) => Some(id),
            Err(e) => {
                warn!("failed to save to history: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crate::history::SqliteHistoryStore;
    use std::sync::Mutex;

    /// Replays canned tokens, or fails with the given status.
    struct ScriptedProvider {
        tokens: Vec<&'static str>,
        fail_with: Option<u16>,
        seen: Mutex<Vec<ChatRequest>>,
    }

    impl ScriptedProvider {
        fn replying(tokens: Vec<&'static str>) -> Arc<Self> {
            Arc::new(Self { tokens, fail_with: None, seen: Mutex::new(Vec::new()) })
        }

        fn failing(status: u16) -> Arc<Self> {
            Arc::new(Self { tokens: vec!["partial"], fail_with: Some(status), seen: Mutex::new(Vec::new()) })
        }
    }

    #[async_trait]
    impl ChatProvider for ScriptedProvider {
        async fn chat(
            &self,
            cancel: &CancellationToken,
            request: &ChatRequest,
            tokens: mpsc::Sender<String>
        ) -> Result<(), ChatError> {
            self.seen.lock().unwrap().push(request.clone());
            for token in &self.tokens {
                if cancel.is_cancelled() {
                    return Err(ChatError::Cancelled);
                }
                tokens.send(token.to_string()).await.map_err(|_| ChatError::Cancelled)?;
            }
            match self.fail_with {
                Some(status) => Err(crate::llm::chat::status_error(crate::llm::LlmType::OpenAI, status, String::new())),
                None => Ok(()),
            }
        }

        fn models(&self) -> &'static [&'static str] {
            &["scripted-1"]
        }

        fn name(&self) -> &'static str {
            "scripted"
        }
    }

    #[tokio::test]
    async fn reply_is_streamed_and_buffered() {
        let provider = ScriptedProvider::replying(vec!["Hel", "lo", "!"]);
        let mut writer = TokenWriter::new(Vec::new(), false);
        let reply = stream_reply(provider, &CancellationToken::new(), ChatRequest::default(), &mut writer)
            .await
            .unwrap();

        assert_eq!(reply, "Hello!");
        assert_eq!(writer.into_inner(), b"Hello!\n");
    }

    #[tokio::test]
    async fn provider_errors_surface_once() {
        let provider = ScriptedProvider::failing(429);
        let mut writer = TokenWriter::new(Vec::new(), true);
        let err = stream_reply(provider, &CancellationToken::new(), ChatRequest::default(), &mut writer)
            .await
            .unwrap_err();
        match err {
            SessionError::Chat(e) => assert!(e.is_provider_unavailable()),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancelled_before_start_writes_nothing() {
        let provider = ScriptedProvider::replying(vec!["a", "b"]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut writer = TokenWriter::new(Vec::new(), true);
        let err = stream_reply(provider, &cancel, ChatRequest::default(), &mut writer).await.unwrap_err();
        assert!(matches!(err, SessionError::Chat(ChatError::Cancelled)));
        assert!(writer.into_inner().is_empty());
    }

    #[tokio::test]
    async fn turns_accumulate_context_and_persist_incrementally() {
        let provider = ScriptedProvider::replying(vec!["ok"]);
        let store = SqliteHistoryStore::open_in_memory().unwrap();
        let mut session = ChatSession::new(provider.clone(), "scripted-1".into(), Some("be brief".into()));
        let mut writer = TokenWriter::new(Vec::new(), true);
        let cancel = CancellationToken::new();

        session.turn("first", &cancel, &mut writer).await.unwrap();
        let id = session.persist(&store).await.unwrap();
        session.turn("second", &cancel, &mut writer).await.unwrap();
        assert_eq!(session.persist(&store).await.unwrap(), id);

        let seen = provider.seen.lock().unwrap();
        let roles: Vec<_> = seen[1].messages.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, ["system", "user", "assistant", "user"]);
        drop(seen);

        let stored = store.get_conversation(id).await.unwrap();
        assert_eq!(stored.title, "first");
        assert_eq!(stored.provider, "scripted");
        assert_eq!(stored.messages.len(), 5);
    }

    #[tokio::test]
    async fn failed_turn_leaves_context_untouched() {
        let provider = ScriptedProvider::failing(500);
        let mut session = ChatSession::new(provider, "scripted-1".into(), None);
        let mut writer = TokenWriter::new(Vec::new(), true);

        assert!(session.turn("hello", &CancellationToken::new(), &mut writer).await.is_err());
        assert!(session.conversation().messages.is_empty());
    }

    #[tokio::test]
    async fn reset_keeps_system_prompt_only() {
        let provider = ScriptedProvider::replying(vec!["ok"]);
        let mut session = ChatSession::new(provider, "scripted-1".into(), Some("sys".into()));
        let mut writer = TokenWriter::new(Vec::new(), true);
        session.turn("q", &CancellationToken::new(), &mut writer).await.unwrap();

        session.reset();
        let conv = session.conversation();
        assert_eq!(conv.id, None);
        assert_eq!(conv.messages.len(), 1);
        assert_eq!(conv.messages[0].role, "system");
    }
}
