pub mod anthropic;
pub mod openai;

use async_trait::async_trait;
use futures::{ StreamExt, TryStreamExt };
use log::debug;
use reqwest::{ RequestBuilder, Response };
use serde::{ Deserialize, Serialize };
use std::error::Error as StdError;
use std::io;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncBufRead;
use tokio::sync::mpsc;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;

use self::anthropic::AnthropicChatClient;
use self::openai::OpenAIChatClient;
use super::sse::SseError;
use super::{ LlmConfig, LlmType };

/// Capacity of the token channel between a provider task and its consumer.
pub const DEFAULT_CHANNEL_BUFFER: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new("assistant", content)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    pub model: String,
    pub temperature: f64,
    /// `None` or `Some(0)` leaves the limit to the provider's default.
    pub max_tokens: Option<u32>,
}

impl ChatRequest {
    pub(crate) fn positive_max_tokens(&self) -> Option<u32> {
        self.max_tokens.filter(|n| *n > 0)
    }
}

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("Invalid API key. Check your {}.", .provider.api_key_env())]
    Authentication {
        provider: LlmType,
    },

    #[error("Rate limited by {}. Please wait and try again.", .provider.display_name())]
    RateLimited {
        provider: LlmType,
    },

    #[error("{} service error (status {status}). Please try again later.", .provider.display_name())]
    Upstream {
        provider: LlmType,
        status: u16,
    },

    #[error("{} API error (status {status}): {body}", .provider.display_name())]
    Api {
        provider: LlmType,
        status: u16,
        body: String,
    },

    #[error("{context}: {source}")]
    Transport {
        context: &'static str,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },

    #[error("request cancelled")]
    Cancelled,

    #[error(
        "{} API key not found.\n\nSet {} environment variable or add it to ~/.config/ask/config.json:\n\n  {{ \"providers\": {{ \"{}\": {{ \"api_key\": \"your-key-here\" }} }} }}",
        .provider.display_name(),
        .provider.api_key_env(),
        .provider
    )]
    MissingApiKey {
        provider: LlmType,
    },

    #[error("Invalid API key format: {0}")]
    InvalidApiKey(#[from] reqwest::header::InvalidHeaderValue),
}

impl ChatError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ChatError::Cancelled)
    }

    /// True when the provider itself is unavailable right now, as opposed to
    /// a configuration problem on our side. Switching provider may help.
    pub fn is_provider_unavailable(&self) -> bool {
        matches!(self, ChatError::RateLimited { .. } | ChatError::Upstream { .. })
    }

    pub(crate) fn transport(
        context: &'static str,
        source: impl Into<Box<dyn StdError + Send + Sync>>
    ) -> Self {
        ChatError::Transport {
            context,
            source: source.into(),
        }
    }
}

impl From<SseError> for ChatError {
    fn from(err: SseError) -> Self {
        match err {
            SseError::Cancelled => ChatError::Cancelled,
            SseError::Io(e) => ChatError::transport("error reading stream", e),
        }
    }
}

/// One streaming chat backend.
///
/// `chat` owns `tokens` and drops it on every return path, which closes the
/// channel exactly once. Callers only ever hold the receiving end.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn chat(
        &self,
        cancel: &CancellationToken,
        request: &ChatRequest,
        tokens: mpsc::Sender<String>
    ) -> Result<(), ChatError>;

    fn models(&self) -> &'static [&'static str];

    fn name(&self) -> &'static str;
}

pub fn new_provider(config: &LlmConfig) -> Result<Arc<dyn ChatProvider>, ChatError> {
    let api_key = config.api_key
        .clone()
        .filter(|k| !k.trim().is_empty())
        .ok_or(ChatError::MissingApiKey { provider: config.llm_type })?;

    let client: Arc<dyn ChatProvider> = match config.llm_type {
        LlmType::OpenAI => {
            let specific_client = OpenAIChatClient::new(api_key, config.base_url.clone())?;
            Arc::new(specific_client)
        }
        LlmType::Anthropic => {
            let specific_client = AnthropicChatClient::new(api_key, config.base_url.clone())?;
            Arc::new(specific_client)
        }
    };
    Ok(client)
}

/// Maps a non-2xx status to the error taxonomy.
pub fn status_error(provider: LlmType, status: u16, body: String) -> ChatError {
    match status {
        401 => ChatError::Authentication { provider },
        429 => ChatError::RateLimited { provider },
        s if s >= 500 => ChatError::Upstream { provider, status: s },
        s => ChatError::Api { provider, status: s, body },
    }
}

/// Sends the request, racing it against cancellation.
pub(crate) async fn send_request(
    cancel: &CancellationToken,
    request: RequestBuilder
) -> Result<Response, ChatError> {
    let result = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(ChatError::Cancelled),
        result = request.send() => result,
    };

    result.map_err(|e| {
        if cancel.is_cancelled() {
            ChatError::Cancelled
        } else {
            ChatError::transport("failed to send request", e)
        }
    })
}

/// Passes 2xx responses through. Anything else has its body read, still
/// racing cancellation, and is mapped with [`status_error`].
pub(crate) async fn check_status(
    provider: LlmType,
    cancel: &CancellationToken,
    response: Response
) -> Result<Response, ChatError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(ChatError::Cancelled),
        body = response.text() => body.unwrap_or_default(),
    };
    debug!("{} returned status {}: {}", provider, status, body);
    Err(status_error(provider, status.as_u16(), body))
}

pub(crate) fn body_reader(response: Response) -> impl AsyncBufRead + Unpin + Send {
    let bytes = response
        .bytes_stream()
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
        .boxed();
    StreamReader::new(bytes)
}

/// Forwards one token. A dropped receiver counts as cancellation.
pub(crate) async fn send_token(
    cancel: &CancellationToken,
    tokens: &mpsc::Sender<String>,
    token: String
) -> Result<(), ChatError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ChatError::Cancelled),
        sent = tokens.send(token) => sent.map_err(|_| ChatError::Cancelled),
    }
}
