use async_trait::async_trait;
use log::debug;
use reqwest::{ Client as HttpClient, header::{ HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE } };
use serde::{ Deserialize, Serialize };
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{ body_reader, check_status, send_request, send_token, ChatError, ChatProvider, ChatRequest };
use crate::llm::sse::{ Field, SseReader };
use crate::llm::LlmType;

const DEFAULT_ANTHROPIC_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Anthropic requires `max_tokens`; used when the request leaves it unset.
pub const DEFAULT_MAX_TOKENS: u32 = 4096;

const CONTENT_BLOCK_DELTA: &str = "content_block_delta";
const MESSAGE_STOP: &str = "message_stop";

const MODELS: &[&str] = &[
    "claude-sonnet-4-20250514",
    "claude-3-5-haiku-20241022",
    "claude-3-opus-20240229",
];

pub struct AnthropicChatClient {
    http: HttpClient,
    url: String,
}

#[derive(Serialize, Debug)]
struct AnthropicRequest<'a> {
    model: &'a str,
    messages: Vec<AnthropicMessage<'a>>,
    #[serde(skip_serializing_if = "String::is_empty")]
    system: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    stream: bool,
}

#[derive(Serialize, Debug, PartialEq)]
struct AnthropicMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ContentBlockDelta {
    delta: Option<AnthropicDelta>,
}

#[derive(Deserialize)]
struct AnthropicDelta {
    #[serde(default)]
    text: String,
}

impl AnthropicChatClient {
    pub fn new(api_key: String, base_url: Option<String>) -> Result<Self, ChatError> {
        let url = base_url.unwrap_or_else(|| DEFAULT_ANTHROPIC_URL.to_string());
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(HeaderName::from_static("x-api-key"), HeaderValue::from_str(&api_key)?);
        headers.insert(
            HeaderName::from_static("anthropic-version"),
            HeaderValue::from_static(ANTHROPIC_VERSION)
        );

        let http = HttpClient::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| ChatError::transport("failed to build HTTP client", e))?;

        Ok(Self { http, url })
    }
}

/// System messages move to the top-level `system` field, joined by a blank
/// line in their original order.
fn build_request(request: &ChatRequest) -> AnthropicRequest<'_> {
    let mut system = String::new();
    let mut messages = Vec::with_capacity(request.messages.len());

    for msg in &request.messages {
        if msg.role == "system" {
            if !system.is_empty() {
                system.push_str("\n\n");
            }
            system.push_str(&msg.content);
        } else {
            messages.push(AnthropicMessage {
                role: &msg.role,
                content: &msg.content,
            });
        }
    }

    AnthropicRequest {
        model: &request.model,
        messages,
        system,
        max_tokens: request.positive_max_tokens().unwrap_or(DEFAULT_MAX_TOKENS),
        temperature: Some(request.temperature).filter(|t| *t > 0.0),
        stream: true,
    }
}

fn text_from_delta(data: &str) -> Result<Option<String>, serde_json::Error> {
    let event: ContentBlockDelta = serde_json::from_str(data)?;
    Ok(
        event.delta
            .map(|delta| delta.text)
            .filter(|text| !text.is_empty())
    )
}

#[async_trait]
impl ChatProvider for AnthropicChatClient {
    async fn chat(
        &self,
        cancel: &CancellationToken,
        request: &ChatRequest,
        tokens: mpsc::Sender<String>
    ) -> Result<(), ChatError> {
        let body = build_request(request);
        debug!("Anthropic chat request: model={}, messages={}", body.model, body.messages.len());

        let response = send_request(cancel, self.http.post(&self.url).json(&body)).await?;
        let response = check_status(LlmType::Anthropic, cancel, response).await?;

        // Each data line is handled under the most recent event name; a
        // blank line only clears that name.
        let mut reader = SseReader::new(body_reader(response), cancel.clone());
        let mut event_type: Option<String> = None;
        while let Some(field) = reader.next_field().await? {
            let data = match field {
                Field::Event(name) => {
                    event_type = Some(name);
                    continue;
                }
                Field::Blank => {
                    event_type = None;
                    continue;
                }
                Field::Data(data) => data,
            };

            match event_type.as_deref() {
                Some(CONTENT_BLOCK_DELTA) =>
                    match text_from_delta(&data) {
                        Ok(Some(text)) => send_token(cancel, &tokens, text).await?,
                        Ok(None) => {}
                        Err(e) => debug!("Skipping malformed Anthropic delta: {} for data: {}", e, data),
                    }
                Some(MESSAGE_STOP) => {
                    return Ok(());
                }
                other => debug!("Ignoring Anthropic event {:?}", other),
            }
        }

        Ok(())
    }

    fn models(&self) -> &'static [&'static str] {
        MODELS
    }

    fn name(&self) -> &'static str {
        "anthropic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::chat::Message;
    use serde_json::json;

    fn request(messages: Vec<Message>) -> ChatRequest {
        ChatRequest {
            messages,
            model: "claude-3-5-haiku-20241022".into(),
            ..Default::default()
        }
    }

    #[test]
    fn system_messages_are_lifted_in_order() {
        let req = request(vec![
            Message::system("first"),
            Message::user("hello"),
            Message::system("second"),
            Message::assistant("hi"),
        ]);
        let body = build_request(&req);

        assert_eq!(body.system, "first\n\nsecond");
        assert_eq!(
            body.messages,
            vec![
                AnthropicMessage { role: "user", content: "hello" },
                AnthropicMessage { role: "assistant", content: "hi" }
            ]
        );
    }

    #[test]
    fn defaults_max_tokens_and_omits_zero_temperature() {
        let body = serde_json::to_value(build_request(&request(vec![Message::user("q")]))).unwrap();
        assert_eq!(
            body,
            json!({
                "model": "claude-3-5-haiku-20241022",
                "messages": [{ "role": "user", "content": "q" }],
                "max_tokens": 4096,
                "stream": true
            })
        );
    }

    #[test]
    fn keeps_explicit_limits() {
        let mut req = request(vec![Message::user("q")]);
        req.max_tokens = Some(100);
        req.temperature = 0.3;
        let body = build_request(&req);
        assert_eq!(body.max_tokens, 100);
        assert_eq!(body.temperature, Some(0.3));
    }

    #[test]
    fn negative_or_zero_inputs_fall_back() {
        let mut req = request(vec![Message::user("q")]);
        req.max_tokens = Some(0);
        req.temperature = -1.0;
        let body = build_request(&req);
        assert_eq!(body.max_tokens, DEFAULT_MAX_TOKENS);
        assert_eq!(body.temperature, None);
    }

    #[test]
    fn extracts_delta_text() {
        let data = r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hi"}}"#;
        assert_eq!(text_from_delta(data).unwrap(), Some("Hi".to_string()));
        let data = r#"{"type":"content_block_delta","delta":{"type":"input_json_delta","partial_json":"{"}}"#;
        assert_eq!(text_from_delta(data).unwrap(), None);
        assert_eq!(text_from_delta(r#"{"type":"content_block_delta"}"#).unwrap(), None);
        assert!(text_from_delta("garbage").is_err());
    }
}
