use async_trait::async_trait;
use log::debug;
use reqwest::{ Client as HttpClient, header::{ HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE } };
use serde::{ Deserialize, Serialize };
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{ body_reader, check_status, send_request, send_token, ChatError, ChatProvider, ChatRequest, Message };
use crate::llm::sse::SseReader;
use crate::llm::LlmType;

const DEFAULT_OPENAI_URL: &str = "https://api.openai.com/v1/chat/completions";
const DONE_SENTINEL: &str = "[DONE]";

const MODELS: &[&str] = &["gpt-4o", "gpt-4o-mini", "gpt-4-turbo", "gpt-3.5-turbo"];

pub struct OpenAIChatClient {
    http: HttpClient,
    url: String,
}

#[derive(Serialize)]
struct OpenAIChatRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    stream: bool,
}

#[derive(Deserialize)]
struct OpenAIStreamResponse {
    #[serde(default)]
    choices: Vec<OpenAIStreamChoice>,
}

#[derive(Deserialize)]
struct OpenAIStreamChoice {
    #[serde(default)]
    delta: OpenAIDelta,
}

#[derive(Deserialize, Default)]
struct OpenAIDelta {
    content: Option<String>,
}

impl OpenAIChatClient {
    pub fn new(api_key: String, base_url: Option<String>) -> Result<Self, ChatError> {
        let url = base_url.unwrap_or_else(|| DEFAULT_OPENAI_URL.to_string());
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(AUTHORIZATION, HeaderValue::from_str(&format!("Bearer {}", api_key))?);

        let http = HttpClient::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| ChatError::transport("failed to build HTTP client", e))?;

        Ok(Self { http, url })
    }
}

/// Extracts the token carried by one `data:` payload, if any.
fn token_from_chunk(data: &str) -> Result<Option<String>, serde_json::Error> {
    let chunk: OpenAIStreamResponse = serde_json::from_str(data)?;
    Ok(
        chunk.choices
            .into_iter()
            .next()
            .and_then(|choice| choice.delta.content)
            .filter(|content| !content.is_empty())
    )
}

#[async_trait]
impl ChatProvider for OpenAIChatClient {
    async fn chat(
        &self,
        cancel: &CancellationToken,
        request: &ChatRequest,
        tokens: mpsc::Sender<String>
    ) -> Result<(), ChatError> {
        let body = OpenAIChatRequest {
            model: &request.model,
            messages: &request.messages,
            temperature: request.temperature,
            max_tokens: request.positive_max_tokens(),
            stream: true,
        };
        debug!("OpenAI chat request: model={}, messages={}", request.model, request.messages.len());

        let builder = self.http
            .post(&self.url)
            .header(ACCEPT, "text/event-stream")
            .json(&body);
        let response = send_request(cancel, builder).await?;
        let response = check_status(LlmType::OpenAI, cancel, response).await?;

        let mut reader = SseReader::new(body_reader(response), cancel.clone());
        while let Some(line) = reader.next_line().await? {
            let Some(data) = line.strip_prefix("data: ") else {
                continue;
            };
            if data == DONE_SENTINEL {
                return Ok(());
            }

            match token_from_chunk(data) {
                Ok(Some(token)) => send_token(cancel, &tokens, token).await?,
                Ok(None) => {}
                Err(e) => debug!("Skipping malformed OpenAI chunk: {} for data: {}", e, data),
            }
        }

        Ok(())
    }

    fn models(&self) -> &'static [&'static str] {
        MODELS
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_omits_unset_max_tokens() {
        let messages = vec![Message::system("be brief"), Message::user("hi")];
        let body = OpenAIChatRequest {
            model: "gpt-4o",
            messages: &messages,
            temperature: 0.0,
            max_tokens: None,
            stream: true,
        };
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            json!({
                "model": "gpt-4o",
                "messages": [
                    { "role": "system", "content": "be brief" },
                    { "role": "user", "content": "hi" }
                ],
                "temperature": 0.0,
                "stream": true
            })
        );
    }

    #[test]
    fn zero_max_tokens_counts_as_unset() {
        let request = ChatRequest { max_tokens: Some(0), ..Default::default() };
        assert_eq!(request.positive_max_tokens(), None);
        let request = ChatRequest { max_tokens: Some(256), ..Default::default() };
        assert_eq!(request.positive_max_tokens(), Some(256));
    }

    #[test]
    fn extracts_first_choice_content() {
        let data = r#"{"choices":[{"delta":{"content":"Hel"}},{"delta":{"content":"x"}}]}"#;
        assert_eq!(token_from_chunk(data).unwrap(), Some("Hel".to_string()));
    }

    #[test]
    fn chunks_without_content_yield_nothing() {
        assert_eq!(token_from_chunk(r#"{"choices":[]}"#).unwrap(), None);
        assert_eq!(token_from_chunk(r#"{"choices":[{"delta":{}}]}"#).unwrap(), None);
        assert_eq!(token_from_chunk(r#"{"choices":[{"delta":{"content":""}}]}"#).unwrap(), None);
        assert_eq!(
            token_from_chunk(r#"{"choices":[{"delta":{"content":null},"finish_reason":"stop"}]}"#).unwrap(),
            None
        );
        assert_eq!(token_from_chunk(r#"{"id":"x"}"#).unwrap(), None);
    }

    #[test]
    fn malformed_chunks_are_errors() {
        assert!(token_from_chunk("{not json").is_err());
        assert!(token_from_chunk(r#"{"choices":"nope"}"#).is_err());
    }
}
