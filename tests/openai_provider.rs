use ask::llm::chat::openai::OpenAIChatClient;
use ask::llm::chat::{ ChatError, ChatProvider, ChatRequest, Message };
use serde_json::json;
use std::sync::Arc;
use tokio::io::{ AsyncReadExt, AsyncWriteExt };
use tokio::net::TcpListener;
use tokio::sync::{ mpsc, Notify };
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{ body_partial_json, header, method, path };
use wiremock::{ Mock, MockServer, ResponseTemplate };

const CHAT_PATH: &str = "/v1/chat/completions";

fn client_for(server: &MockServer) -> OpenAIChatClient {
    OpenAIChatClient::new("sk-test".into(), Some(format!("{}{}", server.uri(), CHAT_PATH))).unwrap()
}

fn request() -> ChatRequest {
    ChatRequest {
        messages: vec![Message::system("be brief"), Message::user("hi")],
        model: "gpt-4o-mini".into(),
        temperature: 0.0,
        max_tokens: None,
    }
}

async fn mount_sse(server: &MockServer, body: &str) {
    Mock::given(method("POST"))
        .and(path(CHAT_PATH))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_raw(body.to_string(), "text/event-stream")
        )
        .mount(server).await;
}

/// Runs one chat call and collects everything sent on the channel.
async fn collect(client: &OpenAIChatClient, request: &ChatRequest) -> (Result<(), ChatError>, Vec<String>) {
    let (tx, mut rx) = mpsc::channel(100);
    let result = client.chat(&CancellationToken::new(), request, tx).await;
    let mut tokens = Vec::new();
    while let Some(token) = rx.recv().await {
        tokens.push(token);
    }
    (result, tokens)
}

fn chunk(content: &str) -> String {
    format!("data: {}\n\n", json!({ "choices": [{ "delta": { "content": content } }] }))
}

#[tokio::test]
async fn streams_tokens_in_order() {
    let server = MockServer::start().await;
    let body = format!(
        "data: {}\n\n{}{}{}data: [DONE]\n\n",
        json!({ "choices": [{ "delta": { "role": "assistant" } }] }),
        chunk("Hel"),
        chunk("lo"),
        chunk("!")
    );
    mount_sse(&server, &body).await;

    let (result, tokens) = collect(&client_for(&server), &request()).await;
    result.unwrap();
    assert_eq!(tokens, ["Hel", "lo", "!"]);
}

#[tokio::test]
async fn sends_auth_headers_and_streaming_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(CHAT_PATH))
        .and(header("authorization", "Bearer sk-test"))
        .and(header("accept", "text/event-stream"))
        .and(
            body_partial_json(
                json!({
                "model": "gpt-4o-mini",
                "stream": true,
                "max_tokens": 128,
                "messages": [
                    { "role": "system", "content": "be brief" },
                    { "role": "user", "content": "hi" }
                ]
            })
            )
        )
        .respond_with(ResponseTemplate::new(200).set_body_raw("data: [DONE]\n\n", "text/event-stream"))
        .expect(1)
        .mount(&server).await;

    let mut req = request();
    req.max_tokens = Some(128);
    let (result, tokens) = collect(&client_for(&server), &req).await;
    result.unwrap();
    assert!(tokens.is_empty());
}

#[tokio::test]
async fn done_sentinel_alone_completes_without_tokens() {
    let server = MockServer::start().await;
    mount_sse(&server, "data: [DONE]\n\n").await;

    let (result, tokens) = collect(&client_for(&server), &request()).await;
    result.unwrap();
    assert!(tokens.is_empty());
}

#[tokio::test]
async fn nothing_after_done_is_forwarded() {
    let server = MockServer::start().await;
    let body = format!("{}data: [DONE]\n\n{}", chunk("only"), chunk("late"));
    mount_sse(&server, &body).await;

    let (result, tokens) = collect(&client_for(&server), &request()).await;
    result.unwrap();
    assert_eq!(tokens, ["only"]);
}

#[tokio::test]
async fn skips_malformed_chunks_and_noise() {
    let server = MockServer::start().await;
    let body = format!(
        ": keep-alive\r\n\r\ndata: {{not json\n\nevent: ping\n{}data:{}\n\ndata: [DONE]\r\n\r\n",
        chunk("a"),
        json!({ "choices": [{ "delta": { "content": "ignored, no space after colon" } }] })
    );
    mount_sse(&server, &body).await;

    let (result, tokens) = collect(&client_for(&server), &request()).await;
    result.unwrap();
    assert_eq!(tokens, ["a"]);
}

#[tokio::test]
async fn end_of_stream_without_done_is_success() {
    let server = MockServer::start().await;
    mount_sse(&server, &format!("{}{}", chunk("x"), chunk("y"))).await;

    let (result, tokens) = collect(&client_for(&server), &request()).await;
    result.unwrap();
    assert_eq!(tokens, ["x", "y"]);
}

#[tokio::test]
async fn maps_error_statuses() {
    let cases: [(u16, fn(&ChatError) -> bool); 4] = [
        (401, |e| matches!(e, ChatError::Authentication { .. })),
        (429, |e| matches!(e, ChatError::RateLimited { .. })),
        (503, |e| matches!(e, ChatError::Upstream { status: 503, .. })),
        (400, |e| matches!(e, ChatError::Api { status: 400, body, .. } if body.contains("bad model"))),
    ];

    for (status, check) in cases {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(CHAT_PATH))
            .respond_with(ResponseTemplate::new(status).set_body_string("{\"error\":\"bad model\"}"))
            .mount(&server).await;

        let (result, tokens) = collect(&client_for(&server), &request()).await;
        let err = result.unwrap_err();
        assert!(check(&err), "status {} mapped to {:?}", status, err);
        assert!(tokens.is_empty());
    }
}

#[tokio::test]
async fn unreachable_endpoint_is_a_transport_error() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = OpenAIChatClient::new("sk-test".into(), Some(format!("http://{}{}", addr, CHAT_PATH))).unwrap();
    let (tx, mut rx) = mpsc::channel(1);
    let err = client.chat(&CancellationToken::new(), &request(), tx).await.unwrap_err();
    assert!(matches!(err, ChatError::Transport { .. }));
    assert_eq!(rx.recv().await, None);
}

#[tokio::test]
async fn cancellation_stops_forwarding() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let release = Arc::new(Notify::new());
    let server_release = release.clone();

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 16 * 1024];
        let _ = socket.read(&mut buf).await;
        socket
            .write_all(b"HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\nconnection: close\r\n\r\n").await
            .unwrap();
        socket.write_all(chunk("first").as_bytes()).await.unwrap();
        server_release.notified().await;
        let _ = socket.write_all(chunk("second").as_bytes()).await;
        let _ = socket.write_all(b"data: [DONE]\n\n").await;
    });

    let client = OpenAIChatClient::new("sk-test".into(), Some(format!("http://{}{}", addr, CHAT_PATH))).unwrap();
    let cancel = CancellationToken::new();
    let (tx, mut rx) = mpsc::channel(8);
    let task_cancel = cancel.clone();
    let handle = tokio::spawn(async move { client.chat(&task_cancel, &request(), tx).await });

    assert_eq!(rx.recv().await.as_deref(), Some("first"));
    cancel.cancel();
    release.notify_one();

    let result = handle.await.unwrap();
    assert!(matches!(result, Err(ChatError::Cancelled)));
    assert_eq!(rx.recv().await, None);
}

#[tokio::test]
async fn cancelled_before_request_sends_nothing() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(CHAT_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_raw("data: [DONE]\n\n", "text/event-stream"))
        .expect(0)
        .mount(&server).await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let (tx, mut rx) = mpsc::channel(1);
    let err = client_for(&server).chat(&cancel, &request(), tx).await.unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(rx.recv().await, None);
}
