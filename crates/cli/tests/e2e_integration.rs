//! End-to-end tests for the Elowen relay.
//!
//! Each test binds a real listener, serves the full gateway on it and talks
//! to it over a WebSocket, with a scripted backend standing in for vLLM.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use elowen_config::AppConfig;
use elowen_core::{
    Backend, BackendError, FragmentStream, GenerationParameters, StreamChunk, Turn,
};
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const SECRET: &str = "e2e-secret";

// ── Scripted Backend ─────────────────────────────────────────────────────

/// Streams the reply word by word. Input containing "hang" never answers.
struct FakeBackend;

fn reply_for(turns: &[Turn]) -> String {
    let input = turns.last().map(|t| t.content()).unwrap_or_default();
    format!("You said: {input}")
}

#[async_trait::async_trait]
impl Backend for FakeBackend {
    fn name(&self) -> &str {
        "fake"
    }

    fn model(&self) -> &str {
        "fake-1"
    }

    async fn complete_once(&self, prompt: &str, _: &GenerationParameters) -> Result<String, BackendError> {
        Ok(format!("flattened {} chars", prompt.len()))
    }

    async fn stream_complete(&self, _: &str, _: &GenerationParameters) -> Result<FragmentStream, BackendError> {
        Err(BackendError::Unavailable("not scripted".into()))
    }

    async fn chat_once(&self, turns: &[Turn], _: &GenerationParameters) -> Result<String, BackendError> {
        Ok(reply_for(turns))
    }

    async fn stream_chat(&self, turns: &[Turn], _: &GenerationParameters) -> Result<FragmentStream, BackendError> {
        let (tx, rx) = tokio::sync::mpsc::channel(16);

        if turns.last().is_some_and(|t| t.content().contains("hang")) {
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                drop(tx);
            });
            return Ok(rx);
        }

        let reply = reply_for(turns);
        tokio::spawn(async move {
            for (i, word) in reply.split(' ').enumerate() {
                let fragment = if i == 0 { word.to_string() } else { format!(" {word}") };
                if tx.send(Ok(StreamChunk::fragment(fragment))).await.is_err() {
                    return;
                }
            }
            let _ = tx.send(Ok(StreamChunk::end())).await;
        });
        Ok(rx)
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────

async fn start_relay(config: AppConfig) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = elowen_gateway::serve(listener, config, Arc::new(FakeBackend)).await;
    });
    addr
}

fn open_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.auth.require_auth = false;
    config
}

fn jwt_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.auth.jwt_secret = Some(SECRET.into());
    config
}

fn token() -> String {
    let claims = json!({
        "sub": "e2e-user",
        "exp": chrono::Utc::now().timestamp() + 3600,
    });
    jsonwebtoken::encode(
        &jsonwebtoken::Header::default(),
        &claims,
        &jsonwebtoken::EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .unwrap()
}

async fn connect(addr: SocketAddr, token: Option<&str>) -> Socket {
    let url = match token {
        Some(t) => format!("ws://{addr}/ws?token={t}"),
        None => format!("ws://{addr}/ws"),
    };
    let (socket, _) = connect_async(url).await.unwrap();
    socket
}

async fn send(socket: &mut Socket, event: Value) {
    socket
        .send(Message::Text(event.to_string().into()))
        .await
        .unwrap();
}

/// Next relay event, skipping keepalive frames.
async fn next_event(socket: &mut Socket) -> Value {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("timed out waiting for an event")
            .expect("socket closed")
            .unwrap();
        match frame {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("Unexpected frame: {other:?}"),
        }
    }
}

fn generate(event: &str, correlation_id: &str, user_input: &str) -> Value {
    json!({
        "event": event,
        "data": {
            "correlation_id": correlation_id,
            "character": {"name": "Iron Man", "personality": "Witty"},
            "history": [
                {"role": "user", "content": "hi"},
                {"role": "assistant", "content": "Hey there."}
            ],
            "user_input": user_input
        }
    })
}

// ── Streaming ────────────────────────────────────────────────────────────

#[tokio::test]
async fn e2e_stream_relays_tokens_then_result() {
    let addr = start_relay(open_config()).await;
    let mut socket = connect(addr, None).await;

    let ready = next_event(&mut socket).await;
    assert_eq!(ready["event"], "ready");
    assert_eq!(ready["data"]["backend"], "fake");
    assert_eq!(ready["data"]["model"], "fake-1");

    send(&mut socket, generate("generate_stream", "r1", "tell me a story")).await;

    let mut streamed = String::new();
    let result = loop {
        let event = next_event(&mut socket).await;
        assert_eq!(event["data"]["correlation_id"], "r1");
        match event["event"].as_str() {
            Some("token") => streamed.push_str(event["data"]["fragment"].as_str().unwrap()),
            Some("result") => break event,
            other => panic!("Unexpected event: {other:?}"),
        }
    };

    assert_eq!(streamed, "You said: tell me a story");
    assert_eq!(result["data"]["text"], "You said: tell me a story");
}

#[tokio::test]
async fn e2e_once_returns_single_result() {
    let addr = start_relay(open_config()).await;
    let mut socket = connect(addr, None).await;
    assert_eq!(next_event(&mut socket).await["event"], "ready");

    send(&mut socket, generate("generate_once", "r2", "  who are you?  ")).await;

    let event = next_event(&mut socket).await;
    assert_eq!(event["event"], "result");
    assert_eq!(event["data"]["correlation_id"], "r2");
    assert_eq!(event["data"]["text"], "You said: who are you?");
}

#[tokio::test]
async fn e2e_invalid_frames_do_not_close_connection() {
    let addr = start_relay(open_config()).await;
    let mut socket = connect(addr, None).await;
    assert_eq!(next_event(&mut socket).await["event"], "ready");

    send(&mut socket, json!({"event": "rp_start", "data": {}})).await;
    let event = next_event(&mut socket).await;
    assert_eq!(event["event"], "error");
    assert!(event["data"]["message"].as_str().unwrap().starts_with("Invalid event"));

    let missing_input = json!({
        "event": "generate_once",
        "data": {"correlation_id": "r3", "character": {"name": "Iron Man"}}
    });
    send(&mut socket, missing_input).await;
    let event = next_event(&mut socket).await;
    assert_eq!(event["event"], "error");
    assert_eq!(event["data"]["correlation_id"], "r3");
    assert!(event["data"]["message"].as_str().unwrap().contains("user_input"));

    // Still usable
    send(&mut socket, generate("generate_once", "r4", "still there?")).await;
    assert_eq!(next_event(&mut socket).await["event"], "result");
}

// ── Cancellation ─────────────────────────────────────────────────────────

#[tokio::test]
async fn e2e_stop_cancels_in_flight_generation() {
    let addr = start_relay(open_config()).await;
    let mut socket = connect(addr, None).await;
    assert_eq!(next_event(&mut socket).await["event"], "ready");

    send(&mut socket, generate("generate_stream", "slow", "hang please")).await;
    send(&mut socket, json!({"event": "stop", "data": {"correlation_id": "slow"}})).await;

    let event = next_event(&mut socket).await;
    assert_eq!(event["event"], "error");
    assert_eq!(event["data"]["correlation_id"], "slow");
    assert_eq!(event["data"]["message"], "Generation cancelled");

    // The id is free again once the session ended
    send(&mut socket, generate("generate_once", "slow", "again")).await;
    let event = next_event(&mut socket).await;
    assert_eq!(event["event"], "result");
    assert_eq!(event["data"]["correlation_id"], "slow");
}

// ── Authentication ───────────────────────────────────────────────────────

#[tokio::test]
async fn e2e_missing_token_is_refused_but_connection_stays_open() {
    let addr = start_relay(jwt_config()).await;
    let mut socket = connect(addr, None).await;

    let event = next_event(&mut socket).await;
    assert_eq!(event["event"], "error");
    assert_eq!(event["data"]["message"], "No token provided");
    assert!(event["data"].get("correlation_id").is_none());

    send(&mut socket, generate("generate_stream", "r1", "hello")).await;
    let event = next_event(&mut socket).await;
    assert_eq!(event["event"], "error");
    assert_eq!(event["data"]["correlation_id"], "r1");
    assert_eq!(event["data"]["message"], "Not authenticated");
}

#[tokio::test]
async fn e2e_invalid_token_is_refused() {
    let addr = start_relay(jwt_config()).await;
    let mut socket = connect(addr, Some("not.a.jwt")).await;

    let event = next_event(&mut socket).await;
    assert_eq!(event["event"], "error");
    assert_eq!(event["data"]["message"], "Invalid token");
}

#[tokio::test]
async fn e2e_valid_token_is_admitted() {
    let addr = start_relay(jwt_config()).await;
    let token = token();
    let mut socket = connect(addr, Some(&token)).await;
    assert_eq!(next_event(&mut socket).await["event"], "ready");

    send(&mut socket, generate("generate_once", "r1", "hello")).await;
    let event = next_event(&mut socket).await;
    assert_eq!(event["event"], "result");
    assert_eq!(event["data"]["text"], "You said: hello");
}

#[tokio::test]
async fn e2e_health_endpoint_over_http() {
    let addr = start_relay(open_config()).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    stream
        .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();

    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains("\"status\":\"ok\""));
}
