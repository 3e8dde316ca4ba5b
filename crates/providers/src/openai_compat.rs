//! OpenAI-compatible backend implementation.
//!
//! Built for vLLM, which serves both conventions the relay needs:
//! - `POST /completions` with a single flattened `prompt`
//! - `POST /chat/completions` with role-tagged `messages`
//!
//! Both support SSE streaming. `GET /models` doubles as the health check.

use std::time::Duration;

use async_trait::async_trait;
use elowen_core::backend::*;
use elowen_core::error::BackendError;
use elowen_core::history::{Role, Turn};
use futures::StreamExt;
use serde::Deserialize;
use tracing::{debug, trace, warn};

/// A backend speaking the OpenAI HTTP API.
pub struct OpenAiCompatBackend {
    name: String,
    base_url: String,
    model: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl OpenAiCompatBackend {
    /// Create a new OpenAI-compatible backend.
    ///
    /// Only the connect phase has a timeout here: streamed generations can
    /// legitimately run for minutes, so whole-call deadlines are enforced by
    /// the caller.
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
        connect_timeout: Duration,
    ) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| BackendError::Unavailable(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            api_key: api_key.filter(|k| !k.is_empty()),
            client,
        })
    }

    /// Create a vLLM backend (convenience constructor).
    pub fn vllm(base_url: &str, model: &str) -> Result<Self, BackendError> {
        Self::new("vllm", base_url, model, None, Duration::from_secs(10))
    }

    /// Build from the `[backend]` configuration section.
    pub fn from_config(config: &elowen_config::BackendConfig) -> Result<Self, BackendError> {
        Self::new(
            "vllm",
            &config.base_url,
            &config.model,
            config.api_key.clone(),
            Duration::from_secs(config.connect_timeout_secs),
        )
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Ids of the models the server is currently serving.
    pub async fn list_models(&self) -> Result<Vec<String>, BackendError> {
        let url = format!("{}/models", self.base_url);
        let response = self
            .authorize(self.client.get(&url))
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status().as_u16();
        if status != 200 {
            let error_body = response.text().await.unwrap_or_default();
            return Err(error_from_status(status, &error_body));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;

        Ok(body["data"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|m| m["id"].as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default())
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.api_key {
            Some(ref key) => request.header("Authorization", format!("Bearer {key}")),
            None => request,
        }
    }

    /// Request body for `/completions`.
    fn completion_body(&self, prompt: &str, params: &GenerationParameters, stream: bool) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": self.model,
            "prompt": prompt,
            "stream": stream,
        });
        apply_parameters(&mut body, params);
        body
    }

    /// Request body for `/chat/completions`.
    fn chat_body(&self, turns: &[Turn], params: &GenerationParameters, stream: bool) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": to_api_messages(turns),
            "stream": stream,
        });
        apply_parameters(&mut body, params);
        body
    }

    /// POST a body and return the response if the status is 200.
    async fn post(
        &self,
        path: &str,
        body: &serde_json::Value,
        streaming: bool,
    ) -> Result<reqwest::Response, BackendError> {
        let url = format!("{}{path}", self.base_url);
        let mut request = self
            .authorize(self.client.post(&url))
            .header("Content-Type", "application/json");
        if streaming {
            request = request.header("Accept", "text/event-stream");
        }

        debug!(backend = %self.name, model = %self.model, path, streaming, "Sending generation request");

        let response = request
            .json(body)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status().as_u16();
        if status != 200 {
            let error_body = response.text().await.unwrap_or_default();
            warn!(backend = %self.name, status, body = %error_body, "Backend returned error");
            return Err(error_from_status(status, &error_body));
        }

        Ok(response)
    }

    async fn once(&self, path: &str, body: serde_json::Value) -> Result<String, BackendError> {
        let response = self.post(path, &body, false).await?;
        let api_response: ApiResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Unavailable(format!("Failed to parse response: {e}")))?;

        if let Some(ref usage) = api_response.usage {
            debug!(
                backend = %self.name,
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                "Generation complete"
            );
        }

        api_response
            .choices
            .into_iter()
            .next()
            .map(ApiChoice::into_text)
            .ok_or_else(|| BackendError::Unavailable("No choices in response".into()))
    }

    async fn stream(&self, path: &str, body: serde_json::Value) -> Result<FragmentStream, BackendError> {
        let response = self.post(path, &body, true).await?;
        let (tx, rx) = tokio::sync::mpsc::channel(64);
        let backend_name = self.name.clone();

        // Read the SSE byte stream and forward parsed chunks
        tokio::spawn(async move {
            let mut byte_stream = response.bytes_stream();
            let mut buffer: Vec<u8> = Vec::new();

            while let Some(chunk_result) = byte_stream.next().await {
                let bytes = match chunk_result {
                    Ok(b) => b,
                    Err(e) => {
                        let _ = tx
                            .send(Err(BackendError::Unavailable(format!(
                                "Stream interrupted: {e}"
                            ))))
                            .await;
                        return;
                    }
                };

                // Multi-byte characters may straddle chunks; decode whole lines only
                buffer.extend_from_slice(&bytes);
                while let Some(line) = take_line(&mut buffer) {
                    if !forward_line(&tx, &backend_name, line).await {
                        return;
                    }
                }
            }

            // A final event may arrive without its trailing newline
            if !buffer.is_empty() {
                let line = std::mem::take(&mut buffer);
                if !forward_line(&tx, &backend_name, line).await {
                    return;
                }
            }

            let _ = tx
                .send(Err(BackendError::Unavailable(
                    "Stream ended before end marker".into(),
                )))
                .await;
        });

        Ok(rx)
    }
}

/// Pop one `\n`-terminated line off the front of `buffer`.
fn take_line(buffer: &mut Vec<u8>) -> Option<Vec<u8>> {
    let end = buffer.iter().position(|&b| b == b'\n')?;
    Some(buffer.drain(..=end).collect())
}

/// Forward one raw SSE line. Returns `false` once the stream is finished,
/// either because an end marker went out or the receiver is gone.
async fn forward_line(
    tx: &tokio::sync::mpsc::Sender<Result<StreamChunk, BackendError>>,
    backend_name: &str,
    line: Vec<u8>,
) -> bool {
    let line = match String::from_utf8(line) {
        Ok(line) => line,
        Err(e) => {
            let _ = tx
                .send(Err(BackendError::Unavailable(format!(
                    "Invalid UTF-8 in stream: {e}"
                ))))
                .await;
            return false;
        }
    };

    match parse_sse_line(&line) {
        Some(SseEvent::Chunk(chunk)) => {
            let done = chunk.done;
            tx.send(Ok(chunk)).await.is_ok() && !done
        }
        Some(SseEvent::Done) => {
            let _ = tx.send(Ok(StreamChunk::end())).await;
            false
        }
        Some(SseEvent::Unparseable(data)) => {
            trace!(backend = %backend_name, data = %data, "Ignoring unparseable SSE chunk");
            !tx.is_closed()
        }
        None => true,
    }
}

#[async_trait]
impl Backend for OpenAiCompatBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn complete_once(
        &self,
        prompt: &str,
        params: &GenerationParameters,
    ) -> Result<String, BackendError> {
        self.once("/completions", self.completion_body(prompt, params, false))
            .await
    }

    async fn stream_complete(
        &self,
        prompt: &str,
        params: &GenerationParameters,
    ) -> Result<FragmentStream, BackendError> {
        self.stream("/completions", self.completion_body(prompt, params, true))
            .await
    }

    async fn chat_once(
        &self,
        turns: &[Turn],
        params: &GenerationParameters,
    ) -> Result<String, BackendError> {
        self.once("/chat/completions", self.chat_body(turns, params, false))
            .await
    }

    async fn stream_chat(
        &self,
        turns: &[Turn],
        params: &GenerationParameters,
    ) -> Result<FragmentStream, BackendError> {
        self.stream("/chat/completions", self.chat_body(turns, params, true))
            .await
    }

    async fn health_check(&self) -> Result<bool, BackendError> {
        let url = format!("{}/models", self.base_url);
        let response = self
            .authorize(self.client.get(&url))
            .send()
            .await
            .map_err(map_transport_error)?;

        Ok(response.status().is_success())
    }
}

/// Write sampling parameters into a request body. Extra backend options are
/// merged at the top level, after the standard fields.
fn apply_parameters(body: &mut serde_json::Value, params: &GenerationParameters) {
    body["temperature"] = serde_json::json!(params.temperature);
    body["top_p"] = serde_json::json!(params.top_p);
    body["max_tokens"] = serde_json::json!(params.max_tokens);
    body["frequency_penalty"] = serde_json::json!(params.frequency_penalty);
    body["presence_penalty"] = serde_json::json!(params.presence_penalty);

    if !params.stop_sequences.is_empty() {
        body["stop"] = serde_json::json!(params.stop_sequences);
    }

    if let Some(extra) = params.extra_options() {
        for (key, value) in extra {
            body[key.as_str()] = value.clone();
        }
    }
}

fn to_api_messages(turns: &[Turn]) -> Vec<serde_json::Value> {
    turns
        .iter()
        .map(|turn| {
            let role = match turn.role() {
                Role::User => "user",
                Role::Assistant => "assistant",
            };
            serde_json::json!({ "role": role, "content": turn.content() })
        })
        .collect()
}

fn map_transport_error(e: reqwest::Error) -> BackendError {
    if e.is_timeout() {
        BackendError::Timeout(e.to_string())
    } else {
        BackendError::Unavailable(e.to_string())
    }
}

/// Classify a non-200 response.
///
/// Request-shape problems (400, 404, 422, ...) are rejections; auth and rate
/// limits mean the backend cannot serve us right now.
fn error_from_status(status: u16, body: &str) -> BackendError {
    let reason = extract_error_message(body);
    match status {
        408 | 504 => BackendError::Timeout(reason),
        401 | 403 => BackendError::Unavailable(format!("Authentication failed: {reason}")),
        429 => BackendError::Unavailable(format!("Rate limited: {reason}")),
        400..=499 => BackendError::Rejected {
            status_code: status,
            reason,
        },
        _ => BackendError::Unavailable(format!("HTTP {status}: {reason}")),
    }
}

/// Pull the human-readable message out of an error body.
///
/// vLLM answers `{"message": ...}` on older builds and
/// `{"error": {"message": ...}}` on OpenAI-compatible ones. Anything else is
/// returned as-is.
fn extract_error_message(body: &str) -> String {
    let trimmed = body.trim();
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if let Some(message) = value["error"]["message"].as_str() {
            return message.to_string();
        }
        if let Some(message) = value["message"].as_str() {
            return message.to_string();
        }
        if let Some(message) = value["error"].as_str() {
            return message.to_string();
        }
    }
    if trimmed.is_empty() {
        "empty response body".into()
    } else {
        trimmed.to_string()
    }
}

#[derive(Debug)]
enum SseEvent {
    Chunk(StreamChunk),
    Done,
    Unparseable(String),
}

/// Interpret one SSE line. `None` for blank lines, comments, and non-data
/// fields; `Some(Chunk)` only when the line carries text or usage.
fn parse_sse_line(line: &str) -> Option<SseEvent> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.is_empty() || line.starts_with(':') {
        return None;
    }

    let data = line.strip_prefix("data:")?.trim();
    if data == "[DONE]" {
        return Some(SseEvent::Done);
    }

    let stream_resp = match serde_json::from_str::<StreamResponse>(data) {
        Ok(r) => r,
        Err(_) => return Some(SseEvent::Unparseable(data.to_string())),
    };

    // Usage arrives in a trailing chunk with no choices
    if let Some(usage) = stream_resp.usage {
        return Some(SseEvent::Chunk(StreamChunk {
            content: None,
            done: true,
            usage: Some(Usage {
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
                total_tokens: usage.total_tokens,
            }),
        }));
    }

    let fragment = stream_resp
        .choices
        .into_iter()
        .next()
        .and_then(StreamChoice::into_fragment)
        .filter(|f| !f.is_empty())?;

    Some(SseEvent::Chunk(StreamChunk::fragment(fragment)))
}

// --- OpenAI API types (internal) ---

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    choices: Vec<ApiChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

/// A choice from either endpoint: `/completions` fills `text`,
/// `/chat/completions` fills `message`.
#[derive(Debug, Deserialize)]
struct ApiChoice {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    message: Option<ApiMessage>,
}

impl ApiChoice {
    fn into_text(self) -> String {
        self.text
            .or_else(|| self.message.and_then(|m| m.content))
            .unwrap_or_default()
    }
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

// --- Streaming SSE types ---

/// A single SSE `data: {...}` chunk from a streaming response.
#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    delta: Option<StreamDelta>,
}

impl StreamChoice {
    fn into_fragment(self) -> Option<String> {
        self.text.or_else(|| self.delta.and_then(|d| d.content))
    }
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}
