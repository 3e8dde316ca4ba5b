//! Backend trait: the abstraction over the text-generation service.
//!
//! A backend accepts either a single flattened prompt or a list of
//! role-tagged turns, and answers either with one complete text or with a
//! stream of incremental fragments.
//!
//! Implementations: OpenAI-compatible servers (vLLM) in `elowen-providers`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::BackendError;
use crate::history::Turn;

/// Sampling parameters sent with every backend call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParameters {
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_top_p")]
    pub top_p: f32,

    /// Maximum tokens to generate
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Stop sequences
    #[serde(default = "default_stop_sequences")]
    pub stop_sequences: Vec<String>,

    #[serde(default = "default_penalty")]
    pub frequency_penalty: f32,

    #[serde(default = "default_penalty")]
    pub presence_penalty: f32,

    /// Backend-specific fields merged into the request body as-is
    /// (e.g. vLLM's `repetition_penalty`). `None` or an empty map sends nothing.
    #[serde(default = "default_extra_backend_options")]
    pub extra_backend_options: Option<serde_json::Map<String, serde_json::Value>>,
}

fn default_temperature() -> f32 {
    0.9
}
fn default_top_p() -> f32 {
    0.9
}
fn default_max_tokens() -> u32 {
    768
}
fn default_stop_sequences() -> Vec<String> {
    vec!["<end_of_turn>".into()]
}
fn default_penalty() -> f32 {
    0.2
}
fn default_extra_backend_options() -> Option<serde_json::Map<String, serde_json::Value>> {
    let mut extra = serde_json::Map::new();
    extra.insert("repetition_penalty".into(), serde_json::json!(1.08));
    Some(extra)
}

impl Default for GenerationParameters {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            top_p: default_top_p(),
            max_tokens: default_max_tokens(),
            stop_sequences: default_stop_sequences(),
            frequency_penalty: default_penalty(),
            presence_penalty: default_penalty(),
            extra_backend_options: default_extra_backend_options(),
        }
    }
}

impl GenerationParameters {
    /// Return a copy with every field the overrides set replaced.
    pub fn with_overrides(&self, overrides: &GenerationOverrides) -> Self {
        let mut params = self.clone();
        if let Some(t) = overrides.temperature {
            params.temperature = t;
        }
        if let Some(p) = overrides.top_p {
            params.top_p = p;
        }
        if let Some(m) = overrides.max_tokens {
            params.max_tokens = m;
        }
        if let Some(ref stop) = overrides.stop_sequences {
            params.stop_sequences = stop.clone();
        }
        if let Some(f) = overrides.frequency_penalty {
            params.frequency_penalty = f;
        }
        if let Some(p) = overrides.presence_penalty {
            params.presence_penalty = p;
        }
        if let Some(ref extra) = overrides.extra_backend_options {
            params.extra_backend_options = Some(extra.clone());
        }
        params
    }

    /// Extra options worth sending: `None` when absent or empty.
    pub fn extra_options(&self) -> Option<&serde_json::Map<String, serde_json::Value>> {
        self.extra_backend_options
            .as_ref()
            .filter(|extra| !extra.is_empty())
    }
}

/// Per-request parameter overrides. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationOverrides {
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_tokens: Option<u32>,
    pub stop_sequences: Option<Vec<String>>,
    pub frequency_penalty: Option<f32>,
    pub presence_penalty: Option<f32>,
    pub extra_backend_options: Option<serde_json::Map<String, serde_json::Value>>,
}

/// Token usage information.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// A single chunk in a streaming response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamChunk {
    /// Text fragment, if this chunk carries one
    #[serde(default)]
    pub content: Option<String>,

    /// End-of-stream marker
    #[serde(default)]
    pub done: bool,

    /// Usage info (typically only in the final chunk)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl StreamChunk {
    pub fn fragment(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Self::default()
        }
    }

    pub fn end() -> Self {
        Self {
            done: true,
            ..Self::default()
        }
    }
}

/// A finite, single-use sequence of stream chunks.
pub type FragmentStream = tokio::sync::mpsc::Receiver<Result<StreamChunk, BackendError>>;

/// The core Backend trait.
///
/// The session calls one of the four generation methods without knowing
/// which server is behind it. Each call is awaited at a single suspension
/// point, so callers can race it against a timer or a cancellation signal.
#[async_trait]
pub trait Backend: Send + Sync {
    /// A human-readable name for this backend (e.g., "vllm").
    fn name(&self) -> &str;

    /// The model the backend generates with.
    fn model(&self) -> &str;

    /// Flattened prompt, complete response.
    async fn complete_once(
        &self,
        prompt: &str,
        params: &GenerationParameters,
    ) -> Result<String, BackendError>;

    /// Flattened prompt, incremental fragments.
    async fn stream_complete(
        &self,
        prompt: &str,
        params: &GenerationParameters,
    ) -> Result<FragmentStream, BackendError>;

    /// Structured turns, complete response.
    async fn chat_once(
        &self,
        turns: &[Turn],
        params: &GenerationParameters,
    ) -> Result<String, BackendError>;

    /// Structured turns, incremental fragments.
    ///
    /// Default implementation calls `chat_once()` and wraps the result as a
    /// single fragment followed by the end marker.
    async fn stream_chat(
        &self,
        turns: &[Turn],
        params: &GenerationParameters,
    ) -> Result<FragmentStream, BackendError> {
        let text = self.chat_once(turns, params).await?;
        let (tx, rx) = tokio::sync::mpsc::channel(2);
        let _ = tx.send(Ok(StreamChunk::fragment(text))).await;
        let _ = tx.send(Ok(StreamChunk::end())).await;
        Ok(rx)
    }

    /// Can we reach the backend?
    async fn health_check(&self) -> Result<bool, BackendError> {
        Ok(true)
    }
}
