//! Relay events: what clients send and what the relay emits back.
//!
//! Both directions use the same envelope on the wire:
//! `{"event": "<name>", "data": {...}}`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::backend::{GenerationOverrides, GenerationParameters};
use crate::character::CharacterCard;
use crate::error::Error;
use crate::history::RawTurn;

/// Unique identifier for a client connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Whether the reply is relayed fragment by fragment or as one result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationMode {
    Stream,
    Once,
}

/// Events a client may send.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum InboundEvent {
    GenerateStream(GeneratePayload),
    GenerateOnce(GeneratePayload),
    /// Cancel an in-flight generation on this connection.
    Stop(StopPayload),
}

impl InboundEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::GenerateStream(_) => "generate_stream",
            Self::GenerateOnce(_) => "generate_once",
            Self::Stop(_) => "stop",
        }
    }
}

/// Payload of `generate_stream` and `generate_once`.
///
/// Fields are optional at the serde level so a missing field produces a
/// validation error that still carries the correlation id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratePayload {
    pub correlation_id: Option<String>,
    pub character: Option<CharacterCard>,
    pub history: Option<Vec<RawTurn>>,
    pub user_input: Option<String>,
    pub parameters: Option<GenerationOverrides>,
}

impl GeneratePayload {
    /// Validate required fields and build the request a session will own.
    pub fn into_request(
        self,
        mode: GenerationMode,
        defaults: &GenerationParameters,
    ) -> Result<GenerationRequest, Error> {
        let correlation_id = self
            .correlation_id
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| Error::Validation("missing required field 'correlation_id'".into()))?;

        let character = self
            .character
            .ok_or_else(|| Error::Validation("missing required field 'character'".into()))?;

        let user_input = self
            .user_input
            .filter(|input| !input.trim().is_empty())
            .ok_or_else(|| Error::Validation("missing required field 'user_input'".into()))?;

        let parameters = match self.parameters {
            Some(ref overrides) => defaults.with_overrides(overrides),
            None => defaults.clone(),
        };

        Ok(GenerationRequest {
            correlation_id,
            character,
            history: self.history.unwrap_or_default(),
            user_input,
            parameters,
            mode,
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StopPayload {
    #[serde(default)]
    pub correlation_id: Option<String>,
}

/// One validated generation request. Owned by exactly one session.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub correlation_id: String,
    pub character: CharacterCard,
    /// Unsanitized; the session sanitizes it.
    pub history: Vec<RawTurn>,
    pub user_input: String,
    pub parameters: GenerationParameters,
    pub mode: GenerationMode,
}

/// Events the relay emits to a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum OutboundEvent {
    /// Greeting sent once per verified connection: the backend link is ready.
    Ready { backend: String, model: String },

    /// Partial text from the backend, in arrival order.
    Token {
        correlation_id: String,
        fragment: String,
    },

    /// Terminal success: the full trimmed reply.
    Result { correlation_id: String, text: String },

    /// Terminal failure. `correlation_id` is absent for connection-level errors.
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        correlation_id: Option<String>,
        message: String,
    },
}

impl OutboundEvent {
    pub fn error(correlation_id: Option<&str>, message: impl Into<String>) -> Self {
        Self::Error {
            correlation_id: correlation_id.map(str::to_string),
            message: message.into(),
        }
    }

    /// Event name on the wire.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Ready { .. } => "ready",
            Self::Token { .. } => "token",
            Self::Result { .. } => "result",
            Self::Error { .. } => "error",
        }
    }

    pub fn correlation_id(&self) -> Option<&str> {
        match self {
            Self::Ready { .. } => None,
            Self::Token { correlation_id, .. } | Self::Result { correlation_id, .. } => {
                Some(correlation_id.as_str())
            }
            Self::Error { correlation_id, .. } => correlation_id.as_deref(),
        }
    }

    /// Whether this event ends a generation request.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Result { .. } | Self::Error { .. })
    }
}

/// Where a session sends its events: one client connection.
///
/// Emitting to a connection that has gone away must be a silent no-op.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: OutboundEvent);
}

#[async_trait]
impl EventSink for tokio::sync::mpsc::Sender<OutboundEvent> {
    async fn emit(&self, event: OutboundEvent) {
        let _ = self.send(event).await;
    }
}
