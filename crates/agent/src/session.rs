//! One generation request, from sanitized history to terminal event.
//!
//! ```text
//! Pending ──► Streaming ──► Done
//!    │            │
//!    └────────────┴──────► Failed
//! ```
//!
//! Every session emits exactly one terminal event (`result` or `error`) on
//! its sink. Fragments are relayed as `token` events in arrival order.
//!
//! # Fallback
//!
//! Some chat templates refuse a conversation that opens with anything other
//! than a strict user/assistant alternation. When the structured call on a
//! first turn is rejected for that reason, and nothing has been relayed yet,
//! the session retries once with the flattened prompt.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use elowen_config::{AppConfig, CallStyle};
use elowen_core::{
    Backend, BackendError, Error, EventSink, GenerationMode, GenerationRequest, History,
    OutboundEvent, Turn, sanitize,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::prompt::PromptAssembler;

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Sanitizing and assembling; no backend call yet
    Pending,
    /// A backend call is in flight
    Streaming,
    Done,
    Failed,
}

/// What happened, for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOutcome {
    pub state: SessionState,
    /// Number of `token` events emitted
    pub tokens_emitted: usize,
    /// Whether the flattened-prompt retry was used
    pub fell_back: bool,
}

/// Deployment knobs a session needs.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub call_style: CallStyle,
    pub max_pairs: usize,
    /// Deadline for the one-shot call or for opening the stream
    pub request_timeout: Option<Duration>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            call_style: CallStyle::Structured,
            max_pairs: 10,
            request_timeout: None,
        }
    }
}

impl SessionSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            call_style: config.backend.call_style,
            max_pairs: config.history.max_pairs,
            request_timeout: config.backend.request_timeout_secs.map(Duration::from_secs),
        }
    }
}

/// The backend-ready form of a request.
enum Assembled<'a> {
    Turns(&'a [Turn]),
    Prompt(&'a str),
}

impl Assembled<'_> {
    fn label(&self) -> &'static str {
        match self {
            Self::Turns(_) => "structured",
            Self::Prompt(_) => "flattened",
        }
    }
}

/// Mutable bookkeeping that survives a cancelled generation future.
struct Progress {
    state: SessionState,
    tokens_emitted: usize,
    fell_back: bool,
}

/// Drives one [`GenerationRequest`] to completion.
pub struct GenerationSession {
    backend: Arc<dyn Backend>,
    assembler: Arc<PromptAssembler>,
    settings: SessionSettings,
    request: GenerationRequest,
}

impl GenerationSession {
    pub fn new(
        backend: Arc<dyn Backend>,
        assembler: Arc<PromptAssembler>,
        settings: SessionSettings,
        request: GenerationRequest,
    ) -> Self {
        Self {
            backend,
            assembler,
            settings,
            request,
        }
    }

    pub fn correlation_id(&self) -> &str {
        &self.request.correlation_id
    }

    /// Run the session, emitting events on `sink` until a terminal one.
    ///
    /// Cancelling `cancel` drops the in-flight backend call and ends the
    /// session with a "Generation cancelled" error.
    pub async fn run(self, sink: &dyn EventSink, cancel: CancellationToken) -> SessionOutcome {
        let correlation_id = self.request.correlation_id.clone();
        let mut progress = Progress {
            state: SessionState::Pending,
            tokens_emitted: 0,
            fell_back: false,
        };

        info!(
            correlation_id = %correlation_id,
            mode = ?self.request.mode,
            call_style = ?self.settings.call_style,
            "Generation started"
        );

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = self.generate(sink, &mut progress) => result,
        };

        let terminal = match result {
            Ok(text) => {
                progress.state = SessionState::Done;
                OutboundEvent::Result {
                    correlation_id: correlation_id.clone(),
                    text,
                }
            }
            Err(e) => {
                progress.state = SessionState::Failed;
                warn!(correlation_id = %correlation_id, error = %e, "Generation failed");
                OutboundEvent::error(Some(&correlation_id), e.to_string())
            }
        };
        sink.emit(terminal).await;

        let outcome = SessionOutcome {
            state: progress.state,
            tokens_emitted: progress.tokens_emitted,
            fell_back: progress.fell_back,
        };
        info!(
            correlation_id = %correlation_id,
            state = ?outcome.state,
            tokens = outcome.tokens_emitted,
            fell_back = outcome.fell_back,
            "Generation finished"
        );
        outcome
    }

    /// Sanitize, assemble, call the backend. Returns the final trimmed text.
    async fn generate(&self, sink: &dyn EventSink, progress: &mut Progress) -> Result<String, Error> {
        let request = &self.request;
        let history = sanitize(&request.history, self.settings.max_pairs);
        debug!(
            correlation_id = %request.correlation_id,
            raw_turns = request.history.len(),
            kept_turns = history.len(),
            "History sanitized"
        );

        match self.settings.call_style {
            CallStyle::Flattened => {
                let prompt = self.flattened_prompt(&history);
                self.call(Assembled::Prompt(&prompt), sink, progress).await
            }
            CallStyle::Structured => {
                let messages =
                    self.assembler
                        .build_messages(&request.character, &history, &request.user_input)?;

                match self.call(Assembled::Turns(&messages), sink, progress).await {
                    Err(Error::Backend(e)) if should_fall_back(&e, &history, progress) => {
                        warn!(
                            correlation_id = %request.correlation_id,
                            error = %e,
                            "Structured request rejected on first turn, retrying with flattened prompt"
                        );
                        progress.fell_back = true;
                        let prompt = self.flattened_prompt(&history);
                        self.call(Assembled::Prompt(&prompt), sink, progress).await
                    }
                    other => other,
                }
            }
        }
    }

    fn flattened_prompt(&self, history: &History) -> String {
        self.assembler
            .build_prompt(&self.request.character, history, &self.request.user_input)
    }

    /// One backend call in the request's mode.
    async fn call(
        &self,
        input: Assembled<'_>,
        sink: &dyn EventSink,
        progress: &mut Progress,
    ) -> Result<String, Error> {
        let params = &self.request.parameters;
        let backend = self.backend.as_ref();
        progress.state = SessionState::Streaming;
        debug!(
            correlation_id = %self.request.correlation_id,
            convention = input.label(),
            "Calling backend"
        );

        if self.request.mode == GenerationMode::Once {
            let text = match input {
                Assembled::Turns(turns) => self.with_deadline(backend.chat_once(turns, params)).await?,
                Assembled::Prompt(prompt) => {
                    self.with_deadline(backend.complete_once(prompt, params)).await?
                }
            };
            return Ok(text.trim().to_string());
        }

        let mut rx = match input {
            Assembled::Turns(turns) => self.with_deadline(backend.stream_chat(turns, params)).await?,
            Assembled::Prompt(prompt) => {
                self.with_deadline(backend.stream_complete(prompt, params)).await?
            }
        };

        let mut full = String::new();
        while let Some(chunk) = rx.recv().await {
            let chunk = chunk?;
            if let Some(fragment) = chunk.content.filter(|f| !f.is_empty()) {
                full.push_str(&fragment);
                progress.tokens_emitted += 1;
                sink.emit(OutboundEvent::Token {
                    correlation_id: self.request.correlation_id.clone(),
                    fragment,
                })
                .await;
            }
            if chunk.done {
                break;
            }
        }

        Ok(full.trim().to_string())
    }

    /// Race a backend call against the configured deadline, if any.
    async fn with_deadline<T>(
        &self,
        call: impl Future<Output = Result<T, BackendError>>,
    ) -> Result<T, BackendError> {
        match self.settings.request_timeout {
            Some(limit) => tokio::time::timeout(limit, call).await.map_err(|_| {
                BackendError::Timeout(format!("no response within {}s", limit.as_secs()))
            })?,
            None => call.await,
        }
    }
}

/// The fallback fires at most once, only on a first-turn alternation
/// rejection, and never after a fragment has been relayed.
fn should_fall_back(error: &BackendError, history: &History, progress: &Progress) -> bool {
    error.is_alternation_violation()
        && history.is_empty()
        && progress.tokens_emitted == 0
        && !progress.fell_back
}
