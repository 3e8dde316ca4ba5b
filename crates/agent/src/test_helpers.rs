//! Shared test helpers for session tests.

use elowen_core::{
    Backend, BackendError, FragmentStream, GenerationParameters, OutboundEvent, StreamChunk, Turn,
};
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::mpsc;

/// One scripted reply.
#[derive(Debug, Clone)]
pub enum Script {
    Text(String),
    Fragments(Vec<String>),
    FragmentsThenFail(Vec<String>, BackendError),
    Fail(BackendError),
    /// Never answers
    Hang,
}

impl Script {
    pub fn text(text: &str) -> Self {
        Self::Text(text.into())
    }

    pub fn fragments(fragments: &[&str]) -> Self {
        Self::Fragments(fragments.iter().map(|f| f.to_string()).collect())
    }
}

/// What the session asked the backend for.
#[derive(Debug, Clone)]
pub enum Call {
    CompleteOnce { prompt: String },
    StreamComplete { prompt: String },
    ChatOnce { turns: usize },
    StreamChat { turns: usize },
}

/// A backend that replays a queue of scripted replies, one per call.
///
/// Panics if more calls are made than replies provided.
pub struct ScriptedBackend {
    scripts: Mutex<VecDeque<Script>>,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedBackend {
    pub fn new(scripts: Vec<Script>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn next(&self, call: Call) -> Script {
        let mut calls = self.calls.lock().unwrap();
        calls.push(call);
        self.scripts.lock().unwrap().pop_front().unwrap_or_else(|| {
            panic!("ScriptedBackend: no more replies (call #{})", calls.len())
        })
    }

    async fn once(script: Script) -> Result<String, BackendError> {
        match script {
            Script::Text(text) => Ok(text),
            Script::Fragments(fragments) => Ok(fragments.concat()),
            Script::FragmentsThenFail(_, e) | Script::Fail(e) => Err(e),
            Script::Hang => std::future::pending().await,
        }
    }

    async fn stream(script: Script) -> Result<FragmentStream, BackendError> {
        let (fragments, failure) = match script {
            Script::Text(text) => (vec![text], None),
            Script::Fragments(fragments) => (fragments, None),
            Script::FragmentsThenFail(fragments, e) => (fragments, Some(e)),
            Script::Fail(e) => return Err(e),
            Script::Hang => std::future::pending().await,
        };

        let (tx, rx) = mpsc::channel(fragments.len() + 1);
        for fragment in fragments {
            let _ = tx.send(Ok(StreamChunk::fragment(fragment))).await;
        }
        let last = match failure {
            Some(e) => Err(e),
            None => Ok(StreamChunk::end()),
        };
        let _ = tx.send(last).await;
        Ok(rx)
    }
}

#[async_trait::async_trait]
impl Backend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    fn model(&self) -> &str {
        "scripted-1"
    }

    async fn complete_once(
        &self,
        prompt: &str,
        _params: &GenerationParameters,
    ) -> Result<String, BackendError> {
        let script = self.next(Call::CompleteOnce {
            prompt: prompt.to_string(),
        });
        Self::once(script).await
    }

    async fn stream_complete(
        &self,
        prompt: &str,
        _params: &GenerationParameters,
    ) -> Result<FragmentStream, BackendError> {
        let script = self.next(Call::StreamComplete {
            prompt: prompt.to_string(),
        });
        Self::stream(script).await
    }

    async fn chat_once(
        &self,
        turns: &[Turn],
        _params: &GenerationParameters,
    ) -> Result<String, BackendError> {
        let script = self.next(Call::ChatOnce { turns: turns.len() });
        Self::once(script).await
    }

    async fn stream_chat(
        &self,
        turns: &[Turn],
        _params: &GenerationParameters,
    ) -> Result<FragmentStream, BackendError> {
        let script = self.next(Call::StreamChat { turns: turns.len() });
        Self::stream(script).await
    }
}

/// The rejection vLLM returns when a chat template refuses the turn order.
pub fn alternation_rejection() -> BackendError {
    BackendError::Rejected {
        status_code: 400,
        reason: "Conversation roles must alternate user/assistant/user/assistant/...".into(),
    }
}

/// Drain every event from a closed channel.
pub async fn collect(mut rx: mpsc::Receiver<OutboundEvent>) -> Vec<OutboundEvent> {
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}
