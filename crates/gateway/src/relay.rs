//! The relay: connections in, generation sessions out.
//!
//! Transport-agnostic. The WebSocket layer hands the relay a connection id,
//! the token the client presented, and an outbound queue; the relay does
//! everything else.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use elowen_agent::{GenerationSession, PromptAssembler, SessionSettings};
use elowen_core::{
    Backend, ConnectionId, Error, EventSink, GeneratePayload, GenerationMode, GenerationParameters,
    InboundEvent, OutboundEvent, StopPayload,
};
use elowen_security::{Access, SessionRegistry, TokenVerifier, Verification};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Active generations on one connection, keyed by correlation id.
type ActiveSessions = Arc<Mutex<HashMap<String, CancellationToken>>>;

struct Connection {
    sink: mpsc::Sender<OutboundEvent>,
    active: ActiveSessions,
}

/// Routes inbound events to generation sessions.
pub struct RelayServer {
    backend: Arc<dyn Backend>,
    assembler: Arc<PromptAssembler>,
    settings: SessionSettings,
    defaults: GenerationParameters,
    registry: Arc<SessionRegistry>,
    verifier: Arc<dyn TokenVerifier>,
    connections: Mutex<HashMap<ConnectionId, Connection>>,
}

impl RelayServer {
    pub fn new(
        backend: Arc<dyn Backend>,
        assembler: Arc<PromptAssembler>,
        settings: SessionSettings,
        defaults: GenerationParameters,
        registry: Arc<SessionRegistry>,
        verifier: Arc<dyn TokenVerifier>,
    ) -> Self {
        Self {
            backend,
            assembler,
            settings,
            defaults,
            registry,
            verifier,
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Register a connection and verify its token.
    ///
    /// Verified connections are admitted and greeted with `ready`. Others
    /// get an `error` carrying the reason and stay connected, but every
    /// generation event they send is denied.
    pub async fn connect(
        &self,
        connection: ConnectionId,
        token: Option<&str>,
        sink: mpsc::Sender<OutboundEvent>,
    ) -> Verification {
        self.lock_connections().insert(
            connection.clone(),
            Connection {
                sink: sink.clone(),
                active: Arc::default(),
            },
        );

        let verification = self.verifier.verify(token);
        match verification {
            Verification::Verified { ref subject } => {
                self.registry.admit(&connection);
                info!(
                    connection = %connection,
                    subject = subject.as_deref().unwrap_or("-"),
                    verifier = self.verifier.name(),
                    "Client connected"
                );
                sink.emit(OutboundEvent::Ready {
                    backend: self.backend.name().to_string(),
                    model: self.backend.model().to_string(),
                })
                .await;
            }
            Verification::Rejected { ref reason } => {
                warn!(connection = %connection, reason = %reason, "Client failed authentication");
                let message = Error::Auth(reason.clone()).to_string();
                sink.emit(OutboundEvent::error(None, message)).await;
            }
        }
        verification
    }

    /// Parse a raw text frame and dispatch it.
    pub async fn dispatch_text(&self, connection: &ConnectionId, text: &str) {
        match serde_json::from_str::<InboundEvent>(text) {
            Ok(event) => self.dispatch(connection, event).await,
            Err(e) => {
                debug!(connection = %connection, error = %e, "Unparseable inbound frame");
                if let Some(sink) = self.sink(connection) {
                    sink.emit(OutboundEvent::error(None, format!("Invalid event: {e}")))
                        .await;
                }
            }
        }
    }

    pub async fn dispatch(&self, connection: &ConnectionId, event: InboundEvent) {
        debug!(connection = %connection, event = event.event_type(), "Inbound event");
        match event {
            InboundEvent::GenerateStream(payload) => {
                self.generate(connection, payload, GenerationMode::Stream)
                    .await
            }
            InboundEvent::GenerateOnce(payload) => {
                self.generate(connection, payload, GenerationMode::Once)
                    .await
            }
            InboundEvent::Stop(payload) => self.stop(connection, payload),
        }
    }

    async fn generate(&self, connection: &ConnectionId, payload: GeneratePayload, mode: GenerationMode) {
        let Some((sink, active)) = self.lookup(connection) else {
            warn!(connection = %connection, "Event for unknown connection");
            return;
        };
        let correlation_id = payload.correlation_id.clone();

        if let Access::Denied { reason } = self.registry.guard(connection) {
            warn!(connection = %connection, reason = %reason, "Generation denied");
            let message = Error::Auth(reason).to_string();
            sink.emit(OutboundEvent::error(correlation_id.as_deref(), message))
                .await;
            return;
        }

        let request = match payload.into_request(mode, &self.defaults) {
            Ok(request) => request,
            Err(e) => {
                sink.emit(OutboundEvent::error(correlation_id.as_deref(), e.to_string()))
                    .await;
                return;
            }
        };

        let cancel = CancellationToken::new();
        let duplicate = {
            let mut active = lock(&active);
            if active.contains_key(&request.correlation_id) {
                true
            } else {
                active.insert(request.correlation_id.clone(), cancel.clone());
                false
            }
        };
        if duplicate {
            warn!(
                connection = %connection,
                correlation_id = %request.correlation_id,
                "Duplicate correlation id rejected"
            );
            let message = format!(
                "A generation with correlation id '{}' is already in progress",
                request.correlation_id
            );
            sink.emit(OutboundEvent::error(Some(request.correlation_id.as_str()), message))
                .await;
            return;
        }

        let session_sink = SessionSink {
            inner: sink,
            active,
            correlation_id: request.correlation_id.clone(),
        };
        let session = GenerationSession::new(
            self.backend.clone(),
            self.assembler.clone(),
            self.settings.clone(),
            request,
        );

        tokio::spawn(async move {
            session.run(&session_sink, cancel).await;
        });
    }

    /// Cancel one generation, or every generation on the connection when no
    /// correlation id is given.
    fn stop(&self, connection: &ConnectionId, payload: StopPayload) {
        let Some((_, active)) = self.lookup(connection) else {
            return;
        };
        let active = lock(&active);
        match payload.correlation_id {
            Some(ref id) => match active.get(id) {
                Some(cancel) => {
                    info!(connection = %connection, correlation_id = %id, "Stop requested");
                    cancel.cancel();
                }
                None => debug!(connection = %connection, correlation_id = %id, "Stop for inactive generation"),
            },
            None => {
                info!(connection = %connection, count = active.len(), "Stop requested for all generations");
                active.values().for_each(CancellationToken::cancel);
            }
        }
    }

    /// Cancel a connection's sessions and forget it.
    pub async fn disconnect(&self, connection: &ConnectionId) {
        let removed = self.lock_connections().remove(connection);
        let was_admitted = self.registry.remove(connection);

        if let Some(conn) = removed {
            let active = lock(&conn.active);
            for cancel in active.values() {
                cancel.cancel();
            }
            info!(
                connection = %connection,
                authenticated = was_admitted,
                cancelled = active.len(),
                "Client disconnected"
            );
        }
    }

    pub fn connection_count(&self) -> usize {
        self.lock_connections().len()
    }

    /// Number of in-flight generations on a connection.
    pub fn active_sessions(&self, connection: &ConnectionId) -> usize {
        self.lookup(connection)
            .map(|(_, active)| lock(&active).len())
            .unwrap_or(0)
    }

    fn sink(&self, connection: &ConnectionId) -> Option<mpsc::Sender<OutboundEvent>> {
        self.lookup(connection).map(|(sink, _)| sink)
    }

    fn lookup(&self, connection: &ConnectionId) -> Option<(mpsc::Sender<OutboundEvent>, ActiveSessions)> {
        self.lock_connections()
            .get(connection)
            .map(|c| (c.sink.clone(), c.active.clone()))
    }

    fn lock_connections(&self) -> std::sync::MutexGuard<'_, HashMap<ConnectionId, Connection>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn lock(active: &ActiveSessions) -> std::sync::MutexGuard<'_, HashMap<String, CancellationToken>> {
    active.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A session's view of its connection.
///
/// Every session emits exactly one terminal event. The correlation id is
/// freed just before it goes out, so a client may reuse the id as soon as it
/// sees `result` or `error`.
struct SessionSink {
    inner: mpsc::Sender<OutboundEvent>,
    active: ActiveSessions,
    correlation_id: String,
}

impl SessionSink {
    fn release(&self) {
        lock(&self.active).remove(&self.correlation_id);
    }
}

#[async_trait]
impl EventSink for SessionSink {
    async fn emit(&self, event: OutboundEvent) {
        if event.is_terminal() {
            self.release();
        }
        self.inner.emit(event).await;
    }
}
