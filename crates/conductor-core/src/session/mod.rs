//! Agent session controller — owns one agent's call lifecycle.
//!
//! A session survives across steps and runs, resuming the backend
//! conversation through its continuation token. Calls are strictly
//! serialized per session; cancellation is cooperative and advisory, with
//! the flag re-checked before every observable side effect to bound (not
//! eliminate) the abort race window.

pub mod backend;
pub mod scripted;

pub use backend::{AgentBackend, BackendEvent, BackendEventStream, QueryRequest};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::CoreError;
use crate::events::{topics, EventBus};
use crate::session::backend::BackendEventKind;

/// Availability of an agent session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Online,
    Busy,
    Offline,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Busy => "busy",
            Self::Offline => "offline",
        }
    }
}

/// Restores the session to `online` on every exit path of a call, and
/// broadcasts the change.
struct BusyGuard {
    status: Arc<StdMutex<SessionStatus>>,
    bus: EventBus,
    session_id: String,
    role: String,
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        let next = {
            let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner());
            // A call that marked the session offline keeps it offline.
            if *status == SessionStatus::Busy {
                *status = SessionStatus::Online;
            }
            *status
        };
        let bus = self.bus.clone();
        let payload = serde_json::json!({
            "sessionId": self.session_id,
            "role": self.role,
            "status": next.as_str(),
        });
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = bus.emit(topics::AGENT_STATUS_CHANGED, payload).await {
                    tracing::warn!("[Session] status-changed emit failed: {}", e);
                }
            });
        }
    }
}

/// Controller for one long-running agent session.
pub struct SessionController {
    pub id: String,
    pub role: String,
    backend: Arc<dyn AgentBackend>,
    bus: EventBus,
    status: Arc<StdMutex<SessionStatus>>,
    /// Newest continuation token observed on the stream.
    token: StdMutex<Option<String>>,
    /// Remembered across calls: an abort while idle trips the next
    /// processed event.
    cancel_flag: AtomicBool,
    /// Cancellation handle of the in-flight call, if any.
    current_call: StdMutex<Option<CancellationToken>>,
    /// Serializes send_message: at most one in-flight call per session.
    call_guard: Mutex<()>,
}

impl SessionController {
    pub fn new(role: &str, backend: Arc<dyn AgentBackend>, bus: EventBus) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role: role.to_string(),
            backend,
            bus,
            status: Arc::new(StdMutex::new(SessionStatus::Online)),
            token: StdMutex::new(None),
            cancel_flag: AtomicBool::new(false),
            current_call: StdMutex::new(None),
            call_guard: Mutex::new(()),
        }
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Newest continuation token observed so far.
    pub fn continuation_token(&self) -> Option<String> {
        self.token.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Request cooperative cancellation. No-op when idle beyond remembering
    /// the flag; the next processed stream event observes it.
    pub fn abort(&self) {
        self.cancel_flag.store(true, Ordering::SeqCst);
        if let Some(call) = self
            .current_call
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
        {
            tracing::info!("[Session:{}] abort requested, cancelling in-flight call", self.role);
            call.cancel();
        }
    }

    fn store_token(&self, token: &str) {
        *self.token.lock().unwrap_or_else(|e| e.into_inner()) = Some(token.to_string());
    }

    async fn emit_lossy(&self, topic: &str, payload: serde_json::Value) {
        // Bus events carry no durability guarantee; a failed emit is logged,
        // not fatal to the call.
        if let Err(e) = self.bus.emit(topic, payload).await {
            tracing::warn!("[Session:{}] emit '{}' failed: {}", self.role, topic, e);
        }
    }

    fn abort_error(&self) -> CoreError {
        self.cancel_flag.store(false, Ordering::SeqCst);
        CoreError::Aborted {
            continuation_token: self.continuation_token(),
        }
    }

    /// Send a prompt and stream the response, returning the final assistant
    /// text. Strictly serialized per session. On cancellation mid-stream,
    /// rejects with `CoreError::Aborted` carrying the last continuation
    /// token seen so far, so callers can resume rather than restart.
    pub async fn send_message(
        &self,
        content: &str,
        working_directory: &str,
        continuation_token: Option<String>,
    ) -> Result<String, CoreError> {
        let _serialized = self.call_guard.lock().await;

        let call_token = CancellationToken::new();
        *self
            .current_call
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(call_token.clone());

        *self.status.lock().unwrap_or_else(|e| e.into_inner()) = SessionStatus::Busy;
        let _busy = BusyGuard {
            status: self.status.clone(),
            bus: self.bus.clone(),
            session_id: self.id.clone(),
            role: self.role.clone(),
        };
        self.emit_lossy(
            topics::AGENT_STATUS_CHANGED,
            serde_json::json!({
                "sessionId": self.id,
                "role": self.role,
                "status": SessionStatus::Busy.as_str(),
            }),
        )
        .await;

        if let Some(token) = &continuation_token {
            self.store_token(token);
        }

        let request = QueryRequest {
            prompt: content.to_string(),
            working_directory: working_directory.to_string(),
            continuation_token: continuation_token.or_else(|| self.continuation_token()),
            cancellation: call_token.clone(),
        };

        let result = self.run_stream(request, &call_token).await;

        *self
            .current_call
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = None;
        result
    }

    async fn run_stream(
        &self,
        request: QueryRequest,
        call_token: &CancellationToken,
    ) -> Result<String, CoreError> {
        if self.cancel_flag.load(Ordering::SeqCst) {
            return Err(self.abort_error());
        }

        let mut stream = match self.backend.start_query(request).await {
            Ok(stream) => stream,
            Err(e) => {
                *self.status.lock().unwrap_or_else(|p| p.into_inner()) = SessionStatus::Offline;
                return Err(wrap_provider(e));
            }
        };

        let mut final_text = String::new();
        while let Some(event) = stream.next().await {
            // Re-check before every observable side effect.
            if self.cancel_flag.load(Ordering::SeqCst) {
                call_token.cancel();
                return Err(self.abort_error());
            }

            let event = event.map_err(wrap_provider)?;

            // Update the stored token *before* any notification referencing
            // this point, so no consumer observes a notification paired with
            // a stale token.
            if let Some(token) = &event.continuation_token {
                self.store_token(token);
            }

            match event.kind {
                BackendEventKind::Assistant => {
                    if let Some(text) = &event.text {
                        final_text.push_str(text);
                        self.emit_lossy(
                            topics::MESSAGE_NEW,
                            serde_json::json!({
                                "sessionId": self.id,
                                "role": self.role,
                                "text": text,
                                "continuationToken": self.continuation_token(),
                            }),
                        )
                        .await;
                    }
                }
                BackendEventKind::Result => {
                    if event.input_tokens.is_some() || event.output_tokens.is_some() {
                        self.emit_lossy(
                            topics::AGENT_TOKEN_USAGE,
                            serde_json::json!({
                                "sessionId": self.id,
                                "role": self.role,
                                "inputTokens": event.input_tokens,
                                "outputTokens": event.output_tokens,
                            }),
                        )
                        .await;
                    }
                }
                BackendEventKind::System | BackendEventKind::User => {
                    tracing::debug!("[Session:{}] {:?} event", self.role, event.kind);
                }
            }
        }

        if self.cancel_flag.load(Ordering::SeqCst) {
            return Err(self.abort_error());
        }
        Ok(final_text)
    }
}

/// Wrap backend failures so no raw provider error crosses the controller
/// boundary; typed aborts pass through.
fn wrap_provider(e: CoreError) -> CoreError {
    match e {
        CoreError::Aborted { .. } | CoreError::Provider(_) => e,
        other => CoreError::Provider(other.to_string()),
    }
}

/// Role-keyed registry of session controllers. Sessions are created on
/// first dispatch and reused across steps and runs.
#[derive(Clone)]
pub struct SessionRegistry {
    backend: Arc<dyn AgentBackend>,
    bus: EventBus,
    sessions: Arc<RwLock<HashMap<String, Arc<SessionController>>>>,
}

impl SessionRegistry {
    pub fn new(backend: Arc<dyn AgentBackend>, bus: EventBus) -> Self {
        Self {
            backend,
            bus,
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn get_or_create(&self, role: &str) -> Arc<SessionController> {
        if let Some(session) = self.sessions.read().await.get(role) {
            return session.clone();
        }
        let mut sessions = self.sessions.write().await;
        sessions
            .entry(role.to_string())
            .or_insert_with(|| {
                tracing::info!("[SessionRegistry] Creating session for role '{}'", role);
                Arc::new(SessionController::new(
                    role,
                    self.backend.clone(),
                    self.bus.clone(),
                ))
            })
            .clone()
    }

    pub async fn get(&self, role: &str) -> Option<Arc<SessionController>> {
        self.sessions.read().await.get(role).cloned()
    }

    /// Abort the sessions for the given roles (run abort support).
    pub async fn abort_roles(&self, roles: &[String]) {
        let sessions = self.sessions.read().await;
        for role in roles {
            if let Some(session) = sessions.get(role) {
                session.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::backend::BackendEvent;
    use crate::session::scripted::{ScriptedBackend, ScriptedCall};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn controller(backend: &ScriptedBackend) -> SessionController {
        SessionController::new("dev", Arc::new(backend.clone()), EventBus::new())
    }

    #[tokio::test]
    async fn send_message_collects_final_text_and_token() {
        let backend = ScriptedBackend::echoing();
        backend.push(ScriptedCall::Events {
            events: vec![
                BackendEvent::assistant("hello "),
                BackendEvent::assistant("world").with_token("tok-a"),
                BackendEvent::result("tok-b").with_usage(5, 9),
            ],
            delay: Duration::ZERO,
        });
        let session = controller(&backend);

        let text = session.send_message("hi", "/tmp", None).await.unwrap();
        assert_eq!(text, "hello world");
        assert_eq!(session.continuation_token().as_deref(), Some("tok-b"));
        assert_eq!(session.status(), SessionStatus::Online);
    }

    #[tokio::test]
    async fn continuation_token_is_passed_to_backend() {
        let backend = ScriptedBackend::echoing();
        let session = controller(&backend);

        session.send_message("first", "/tmp", None).await.unwrap();
        session.send_message("second", "/tmp", None).await.unwrap();

        let requests = backend.requests();
        assert_eq!(requests[0].continuation_token, None);
        // Second call resumes from the token issued by the first.
        assert_eq!(requests[1].continuation_token.as_deref(), Some("tok-1"));
    }

    #[tokio::test]
    async fn abort_mid_stream_carries_last_token_seen() {
        let backend = ScriptedBackend::echoing();
        backend.push(ScriptedCall::Events {
            events: vec![
                BackendEvent::assistant("part 1").with_token("tok-early"),
                BackendEvent::assistant("part 2").with_token("tok-late"),
                BackendEvent::result("tok-final"),
            ],
            delay: Duration::from_millis(40),
        });
        let session = Arc::new(controller(&backend));

        let s = session.clone();
        let handle = tokio::spawn(async move { s.send_message("go", "/tmp", None).await });
        // Let the first event through, then abort.
        tokio::time::sleep(Duration::from_millis(60)).await;
        session.abort();

        let err = handle.await.unwrap().unwrap_err();
        match err {
            CoreError::Aborted { continuation_token } => {
                assert_eq!(continuation_token.as_deref(), Some("tok-early"));
            }
            other => panic!("expected abort, got {:?}", other),
        }
        // Status released on the failure path too.
        assert_eq!(session.status(), SessionStatus::Online);
    }

    #[tokio::test]
    async fn abort_while_idle_trips_next_call() {
        let backend = ScriptedBackend::echoing();
        let session = controller(&backend);
        session.abort();

        let err = session.send_message("hi", "/tmp", None).await.unwrap_err();
        match err {
            CoreError::Aborted { continuation_token } => assert!(continuation_token.is_none()),
            other => panic!("expected abort, got {:?}", other),
        }

        // Flag consumed: the following call proceeds normally.
        let text = session.send_message("hi again", "/tmp", None).await.unwrap();
        assert!(text.starts_with("ok:"));
    }

    #[tokio::test]
    async fn provider_failure_is_wrapped_and_releases_status() {
        let backend = ScriptedBackend::echoing();
        backend.push(ScriptedCall::Fail("backend exploded".into()));
        let session = controller(&backend);

        let err = session.send_message("hi", "/tmp", None).await.unwrap_err();
        assert!(matches!(err, CoreError::Provider(_)));
        assert_eq!(session.status(), SessionStatus::Offline);
    }

    #[tokio::test]
    async fn token_update_precedes_message_notification() {
        // The message:new payload must reference the token issued on the
        // same event, never a stale one.
        let backend = ScriptedBackend::echoing();
        backend.push(ScriptedCall::Events {
            events: vec![BackendEvent::assistant("text").with_token("tok-now")],
            delay: Duration::ZERO,
        });
        let bus = EventBus::new();
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let s = seen.clone();
        bus.on(topics::MESSAGE_NEW, move |payload| {
            s.lock().unwrap().push(
                payload["continuationToken"]
                    .as_str()
                    .map(|t| t.to_string()),
            );
        })
        .await;
        let session = SessionController::new("dev", Arc::new(backend.clone()), bus);

        session.send_message("hi", "/tmp", None).await.unwrap();
        assert_eq!(
            seen.lock().unwrap().as_slice(),
            &[Some("tok-now".to_string())]
        );
    }

    #[tokio::test]
    async fn calls_are_serialized_per_session() {
        let backend = ScriptedBackend::echoing();
        // Two slow calls; if they interleave, the active counter would hit 2.
        for _ in 0..2 {
            backend.push(ScriptedCall::Events {
                events: vec![
                    BackendEvent::assistant("a"),
                    BackendEvent::result("tok"),
                ],
                delay: Duration::from_millis(30),
            });
        }
        let session = Arc::new(controller(&backend));
        let started = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..2 {
            let s = session.clone();
            let backend = backend.clone();
            let started = started.clone();
            handles.push(tokio::spawn(async move {
                s.send_message("x", "/tmp", None).await.unwrap();
                // After each call completes, only the calls finished so far
                // may have reached the backend.
                let finished = started.fetch_add(1, Ordering::SeqCst) + 1;
                assert!(backend.requests().len() <= finished + 1);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(backend.requests().len(), 2);
        assert_eq!(session.status(), SessionStatus::Online);
    }

    #[tokio::test]
    async fn registry_reuses_sessions_by_role() {
        let backend = ScriptedBackend::echoing();
        let registry = SessionRegistry::new(Arc::new(backend), EventBus::new());
        let a = registry.get_or_create("dev").await;
        let b = registry.get_or_create("dev").await;
        let c = registry.get_or_create("ops").await;
        assert_eq!(a.id, b.id);
        assert_ne!(a.id, c.id);
        assert!(registry.get("nobody").await.is_none());
    }
}
