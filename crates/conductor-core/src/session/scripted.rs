//! `ScriptedBackend` — a test double for `AgentBackend`.
//!
//! Useful in unit and integration tests where a real conversational backend
//! is unavailable. Each call pops the next scripted response; every request
//! seen is recorded for assertions.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::CoreError;
use crate::session::backend::{
    AgentBackend, BackendEvent, BackendEventStream, QueryRequest,
};

/// Behaviour of one scripted call.
#[derive(Clone)]
pub enum ScriptedCall {
    /// Stream the given events, pausing `delay` between them. The stream
    /// ends early with no further events if the request's cancellation token
    /// fires mid-delay.
    Events {
        events: Vec<BackendEvent>,
        delay: Duration,
    },
    /// Fail the whole call with a provider error.
    Fail(String),
}

/// Recorded view of a request, for assertions.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub prompt: String,
    pub working_directory: String,
    pub continuation_token: Option<String>,
}

/// A backend that replays scripted responses in call order.
#[derive(Clone)]
pub struct ScriptedBackend {
    script: Arc<Mutex<VecDeque<ScriptedCall>>>,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    /// Response used when the script queue is empty.
    fallback: Arc<ScriptedCall>,
}

impl ScriptedBackend {
    /// A backend that answers every call with a single assistant message and
    /// a result event carrying a fresh token derived from the call index.
    pub fn echoing() -> Self {
        Self {
            script: Arc::new(Mutex::new(VecDeque::new())),
            requests: Arc::new(Mutex::new(Vec::new())),
            fallback: Arc::new(ScriptedCall::Events {
                events: vec![],
                delay: Duration::ZERO,
            }),
        }
    }

    /// Queue the next scripted call.
    pub fn push(&self, call: ScriptedCall) {
        self.script.lock().unwrap().push_back(call);
    }

    /// All requests seen so far, in call order.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl AgentBackend for ScriptedBackend {
    async fn start_query(&self, request: QueryRequest) -> Result<BackendEventStream, CoreError> {
        self.requests.lock().unwrap().push(RecordedRequest {
            prompt: request.prompt.clone(),
            working_directory: request.working_directory.clone(),
            continuation_token: request.continuation_token.clone(),
        });

        let call = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| (*self.fallback).clone());

        let call = match call {
            ScriptedCall::Fail(msg) => return Err(CoreError::Provider(msg)),
            ScriptedCall::Events { events, delay } => (events, delay),
        };
        let (events, delay) = call;
        let call_count = self.requests.lock().unwrap().len();
        let cancellation = request.cancellation.clone();

        let stream = async_stream::stream! {
            if events.is_empty() {
                // Echo fallback: respond to the prompt and issue a token.
                yield Ok(BackendEvent::assistant(&format!("ok: {}", request.prompt)));
                yield Ok(BackendEvent::result(&format!("tok-{}", call_count))
                    .with_usage(10, 20));
                return;
            }
            for event in events {
                if !delay.is_zero() {
                    tokio::select! {
                        _ = cancellation.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                yield Ok(event);
            }
        };
        Ok(Box::pin(stream))
    }
}
