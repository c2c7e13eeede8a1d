//! `AgentBackend` — the contract for the underlying conversational AI service.
//!
//! The backend is opaque to the coordinator: it can start or resume a
//! streaming query and supports cooperative cancellation through the request's
//! cancellation token. Each streamed event may carry a fresh continuation
//! token — an opaque handle for resuming the conversation later.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::CoreError;

/// Role of a streamed backend event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendEventKind {
    System,
    User,
    Assistant,
    Result,
}

/// One event of a streamed backend response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendEvent {
    pub kind: BackendEventKind,
    #[serde(default)]
    pub text: Option<String>,
    /// New resumption handle, when the backend issues one at this point.
    #[serde(default)]
    pub continuation_token: Option<String>,
    #[serde(default)]
    pub input_tokens: Option<u64>,
    #[serde(default)]
    pub output_tokens: Option<u64>,
}

impl BackendEvent {
    pub fn assistant(text: &str) -> Self {
        Self {
            kind: BackendEventKind::Assistant,
            text: Some(text.to_string()),
            continuation_token: None,
            input_tokens: None,
            output_tokens: None,
        }
    }

    pub fn result(token: &str) -> Self {
        Self {
            kind: BackendEventKind::Result,
            text: None,
            continuation_token: Some(token.to_string()),
            input_tokens: None,
            output_tokens: None,
        }
    }

    pub fn with_token(mut self, token: &str) -> Self {
        self.continuation_token = Some(token.to_string());
        self
    }

    pub fn with_usage(mut self, input: u64, output: u64) -> Self {
        self.input_tokens = Some(input);
        self.output_tokens = Some(output);
        self
    }
}

/// A start-or-resume query handed to the backend.
#[derive(Clone)]
pub struct QueryRequest {
    pub prompt: String,
    pub working_directory: String,
    /// Resume the prior conversation when present; start fresh otherwise.
    pub continuation_token: Option<String>,
    /// Cancelled by the session controller on abort; the backend should stop
    /// producing events when it observes the cancellation.
    pub cancellation: CancellationToken,
}

pub type BackendEventStream = Pin<Box<dyn Stream<Item = Result<BackendEvent, CoreError>> + Send>>;

#[async_trait]
pub trait AgentBackend: Send + Sync {
    /// Start (or resume) a streaming query.
    async fn start_query(&self, request: QueryRequest) -> Result<BackendEventStream, CoreError>;
}
