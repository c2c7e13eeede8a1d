//! Event bus — pub/sub fabric decoupling producers from consumers.
//!
//! Local handler bookkeeping is independent of the transport: `emit` first
//! hands the event to the transport (failures propagate to the caller), then
//! fans out to every locally registered handler for the topic. The bus has no
//! durability guarantee; consumers recover authoritative state from the
//! store.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::CoreError;

/// Well-known topics published by the coordinator.
pub mod topics {
    pub const APPROVAL_CREATED: &str = "approval:created";
    pub const APPROVAL_RESOLVED: &str = "approval:resolved";
    pub const AGENT_STATUS_CHANGED: &str = "agent:status-changed";
    pub const AGENT_TOKEN_USAGE: &str = "agent:token-usage";
    pub const MESSAGE_NEW: &str = "message:new";
    pub const STEP_STATUS: &str = "workflow:step-status";
    pub const RUN_STATUS: &str = "workflow:run-status";
}

/// Transport selection. A closed set: choosing an unimplemented variant is a
/// conscious startup-time policy that falls back to in-process with a logged
/// warning, not a hidden runtime default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportConfig {
    #[default]
    InProcess,
    /// Reserved: WebSocket fan-out to connected dashboards.
    Websocket { url: String },
    /// Reserved: Redis pub/sub for multi-process deployments.
    Redis { url: String },
}

/// Delivery mechanism behind the bus.
#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    /// Forward one event. Errors propagate to the `emit` caller.
    async fn send(&self, topic: &str, payload: &serde_json::Value) -> Result<(), CoreError>;

    /// Release transport resources.
    async fn shutdown(&self) {}
}

/// Default transport: delivery is the local handler fan-out, so send is a no-op.
pub struct InProcessTransport;

#[async_trait]
impl Transport for InProcessTransport {
    fn name(&self) -> &'static str {
        "in-process"
    }

    async fn send(&self, _topic: &str, _payload: &serde_json::Value) -> Result<(), CoreError> {
        Ok(())
    }
}

/// Build a transport from config. Unimplemented variants fall back.
fn build_transport(config: &TransportConfig) -> Box<dyn Transport> {
    match config {
        TransportConfig::InProcess => Box::new(InProcessTransport),
        TransportConfig::Websocket { url } | TransportConfig::Redis { url } => {
            tracing::warn!(
                "[EventBus] Transport {:?} ({}) not implemented, falling back to in-process",
                config,
                url
            );
            Box::new(InProcessTransport)
        }
    }
}

type Handler = Arc<dyn Fn(&serde_json::Value) + Send + Sync>;

/// Token returned by `on`, used to unregister the exact handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerId {
    topic: String,
    id: u64,
}

struct EventBusInner {
    handlers: HashMap<String, Vec<(u64, Handler)>>,
    next_handler_id: u64,
    transport: Box<dyn Transport>,
}

/// Thread-safe pub/sub bus with a swappable transport.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<RwLock<EventBusInner>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Create a bus with the in-process transport.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(EventBusInner {
                handlers: HashMap::new(),
                next_handler_id: 0,
                transport: Box::new(InProcessTransport),
            })),
        }
    }

    /// Select the transport per config. Safe to call once at startup.
    pub async fn initialize(&self, config: &TransportConfig) -> Result<(), CoreError> {
        let transport = build_transport(config);
        tracing::info!("[EventBus] Using transport: {}", transport.name());
        let mut inner = self.inner.write().await;
        inner.transport.shutdown().await;
        inner.transport = transport;
        Ok(())
    }

    /// Install a pre-built transport (tests, embedders).
    pub async fn set_transport(&self, transport: Box<dyn Transport>) {
        let mut inner = self.inner.write().await;
        inner.transport.shutdown().await;
        inner.transport = transport;
    }

    /// Register a handler for a topic.
    pub async fn on<F>(&self, topic: &str, handler: F) -> HandlerId
    where
        F: Fn(&serde_json::Value) + Send + Sync + 'static,
    {
        let mut inner = self.inner.write().await;
        inner.next_handler_id += 1;
        let id = inner.next_handler_id;
        inner
            .handlers
            .entry(topic.to_string())
            .or_default()
            .push((id, Arc::new(handler)));
        HandlerId {
            topic: topic.to_string(),
            id,
        }
    }

    /// Unregister a handler. Returns whether it was present.
    pub async fn off(&self, handler_id: &HandlerId) -> bool {
        let mut inner = self.inner.write().await;
        let Some(list) = inner.handlers.get_mut(&handler_id.topic) else {
            return false;
        };
        let before = list.len();
        list.retain(|(id, _)| *id != handler_id.id);
        before != list.len()
    }

    /// Publish an event: transport first (failures propagate), then local
    /// fan-out. A panicking handler is isolated and logged; sibling handlers
    /// for the same emit still run. Zero handlers is success.
    pub async fn emit(&self, topic: &str, payload: serde_json::Value) -> Result<(), CoreError> {
        let handlers: Vec<Handler> = {
            let inner = self.inner.read().await;
            inner.transport.send(topic, &payload).await?;
            inner
                .handlers
                .get(topic)
                .map(|list| list.iter().map(|(_, h)| h.clone()).collect())
                .unwrap_or_default()
        };

        for handler in handlers {
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| handler(&payload)));
            if result.is_err() {
                tracing::warn!("[EventBus] Handler for '{}' panicked, continuing", topic);
            }
        }
        Ok(())
    }

    /// Release transport resources and clear all handler registries.
    pub async fn destroy(&self) {
        let mut inner = self.inner.write().await;
        inner.transport.shutdown().await;
        inner.transport = Box::new(InProcessTransport);
        inner.handlers.clear();
    }
}
