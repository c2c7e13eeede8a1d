//! Coordinator composition root.
//!
//! Wires the database, stores, event bus, session registry, approval gate
//! and engine together from one config. Everything is injected — no
//! globals — so tests and embedders can assemble alternative stacks.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::approval::ApprovalGate;
use crate::db::Database;
use crate::engine::WorkflowEngine;
use crate::error::CoreError;
use crate::events::{EventBus, TransportConfig};
use crate::session::backend::AgentBackend;
use crate::session::SessionRegistry;
use crate::store::{ApprovalStore, RunStore};

/// Coordinator configuration, deserializable from a JSON config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CoordinatorConfig {
    /// SQLite database path. `None` keeps everything in memory.
    pub db_path: Option<String>,
    /// Default parallelism bound for runs that don't specify one.
    pub max_parallel: usize,
    /// How often approval steps check for a decision.
    pub approval_poll_ms: u64,
    pub transport: TransportConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            max_parallel: 4,
            approval_poll_ms: 1000,
            transport: TransportConfig::InProcess,
        }
    }
}

/// Fully wired coordination stack.
#[derive(Clone)]
pub struct Coordinator {
    pub db: Database,
    pub bus: EventBus,
    pub sessions: SessionRegistry,
    pub approvals: ApprovalGate,
    pub engine: WorkflowEngine,
}

impl Coordinator {
    pub async fn new(
        config: CoordinatorConfig,
        backend: Arc<dyn AgentBackend>,
    ) -> Result<Self, CoreError> {
        let db = match &config.db_path {
            Some(path) => Database::open(path)?,
            None => Database::open_in_memory()?,
        };

        let bus = EventBus::new();
        bus.initialize(&config.transport).await?;

        let sessions = SessionRegistry::new(backend, bus.clone());
        let approvals = ApprovalGate::new(ApprovalStore::new(db.clone()), bus.clone());
        let engine = WorkflowEngine::new(
            RunStore::new(db.clone()),
            approvals.clone(),
            sessions.clone(),
            bus.clone(),
            config.approval_poll_ms,
        );

        tracing::info!(
            "[Coordinator] Initialized (db: {})",
            config.db_path.as_deref().unwrap_or(":memory:")
        );
        Ok(Self {
            db,
            bus,
            sessions,
            approvals,
            engine,
        })
    }
}
