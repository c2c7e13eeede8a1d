//! Conductor Core — transport-agnostic coordination of AI-assistant sessions.
//!
//! This crate contains the domain logic for running declared step graphs
//! ("workflow runs") across long-running agent sessions, with human-approval
//! gates and crash-resumable checkpoints. It has **no HTTP framework
//! dependency**, making it suitable for use in:
//!
//! - HTTP servers (axum adapters on top)
//! - Desktop apps (direct IPC)
//! - CLI tools
//!
//! The conversational AI backend is an injected [`session::AgentBackend`]
//! implementation; the relational store is SQLite via [`db::Database`].

pub mod approval;
pub mod db;
pub mod engine;
pub mod error;
pub mod events;
pub mod models;
pub mod session;
pub mod state;
pub mod store;

// Convenience re-exports
pub use db::Database;
pub use error::CoreError;
pub use state::{Coordinator, CoordinatorConfig};
