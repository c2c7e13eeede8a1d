//! SQLite-backed stores over [`crate::db::Database`].

pub mod approval_store;
pub mod run_store;

pub use approval_store::{ApprovalStore, SYSTEM_AUTO_APPROVER};
pub use run_store::RunStore;
