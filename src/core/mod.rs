//! Core vault engine.
//!
//! This module contains:
//! - ItemStore: folder-per-state item storage with atomic moves
//! - AuditLog: append-only daily JSONL log
//! - ApprovalGate: human sign-off before sensitive actions
//! - Orchestrator: claims items, drives the agent, executes approved actions
//! - Handbook, Dashboard, Alerts: the human-facing vault documents

pub mod alerts;
pub mod approval;
pub mod atomic;
pub mod audit_log;
pub mod claims;
pub mod dashboard;
pub mod handbook;
pub mod item_store;
pub mod limits;
pub mod orchestrator;
pub mod shutdown;

// Re-export commonly used types
pub use alerts::Alerts;
pub use approval::{ApprovalGate, Authorization, GateError, ReconcileReport};
pub use audit_log::AuditLog;
pub use claims::{Claim, ClaimRegistry};
pub use dashboard::Dashboard;
pub use handbook::{ApprovalRule, Handbook, HandbookError};
pub use item_store::{ItemStore, StoreError};
pub use limits::{LimitExceeded, PersistenceLimits, PersistenceTracker, RetryPolicy};
pub use orchestrator::{CycleReport, Orchestrator};
pub use shutdown::{ShutdownSignal, ShutdownTrigger};
