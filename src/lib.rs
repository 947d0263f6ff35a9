//! vaultflow - Watcher, orchestrator and approval gate for an AI employee vault
//!
//! A vault is a folder of Markdown files. Each work item is one file, and the
//! folder it lives in is its state:
//!
//! ```text
//! Inbox → Needs_Action → Pending_Approval → Approved → Done
//!              └──────────────────────────────────────→ Done
//!  (malformed) ───────────────────────────────────────→ Quarantine
//! ```
//!
//! Every move is recorded in an append-only daily JSONL audit log, and
//! sensitive actions only run once a human has moved the request to Approved.
//!
//! # Modules
//!
//! - `adapters`: Agent and action executor integrations (CLI agent)
//! - `core`: Item store, audit log, approval gate, orchestrator
//! - `domain`: Data structures (Item, ItemState, LogEntry)
//! - `ingest`: Watchers (file drops, mail and chat exports)
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Create a vault
//! vaultflow init ~/Vault
//!
//! # Watch the Inbox, and process items in another terminal
//! vaultflow watch ~/Vault
//! vaultflow orchestrate ~/Vault
//!
//! # Approve a pending request
//! vaultflow approve ~/Vault PAYMENT_ClientA
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod ingest;

// Re-export main types at crate root for convenience
pub use crate::core::{ApprovalGate, AuditLog, ItemStore, Orchestrator};
pub use config::VaultConfig;
pub use domain::{Item, ItemHeader, ItemState, LogEntry};
pub use ingest::{FilesystemWatcher, MessageWatcher, Watcher};
