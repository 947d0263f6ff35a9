//! Domain types for vaultflow.
//!
//! This module contains the core data structures:
//! - State: the folder-backed item states and their transition table
//! - Item: header block + body documents
//! - Events: immutable audit log entries

pub mod events;
pub mod item;
pub mod state;

// Re-export commonly used types
pub use events::{Actor, AuditAction, LogEntry, Outcome};
pub use item::{Item, ItemHeader, ItemParseError, Priority};
pub use state::ItemState;
