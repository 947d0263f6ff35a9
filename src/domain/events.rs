//! Audit log entries.
//!
//! Every state transition, agent invocation and action outcome is recorded as an
//! immutable [`LogEntry`] in the append-only audit log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::state::ItemState;

/// A single record in the audit log.
///
/// Entries are never mutated or removed. The last known state of any item can be
/// reconstructed by replaying the entries that mention it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// Unique identifier for this entry
    pub id: Uuid,

    /// When this entry was recorded (ISO 8601)
    pub timestamp: DateTime<Utc>,

    /// The item this entry is about
    pub item_id: String,

    /// What happened
    pub action: AuditAction,

    /// How it turned out
    pub outcome: Outcome,

    /// Who did it
    pub actor: Actor,

    /// State before a transition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<ItemState>,

    /// State after a transition (or the state an item was created/observed in)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<ItemState>,

    /// Human-readable summary (NO secrets)
    pub summary: String,

    /// Time taken in milliseconds (agent invocations, actions)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,

    /// Error message if failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl LogEntry {
    /// Create a new entry with the current timestamp
    pub fn new(
        item_id: impl Into<String>,
        action: AuditAction,
        outcome: Outcome,
        actor: Actor,
        summary: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            item_id: item_id.into(),
            action,
            outcome,
            actor,
            from: None,
            to: None,
            summary: summary.into(),
            duration_ms: None,
            error: None,
        }
    }

    /// A successful state transition
    pub fn transition(item_id: impl Into<String>, from: ItemState, to: ItemState, actor: Actor) -> Self {
        Self::new(
            item_id,
            AuditAction::Transition,
            Outcome::Success,
            actor,
            format!("{} -> {}", from, to),
        )
        .with_states(Some(from), Some(to))
    }

    /// An item written into its first state
    pub fn created(item_id: impl Into<String>, state: ItemState, actor: Actor, summary: impl Into<String>) -> Self {
        Self::new(item_id, AuditAction::Created, Outcome::Success, actor, summary).with_states(None, Some(state))
    }

    pub fn with_states(mut self, from: Option<ItemState>, to: Option<ItemState>) -> Self {
        self.from = from;
        self.to = to;
        self
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// The state this entry places the item in, if any
    pub fn resulting_state(&self) -> Option<ItemState> {
        match self.action {
            AuditAction::Transition
            | AuditAction::Created
            | AuditAction::Quarantined
            | AuditAction::ApprovalBypassed
            | AuditAction::Rejected => self.to,
            _ => None,
        }
    }
}

/// Kinds of audited events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// Item written into its first state
    Created,

    /// Item moved between states
    Transition,

    /// Item claimed for processing
    Claimed,

    /// Reasoning agent invoked
    AgentInvoked,

    /// Persistence loop ran out of iterations or time
    Incomplete,

    /// Approved action executed
    ActionExecuted,

    /// Approved action failed (may be retried)
    ActionFailed,

    /// Sensitive action attempted without a matching Approved item
    AuthorizationDenied,

    /// Request left Pending_Approval for Done without passing Approved
    ApprovalBypassed,

    /// Request disappeared from Pending_Approval
    Rejected,

    /// Malformed item moved to Quarantine
    Quarantined,

    /// Human-visible alert created
    AlertRaised,

    /// Source item refused by the watcher (denylisted)
    SourceRejected,
}

/// Result of the audited event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
    Retried,
    Incomplete,
    Rejected,
}

/// Who performed the audited event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Actor {
    Watcher,
    Orchestrator,
    Agent,
    Human,
}
