//! Human approval gate.
//!
//! A sensitive action is a request item in `Pending_Approval`. It may run only
//! after a human moves that same file into `Approved`, and only while it is still
//! there: [`ApprovalGate::authorize`] is checked immediately before acting.
//! Rejection is implicit (the request is deleted or never moved).
//!
//! Humans approve by moving files in their editor, so the gate learns about
//! approvals after the fact. [`ApprovalGate::reconcile`] compares the audit log's
//! last known state of each request with where the file is now and records what
//! the human did.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::domain::{Actor, AuditAction, Item, ItemHeader, ItemState, LogEntry, Outcome};

use super::alerts::Alerts;
use super::audit_log::AuditLog;
use super::item_store::{ItemStore, StoreError};

/// Errors from the approval gate
#[derive(Debug, Error)]
pub enum GateError {
    #[error("Action {0} is not approved (no matching item in Approved)")]
    NotApproved(String),

    #[error("Item {id} is in {state}, expected {expected}")]
    WrongState {
        id: String,
        state: ItemState,
        expected: ItemState,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Audit(#[from] anyhow::Error),

    #[error("Failed to raise alert: {0}")]
    Alert(#[from] std::io::Error),
}

/// Proof that a request was in `Approved` when checked
#[derive(Debug, Clone)]
pub struct Authorization {
    pub item_id: String,

    /// The approved request's header: the action it authorizes
    pub header: ItemHeader,
    pub body: String,
    pub path: PathBuf,
    pub checked_at: DateTime<Utc>,
}

/// What a reconcile pass observed
#[derive(Debug, Default, Clone)]
pub struct ReconcileReport {
    /// Requests first seen in Pending_Approval or Approved
    pub registered: Vec<String>,

    /// Moved to Approved by a human
    pub approved: Vec<String>,

    /// Removed or withdrawn by a human
    pub rejected: Vec<String>,

    /// Moved from Pending_Approval straight to Done
    pub bypassed: Vec<String>,

    /// Showed up in Approved without ever being pending; quarantined
    pub denied: Vec<String>,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.registered.is_empty()
            && self.approved.is_empty()
            && self.rejected.is_empty()
            && self.bypassed.is_empty()
            && self.denied.is_empty()
    }

    pub fn merge(&mut self, other: ReconcileReport) {
        self.registered.extend(other.registered);
        self.approved.extend(other.approved);
        self.rejected.extend(other.rejected);
        self.bypassed.extend(other.bypassed);
        self.denied.extend(other.denied);
    }
}

#[derive(Debug, Clone)]
pub struct ApprovalGate {
    store: ItemStore,
    log: AuditLog,
    alerts: Alerts,
}

impl ApprovalGate {
    pub fn new(store: ItemStore, log: AuditLog) -> Self {
        let alerts = Alerts::new(store.root());
        Self { store, log, alerts }
    }

    /// Turn an actionable item into an approval request
    #[instrument(skip(self, item), fields(item_id = %item.id))]
    pub async fn request(&self, item: &Item, reason: &str) -> Result<(), GateError> {
        if item.state != ItemState::NeedsAction {
            return Err(GateError::WrongState {
                id: item.id.clone(),
                state: item.state,
                expected: ItemState::NeedsAction,
            });
        }

        let mut header = item.header.clone();
        header.status = "pending_approval".to_string();
        header
            .extra
            .insert("approval_reason".to_string(), reason.into());

        self.store
            .update(ItemState::NeedsAction, &item.id, &header, &item.body)
            .await?;
        self.store
            .transition(&item.id, ItemState::NeedsAction, ItemState::PendingApproval)
            .await?;

        let mut entry = LogEntry::transition(
            &item.id,
            ItemState::NeedsAction,
            ItemState::PendingApproval,
            Actor::Orchestrator,
        );
        entry.summary = format!("approval requested: {}", reason);
        self.log.append(&entry).await?;

        info!(reason, "Approval requested");
        Ok(())
    }

    /// Human helper: approve a pending request (what dragging the file does)
    #[instrument(skip(self))]
    pub async fn approve(&self, item_id: &str) -> Result<(), GateError> {
        self.store
            .transition(item_id, ItemState::PendingApproval, ItemState::Approved)
            .await?;

        self.log
            .append(&LogEntry::transition(
                item_id,
                ItemState::PendingApproval,
                ItemState::Approved,
                Actor::Human,
            ))
            .await?;

        info!("Approved");
        Ok(())
    }

    /// Check that a request is in `Approved` right now and that the log saw
    /// it get there from `Pending_Approval`
    pub async fn authorize(&self, item_id: &str) -> Result<Authorization, GateError> {
        let item = match self.store.read(ItemState::Approved, item_id).await {
            Ok(item) => item,
            Err(StoreError::NotFound { .. }) => {
                return self.deny(item_id, "no matching request in Approved").await;
            }
            Err(e) => return Err(e.into()),
        };

        let last = self.log.last_known_states().await?.remove(item_id);
        if last != Some(ItemState::Approved) {
            return self.deny(item_id, "approval was never recorded").await;
        }

        Ok(Authorization {
            item_id: item.id,
            header: item.header,
            body: item.body,
            path: item.path,
            checked_at: Utc::now(),
        })
    }

    async fn deny(&self, item_id: &str, reason: &str) -> Result<Authorization, GateError> {
        warn!(item_id, reason, "Authorization denied");
        self.log
            .append(&LogEntry::new(
                item_id,
                AuditAction::AuthorizationDenied,
                Outcome::Rejected,
                Actor::Orchestrator,
                reason,
            ))
            .await?;
        Err(GateError::NotApproved(item_id.to_string()))
    }

    /// Record approvals, rejections and bypasses made by humans since the last pass
    #[instrument(skip(self))]
    pub async fn reconcile(&self) -> Result<ReconcileReport, GateError> {
        let mut report = ReconcileReport::default();
        let known = self.log.last_known_states().await?;

        // Requests the log has never placed in the approval folders. A new
        // request in Pending_Approval is the agent's; one in Approved is denied.
        for state in [ItemState::PendingApproval, ItemState::Approved] {
            for id in self.store.list_ids(state).await? {
                let last = known.get(&id).copied();
                if matches!(last, Some(ItemState::PendingApproval | ItemState::Approved)) {
                    // Tracked request; moves between the two are handled below
                    continue;
                }
                if state == ItemState::Approved {
                    if !self.alerts.is_active(&id).await {
                        self.deny_unrequested(&id, last, &mut report).await?;
                    }
                    continue;
                }

                let entry = match last {
                    Some(from) if from.can_transition_to(state) => {
                        LogEntry::transition(&id, from, state, Actor::Agent)
                    }
                    _ => LogEntry::created(&id, state, Actor::Agent, "approval request registered"),
                };
                self.log.append(&entry).await?;
                report.registered.push(id);
            }
        }

        let mut tracked: Vec<_> = known
            .into_iter()
            .filter(|(_, s)| matches!(s, ItemState::PendingApproval | ItemState::Approved))
            .collect();
        tracked.sort();

        for (id, last) in tracked {
            let current = self.store.locate(&id).await;
            if current == Some(last) {
                continue;
            }
            self.record_human_move(&id, last, current, &mut report).await?;
        }

        if !report.is_empty() {
            info!(
                registered = report.registered.len(),
                approved = report.approved.len(),
                rejected = report.rejected.len(),
                bypassed = report.bypassed.len(),
                denied = report.denied.len(),
                "Reconciled approvals"
            );
        }

        Ok(report)
    }

    /// Approved without a pending request: log, quarantine, alert
    async fn deny_unrequested(
        &self,
        id: &str,
        last: Option<ItemState>,
        report: &mut ReconcileReport,
    ) -> Result<(), GateError> {
        warn!(item_id = id, last = ?last, "Item in Approved was never pending approval");
        let entry = LogEntry::new(
            id,
            AuditAction::AuthorizationDenied,
            Outcome::Rejected,
            Actor::Orchestrator,
            "appeared in Approved without passing through Pending_Approval",
        )
        .with_states(last, Some(ItemState::Approved));
        self.log.append(&entry).await?;

        match self
            .store
            .transition(id, ItemState::Approved, ItemState::Quarantine)
            .await
        {
            Ok(_) => {
                let entry = LogEntry::new(
                    id,
                    AuditAction::Quarantined,
                    Outcome::Failure,
                    Actor::Orchestrator,
                    "moved from Approved to Quarantine",
                )
                .with_states(Some(ItemState::Approved), Some(ItemState::Quarantine));
                self.log.append(&entry).await?;
            }
            // Left in place; the alert keeps it from running
            Err(e) => warn!(item_id = id, error = %e, "Failed to quarantine"),
        }

        self.raise_alert(
            id,
            "Approved without a request",
            "This item appeared in Approved without first waiting in Pending_Approval. \
             Nothing was executed and the item was moved to Quarantine. To run it, \
             place the request in Pending_Approval and approve it from there.",
        )
        .await?;
        report.denied.push(id.to_string());
        Ok(())
    }

    async fn record_human_move(
        &self,
        id: &str,
        last: ItemState,
        current: Option<ItemState>,
        report: &mut ReconcileReport,
    ) -> Result<(), GateError> {
        match (last, current) {
            (ItemState::PendingApproval, Some(ItemState::Done)) => {
                warn!(item_id = id, "Request moved to Done without approval");
                let entry = LogEntry::new(
                    id,
                    AuditAction::ApprovalBypassed,
                    Outcome::Failure,
                    Actor::Human,
                    "moved from Pending_Approval to Done without approval; action not executed",
                )
                .with_states(Some(last), Some(ItemState::Done));
                self.log.append(&entry).await?;

                self.raise_alert(
                    id,
                    "Approval bypassed",
                    "This request was moved from Pending_Approval directly to Done. \
                     The action was NOT executed. To run it, move the request back \
                     through Approved.",
                )
                .await?;
                report.bypassed.push(id.to_string());
            }
            (from, Some(to)) if from.can_transition_to(to) => {
                self.log
                    .append(&LogEntry::transition(id, from, to, Actor::Human))
                    .await?;
                if to == ItemState::Approved {
                    info!(item_id = id, "Approval observed");
                    report.approved.push(id.to_string());
                }
            }
            (from, to) => {
                let summary = match to {
                    Some(to) => format!("request moved from {} to {} outside the approval flow", from, to),
                    None => format!("request removed from {}", from),
                };
                info!(item_id = id, %summary, "Request rejected");
                let entry = LogEntry::new(id, AuditAction::Rejected, Outcome::Rejected, Actor::Human, summary)
                    .with_states(Some(from), to);
                self.log.append(&entry).await?;
                report.rejected.push(id.to_string());
            }
        }

        Ok(())
    }

    async fn raise_alert(&self, id: &str, title: &str, detail: &str) -> Result<(), GateError> {
        if self.alerts.raise(id, title, detail).await? {
            self.log
                .append(&LogEntry::new(
                    id,
                    AuditAction::AlertRaised,
                    Outcome::Success,
                    Actor::Orchestrator,
                    title,
                ))
                .await?;
        }
        Ok(())
    }
}
