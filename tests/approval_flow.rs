//! Approval Gate Integration Tests
//!
//! Sensitive actions run only after a human moves the request to Approved,
//! run at most once, and every bypass or failure leaves a trace.

mod common;

use common::{CountingExecutor, Script, ScriptedAgent, TestVault};
use chrono::Utc;
use tokio_test::assert_ok;
use vaultflow::core::{ApprovalGate, AuditLog};
use vaultflow::domain::state::is_legal_history;
use vaultflow::domain::{Actor, AuditAction, ItemHeader, ItemState, LogEntry, Outcome, Priority};

const PAYMENT: &str = "PAYMENT_ClientA";

async fn transitions(log: &AuditLog, id: &str) -> Vec<LogEntry> {
    log.history(id)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.action == AuditAction::Transition)
        .collect()
}

#[tokio::test]
async fn test_payment_waits_for_human_approval() {
    let vault = TestVault::new().await;
    vault.add_payment(PAYMENT, 600).await;

    let agent = ScriptedAgent::new(vault.root(), Script::Complete);
    let executor = CountingExecutor::succeeding();
    let orchestrator = vault.orchestrator(agent.clone(), executor.clone()).await;

    // The agent finishes drafting; the payment becomes a request
    let report = assert_ok!(orchestrator.run_cycle().await);
    assert_eq!(report.requested, vec![PAYMENT]);
    assert!(vault.path_of(ItemState::PendingApproval, PAYMENT).exists());
    assert_eq!(executor.calls(), 0);

    let request = std::fs::read_to_string(vault.path_of(ItemState::PendingApproval, PAYMENT)).unwrap();
    assert!(request.contains("status: pending_approval"));
    assert!(request.contains("approval_reason"));

    // Nothing happens while the request waits
    assert_ok!(orchestrator.run_cycle().await);
    assert_ok!(orchestrator.run_cycle().await);
    assert_eq!(executor.calls(), 0);
    assert_eq!(agent.calls(), 1);

    // Human approves by dragging the file
    vault.drag(PAYMENT, ItemState::PendingApproval, ItemState::Approved);
    let report = assert_ok!(orchestrator.run_cycle().await);

    assert_eq!(report.reconciled.approved, vec![PAYMENT]);
    assert_eq!(report.executed, vec![PAYMENT]);
    assert_eq!(executor.calls(), 1);
    assert!(vault.path_of(ItemState::Done, PAYMENT).exists());

    // Never twice
    assert_ok!(orchestrator.run_cycle().await);
    assert_eq!(executor.calls(), 1);

    let log = orchestrator.audit_log();
    let moves = transitions(log, PAYMENT).await;
    let path: Vec<_> = moves.iter().map(|e| (e.from, e.to, e.actor)).collect();
    assert_eq!(
        path,
        vec![
            (Some(ItemState::NeedsAction), Some(ItemState::PendingApproval), Actor::Orchestrator),
            (Some(ItemState::PendingApproval), Some(ItemState::Approved), Actor::Human),
            (Some(ItemState::Approved), Some(ItemState::Done), Actor::Orchestrator),
        ]
    );

    let executed = log
        .find_entries(|e| e.item_id == PAYMENT && e.action == AuditAction::ActionExecuted)
        .await
        .unwrap();
    assert_eq!(executed.len(), 1);

    let states: Vec<_> = log
        .history(PAYMENT)
        .await
        .unwrap()
        .iter()
        .filter_map(LogEntry::resulting_state)
        .collect();
    assert!(is_legal_history(&states));
}

#[tokio::test]
async fn test_small_payment_needs_no_approval() {
    let vault = TestVault::new().await;
    vault.add_payment("PAYMENT_small", 40).await;

    let agent = ScriptedAgent::new(vault.root(), Script::Complete);
    let executor = CountingExecutor::succeeding();
    let orchestrator = vault.orchestrator(agent, executor.clone()).await;

    let report = assert_ok!(orchestrator.run_cycle().await);
    assert_eq!(report.completed, vec!["PAYMENT_small"]);
    assert!(vault.path_of(ItemState::Done, "PAYMENT_small").exists());
    assert_eq!(executor.calls(), 0);
}

#[tokio::test]
async fn test_approve_command_path() {
    let vault = TestVault::new().await;
    vault.add_payment(PAYMENT, 900).await;

    let agent = ScriptedAgent::new(vault.root(), Script::Complete);
    let executor = CountingExecutor::succeeding();
    let orchestrator = vault.orchestrator(agent, executor.clone()).await;
    assert_ok!(orchestrator.run_cycle().await);

    let gate = ApprovalGate::new(vault.store.clone(), orchestrator.audit_log().clone());
    assert_ok!(gate.approve(PAYMENT).await);
    assert!(gate.approve(PAYMENT).await.is_err());

    let report = assert_ok!(orchestrator.run_cycle().await);
    // Already logged by the gate, nothing left to reconcile
    assert!(report.reconciled.approved.is_empty());
    assert_eq!(report.executed, vec![PAYMENT]);
    assert_eq!(executor.calls(), 1);
}

#[tokio::test]
async fn test_action_failing_twice_raises_alert() {
    let vault = TestVault::new().await;
    vault.add_payment(PAYMENT, 600).await;

    let agent = ScriptedAgent::new(vault.root(), Script::Complete);
    let executor = CountingExecutor::failing(u32::MAX);
    let orchestrator = vault.orchestrator(agent, executor.clone()).await;
    assert_ok!(orchestrator.run_cycle().await);

    vault.drag(PAYMENT, ItemState::PendingApproval, ItemState::Approved);
    let report = assert_ok!(orchestrator.run_cycle().await);

    assert_eq!(report.failed, vec![PAYMENT]);
    assert_eq!(executor.calls(), 2);
    assert!(vault.path_of(ItemState::Approved, PAYMENT).exists());
    assert!(!vault.path_of(ItemState::Done, PAYMENT).exists());

    let alert = vault.root().join("Alerts").join(format!("ALERT_{}.md", PAYMENT));
    assert!(alert.exists());

    let failures = orchestrator
        .audit_log()
        .find_entries(|e| e.item_id == PAYMENT && e.action == AuditAction::ActionFailed)
        .await
        .unwrap();
    assert_eq!(failures.len(), 2);
    assert_eq!(failures[0].outcome, Outcome::Retried);
    assert_eq!(failures[1].outcome, Outcome::Failure);
    assert!(failures.iter().all(|e| e.error.is_some()));

    // Alert open: no further attempts
    let report = assert_ok!(orchestrator.run_cycle().await);
    assert_eq!(report.skipped, vec![PAYMENT]);
    assert_eq!(executor.calls(), 2);

    // Clearing the alert re-arms the request
    std::fs::remove_file(&alert).unwrap();
    assert_ok!(orchestrator.run_cycle().await);
    assert_eq!(executor.calls(), 4);
}

#[tokio::test]
async fn test_retry_succeeds_on_second_attempt() {
    let vault = TestVault::new().await;
    vault.add_payment(PAYMENT, 600).await;

    let agent = ScriptedAgent::new(vault.root(), Script::Complete);
    let executor = CountingExecutor::failing(1);
    let orchestrator = vault.orchestrator(agent, executor.clone()).await;
    assert_ok!(orchestrator.run_cycle().await);

    vault.drag(PAYMENT, ItemState::PendingApproval, ItemState::Approved);
    let report = assert_ok!(orchestrator.run_cycle().await);

    assert_eq!(report.executed, vec![PAYMENT]);
    assert_eq!(executor.calls(), 2);
    assert!(vault.path_of(ItemState::Done, PAYMENT).exists());
}

#[tokio::test]
async fn test_bypass_to_done_is_flagged_not_executed() {
    let vault = TestVault::new().await;
    vault.add_payment(PAYMENT, 600).await;

    let agent = ScriptedAgent::new(vault.root(), Script::Complete);
    let executor = CountingExecutor::succeeding();
    let orchestrator = vault.orchestrator(agent, executor.clone()).await;
    assert_ok!(orchestrator.run_cycle().await);

    vault.drag(PAYMENT, ItemState::PendingApproval, ItemState::Done);
    let report = assert_ok!(orchestrator.run_cycle().await);

    assert_eq!(report.reconciled.bypassed, vec![PAYMENT]);
    assert_eq!(executor.calls(), 0);
    assert!(vault.root().join("Alerts").join(format!("ALERT_{}.md", PAYMENT)).exists());

    let bypassed = orchestrator
        .audit_log()
        .find_entries(|e| e.action == AuditAction::ApprovalBypassed)
        .await
        .unwrap();
    assert_eq!(bypassed.len(), 1);

    // Recorded once, not every cycle
    let report = assert_ok!(orchestrator.run_cycle().await);
    assert!(report.reconciled.is_empty());
}

#[tokio::test]
async fn test_rejection_by_deleting_request() {
    let vault = TestVault::new().await;
    vault.add_payment(PAYMENT, 600).await;

    let agent = ScriptedAgent::new(vault.root(), Script::Complete);
    let executor = CountingExecutor::succeeding();
    let orchestrator = vault.orchestrator(agent, executor.clone()).await;
    assert_ok!(orchestrator.run_cycle().await);

    std::fs::remove_file(vault.path_of(ItemState::PendingApproval, PAYMENT)).unwrap();
    let report = assert_ok!(orchestrator.run_cycle().await);

    assert_eq!(report.reconciled.rejected, vec![PAYMENT]);
    assert_eq!(executor.calls(), 0);
}

#[tokio::test]
async fn test_agent_cannot_approve_its_own_request() {
    let vault = TestVault::new().await;
    vault.add_payment(PAYMENT, 600).await;

    let agent = ScriptedAgent::new(vault.root(), Script::MoveTo(ItemState::Approved));
    let executor = CountingExecutor::succeeding();
    let orchestrator = vault.orchestrator(agent, executor.clone()).await;

    let report = assert_ok!(orchestrator.run_cycle().await);
    assert!(report.executed.is_empty());
    assert_eq!(executor.calls(), 0);
    assert!(vault.path_of(ItemState::Quarantine, PAYMENT).exists());

    let denied = orchestrator
        .audit_log()
        .find_entries(|e| e.item_id == PAYMENT && e.action == AuditAction::AuthorizationDenied)
        .await
        .unwrap();
    assert_eq!(denied.len(), 1);
    assert_eq!(denied[0].actor, Actor::Agent);

    assert_ok!(orchestrator.run_cycle().await);
    assert_eq!(executor.calls(), 0);
}

#[tokio::test]
async fn test_executed_before_crash_is_not_repeated() {
    let vault = TestVault::new().await;
    vault.add_payment(PAYMENT, 600).await;

    let agent = ScriptedAgent::new(vault.root(), Script::Complete);
    let executor = CountingExecutor::succeeding();
    let orchestrator = vault.orchestrator(agent, executor.clone()).await;
    assert_ok!(orchestrator.run_cycle().await);
    assert_ok!(ApprovalGate::new(vault.store.clone(), orchestrator.audit_log().clone())
        .approve(PAYMENT)
        .await);

    // Action ran, then the process died before the move to Done
    let executed = LogEntry::new(
        PAYMENT,
        AuditAction::ActionExecuted,
        Outcome::Success,
        Actor::Orchestrator,
        "executed before restart",
    );
    assert_ok!(orchestrator.audit_log().append(&executed).await);

    let report = assert_ok!(orchestrator.run_cycle().await);
    assert_eq!(report.executed, vec![PAYMENT]);
    assert_eq!(executor.calls(), 0);
    assert!(vault.path_of(ItemState::Done, PAYMENT).exists());
}

#[tokio::test]
async fn test_agent_written_request_runs_after_human_approval() {
    let vault = TestVault::new().await;
    let email = ItemHeader::new("email", Utc::now(), Priority::High).with_field("from", "client@example.com");
    assert_ok!(
        vault
            .store
            .create(ItemState::NeedsAction, "EMAIL_invoice", email, "\nPlease pay invoice #1042.\n")
            .await
    );

    // While handling the email the agent drafts the payment request itself
    let agent = ScriptedAgent::new(vault.root(), Script::RequestApproval(PAYMENT));
    let executor = CountingExecutor::succeeding();
    let orchestrator = vault.orchestrator(agent, executor.clone()).await;

    let report = assert_ok!(orchestrator.run_cycle().await);
    assert_eq!(report.completed, vec!["EMAIL_invoice"]);
    assert_eq!(report.reconciled.registered, vec![PAYMENT]);
    assert!(vault.path_of(ItemState::PendingApproval, PAYMENT).exists());
    assert_eq!(executor.calls(), 0);

    vault.drag(PAYMENT, ItemState::PendingApproval, ItemState::Approved);
    let report = assert_ok!(orchestrator.run_cycle().await);

    assert_eq!(report.reconciled.approved, vec![PAYMENT]);
    assert_eq!(report.executed, vec![PAYMENT]);
    assert_eq!(executor.calls(), 1);
    assert!(vault.path_of(ItemState::Done, PAYMENT).exists());

    assert_ok!(orchestrator.run_cycle().await);
    assert_eq!(executor.calls(), 1);

    let log = orchestrator.audit_log();
    let history = log.history(PAYMENT).await.unwrap();
    let path: Vec<_> = history
        .iter()
        .filter(|e| e.resulting_state().is_some())
        .map(|e| (e.action, e.to, e.actor))
        .collect();
    assert_eq!(
        path,
        vec![
            (AuditAction::Created, Some(ItemState::PendingApproval), Actor::Agent),
            (AuditAction::Transition, Some(ItemState::Approved), Actor::Human),
            (AuditAction::Transition, Some(ItemState::Done), Actor::Orchestrator),
        ]
    );

    let states: Vec<_> = history.iter().filter_map(LogEntry::resulting_state).collect();
    assert!(is_legal_history(&states));
}

#[tokio::test]
async fn test_actionable_item_dragged_to_approved_is_not_executed() {
    let vault = TestVault::new().await;
    let agent = ScriptedAgent::new(vault.root(), Script::Stall);
    let executor = CountingExecutor::succeeding();
    let orchestrator = vault.orchestrator(agent, executor.clone()).await;

    // Known to the log in Needs_Action, then dragged past Pending_Approval
    vault.add_payment(PAYMENT, 600).await;
    assert_ok!(
        orchestrator
            .audit_log()
            .append(&LogEntry::created(PAYMENT, ItemState::NeedsAction, Actor::Watcher, "new item"))
            .await
    );
    vault.drag(PAYMENT, ItemState::NeedsAction, ItemState::Approved);

    let report = assert_ok!(orchestrator.run_cycle().await);
    assert_eq!(report.reconciled.denied, vec![PAYMENT]);
    assert!(report.executed.is_empty());
    assert_eq!(executor.calls(), 0);
    assert!(vault.path_of(ItemState::Quarantine, PAYMENT).exists());
    assert!(vault.root().join("Alerts").join(format!("ALERT_{}.md", PAYMENT)).exists());

    let denied = orchestrator
        .audit_log()
        .find_entries(|e| e.item_id == PAYMENT && e.action == AuditAction::AuthorizationDenied)
        .await
        .unwrap();
    assert_eq!(denied.len(), 1);
    assert_eq!(denied[0].from, Some(ItemState::NeedsAction));

    let report = assert_ok!(orchestrator.run_cycle().await);
    assert!(report.reconciled.is_empty());
    assert_eq!(executor.calls(), 0);
}

#[tokio::test]
async fn test_file_written_into_approved_is_not_executed() {
    let vault = TestVault::new().await;
    let header = ItemHeader::new("approval_request", Utc::now(), Priority::High)
        .with_field("action", "payment")
        .with_field("amount", 600);
    assert_ok!(vault.store.create(ItemState::Approved, "PAYMENT_forged", header, "").await);

    let agent = ScriptedAgent::new(vault.root(), Script::Complete);
    let executor = CountingExecutor::succeeding();
    let orchestrator = vault.orchestrator(agent, executor.clone()).await;

    let report = assert_ok!(orchestrator.run_cycle().await);
    assert_eq!(report.reconciled.denied, vec!["PAYMENT_forged"]);
    assert!(report.executed.is_empty());
    assert_eq!(executor.calls(), 0);
    assert!(vault.path_of(ItemState::Quarantine, "PAYMENT_forged").exists());
    assert!(!orchestrator.audit_log().has_executed("PAYMENT_forged").await.unwrap());
}
