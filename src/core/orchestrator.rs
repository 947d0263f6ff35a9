//! Main orchestrator for the vault.
//!
//! Each cycle:
//! 1. reconciles human moves in the approval folders
//! 2. executes actions a human has approved (retried exactly once)
//! 3. hands actionable items to the agent in a bounded persistence loop
//!
//! Per-item failures are logged and never stop the cycle.

use std::cmp::Reverse;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, error, info, instrument, warn};

use crate::adapters::{ActionExecutor, Agent, AgentActionExecutor, AgentTask};
use crate::config::{paths, VaultConfig};
use crate::domain::{Actor, AuditAction, Item, ItemState, LogEntry, Outcome};

use super::alerts::Alerts;
use super::approval::{ApprovalGate, GateError, ReconcileReport};
use super::audit_log::AuditLog;
use super::claims::ClaimRegistry;
use super::dashboard::Dashboard;
use super::handbook::Handbook;
use super::item_store::{ItemStore, StoreError};
use super::limits::{PersistenceLimits, PersistenceTracker, RetryPolicy};
use super::shutdown::ShutdownSignal;

/// What one cycle did
#[derive(Debug, Default, Clone)]
pub struct CycleReport {
    pub reconciled: ReconcileReport,

    /// Approved actions executed and moved to Done
    pub executed: Vec<String>,

    /// Approved actions that failed twice
    pub failed: Vec<String>,

    /// Items the agent completed, moved to Done
    pub completed: Vec<String>,

    /// Items turned into approval requests
    pub requested: Vec<String>,

    /// Items that ran out of iterations or time
    pub incomplete: Vec<String>,

    pub quarantined: Vec<String>,

    /// Items left alone (claimed elsewhere, alert open, limited mode)
    pub skipped: Vec<String>,
}

impl CycleReport {
    pub fn is_idle(&self) -> bool {
        self.reconciled.is_empty()
            && self.executed.is_empty()
            && self.failed.is_empty()
            && self.completed.is_empty()
            && self.requested.is_empty()
            && self.incomplete.is_empty()
            && self.quarantined.is_empty()
    }
}

/// How a single item's persistence loop ended
enum ItemOutcome {
    Completed,
    Requested,
    MovedByAgent,
    Incomplete,
}

/// Main vault orchestrator
pub struct Orchestrator {
    root: PathBuf,
    store: ItemStore,
    log: AuditLog,
    gate: ApprovalGate,
    claims: ClaimRegistry,
    alerts: Alerts,
    dashboard: Option<Dashboard>,
    agent: Arc<dyn Agent>,
    executor: Arc<dyn ActionExecutor>,
    limits: PersistenceLimits,
    retry: RetryPolicy,
    agent_timeout: Duration,
    sentinel: String,
    limited: bool,
}

impl Orchestrator {
    /// Open a vault for orchestration. Fails if the root does not exist.
    pub async fn open(root: &Path, config: &VaultConfig, agent: Arc<dyn Agent>) -> Result<Self> {
        let store = ItemStore::open(root)
            .await
            .with_context(|| format!("Failed to open vault at {}", root.display()))?;
        let log = AuditLog::open(root).await?;
        let claims = ClaimRegistry::new(root).context("Failed to create claims directory")?;

        let dashboard = config
            .orchestrator
            .update_dashboard
            .then(|| Dashboard::new(root));

        Ok(Self {
            root: root.to_path_buf(),
            gate: ApprovalGate::new(store.clone(), log.clone()),
            alerts: Alerts::new(root),
            executor: Arc::new(AgentActionExecutor::new(agent.clone(), root)),
            store,
            log,
            claims,
            dashboard,
            agent,
            limits: PersistenceLimits::from(&config.orchestrator),
            retry: config.orchestrator.retry.clone(),
            agent_timeout: Duration::from_secs(config.agent.timeout_seconds),
            sentinel: config.agent.completion_sentinel.clone(),
            limited: false,
        })
    }

    /// Use a different executor for approved actions
    pub fn with_executor(mut self, executor: Arc<dyn ActionExecutor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_limits(mut self, limits: PersistenceLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Check the agent is runnable; if not, switch to limited mode
    pub async fn check_agent(&mut self) -> bool {
        match self.agent.health_check().await {
            Ok(()) => {
                self.limited = false;
                true
            }
            Err(e) => {
                warn!(agent = self.agent.name(), error = %e, "Agent unavailable, running in limited mode");
                self.limited = true;
                false
            }
        }
    }

    /// In limited mode items are reported but nothing is invoked
    pub fn is_limited(&self) -> bool {
        self.limited
    }

    pub fn store(&self) -> &ItemStore {
        &self.store
    }

    pub fn audit_log(&self) -> &AuditLog {
        &self.log
    }

    /// Run cycles until shutdown
    pub async fn run(&self, interval: Duration, mut shutdown: ShutdownSignal) -> Result<()> {
        info!(root = %self.root.display(), interval_secs = interval.as_secs(), limited = self.limited, "Orchestrator started");

        while !shutdown.is_triggered() {
            match self.run_cycle().await {
                Ok(report) if !report.is_idle() => info!(
                    executed = report.executed.len(),
                    completed = report.completed.len(),
                    requested = report.requested.len(),
                    failed = report.failed.len(),
                    incomplete = report.incomplete.len(),
                    quarantined = report.quarantined.len(),
                    "Cycle finished"
                ),
                Ok(_) => debug!("Cycle idle"),
                // Transient: the next tick retries
                Err(e) => error!(error = %format!("{:#}", e), "Cycle failed"),
            }

            if shutdown.sleep(interval).await {
                break;
            }
        }

        info!("Orchestrator stopped");
        Ok(())
    }

    /// One pass over the vault
    #[instrument(skip(self), fields(root = %self.root.display()))]
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let handbook = match Handbook::load(&self.root).await {
            Ok(handbook) => handbook,
            Err(e) => {
                warn!(error = %e, "Handbook unreadable, using built-in policy");
                Handbook::default()
            }
        };

        let mut report = CycleReport {
            reconciled: self.gate.reconcile().await?,
            ..Default::default()
        };
        self.execute_approved(&mut report).await?;
        self.process_needs_action(&handbook, &mut report).await?;

        // Register requests the agent wrote during this cycle
        let late = self.gate.reconcile().await?;
        report.reconciled.merge(late);

        for id in &report.reconciled.bypassed {
            self.note(&format!("`{}` moved to Done without approval (not executed)", id))
                .await;
        }
        for id in &report.reconciled.denied {
            self.note(&format!("`{}` appeared in Approved without a request, quarantined", id))
                .await;
        }

        Ok(report)
    }

    // ---- Approved actions ----

    async fn execute_approved(&self, report: &mut CycleReport) -> Result<()> {
        for id in self.store.list_ids(ItemState::Approved).await? {
            if self.alerts.is_active(&id).await {
                debug!(item_id = %id, "Alert open, not retrying");
                report.skipped.push(id);
                continue;
            }
            if self.limited {
                info!(item_id = %id, "Limited mode: approved action waiting");
                report.skipped.push(id);
                continue;
            }

            let Some(_claim) = self.claims.try_claim(&id)? else {
                report.skipped.push(id);
                continue;
            };
            if !self.store.exists(ItemState::Approved, &id).await {
                debug!(item_id = %id, "Handled elsewhere");
                continue;
            }

            if let Err(e) = self.execute_one(&id, report).await {
                error!(item_id = %id, error = %format!("{:#}", e), "Approved action not processed");
            }
        }
        Ok(())
    }

    #[instrument(skip(self, report))]
    async fn execute_one(&self, id: &str, report: &mut CycleReport) -> Result<()> {
        // Executed before a crash but never moved: finish the move only
        if self.log.has_executed(id).await? {
            info!("Action already executed, completing move");
            self.move_logged(id, ItemState::Approved, ItemState::Done, Actor::Orchestrator)
                .await?;
            report.executed.push(id.to_string());
            return Ok(());
        }

        let mut attempt = 0u32;

        loop {
            attempt += 1;

            // Authorization is checked immediately before every attempt
            let authorization = match self.gate.authorize(id).await {
                Ok(authorization) => authorization,
                Err(GateError::NotApproved(_)) => return Ok(()),
                Err(GateError::Store(e)) if e.is_malformed() => {
                    self.quarantine(id, ItemState::Approved, &e, report).await?;
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };

            let started = Instant::now();
            let result = self.executor.execute(&authorization, self.agent_timeout).await;
            let duration_ms = started.elapsed().as_millis() as u64;

            match result {
                Ok(action) => {
                    let entry = LogEntry::new(
                        id,
                        AuditAction::ActionExecuted,
                        Outcome::Success,
                        Actor::Orchestrator,
                        format!("{} (attempt {})", action.summary, attempt),
                    )
                    .with_duration(duration_ms);
                    self.log.append(&entry).await?;
                    info!(attempt, duration_ms, "Approved action executed");

                    self.finish_executed(id).await?;
                    self.note(&format!("Executed approved action `{}`", id)).await;
                    report.executed.push(id.to_string());
                    return Ok(());
                }
                Err(e) if self.retry.should_retry(attempt) => {
                    let delay = self.retry.delay();
                    let entry = LogEntry::new(
                        id,
                        AuditAction::ActionFailed,
                        Outcome::Retried,
                        Actor::Orchestrator,
                        format!("attempt {} failed, retrying in {:?}", attempt, delay),
                    )
                    .with_duration(duration_ms)
                    .with_error(e.to_string());
                    self.log.append(&entry).await?;

                    warn!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "Action failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    let entry = LogEntry::new(
                        id,
                        AuditAction::ActionFailed,
                        Outcome::Failure,
                        Actor::Orchestrator,
                        format!("failed after {} attempts", attempt),
                    )
                    .with_duration(duration_ms)
                    .with_error(e.to_string());
                    self.log.append(&entry).await?;
                    error!(attempt, error = %e, "Action failed permanently");

                    self.raise_alert(
                        id,
                        "Approved action failed",
                        &format!(
                            "The approved action failed {} times. Last error:\n\n```\n{}\n```\n\n\
                             The request is still in Approved.",
                            attempt, e
                        ),
                    )
                    .await?;
                    self.note(&format!("Approved action `{}` failed, see Alerts/", id)).await;
                    report.failed.push(id.to_string());
                    return Ok(());
                }
            }
        }
    }

    /// Move an executed request to Done, unless the agent already did
    async fn finish_executed(&self, id: &str) -> Result<()> {
        match self.store.locate(id).await {
            Some(ItemState::Approved) => {
                self.move_logged(id, ItemState::Approved, ItemState::Done, Actor::Orchestrator)
                    .await
            }
            Some(ItemState::Done) => {
                self.log
                    .append(&LogEntry::transition(id, ItemState::Approved, ItemState::Done, Actor::Agent))
                    .await
            }
            other => {
                warn!(item_id = id, location = ?other, "Executed request is no longer in Approved");
                Ok(())
            }
        }
    }

    // ---- Actionable items ----

    async fn process_needs_action(&self, handbook: &Handbook, report: &mut CycleReport) -> Result<()> {
        let mut items = Vec::new();

        for id in self.store.list_ids(ItemState::NeedsAction).await? {
            match self.store.read(ItemState::NeedsAction, &id).await {
                Ok(item) => items.push(item),
                Err(e) if e.is_malformed() => {
                    if let Err(qe) = self.quarantine(&id, ItemState::NeedsAction, &e, report).await {
                        error!(item_id = %id, error = %qe, "Failed to quarantine");
                    }
                }
                // Moved away since listing
                Err(StoreError::NotFound { .. }) => {}
                Err(e) => error!(item_id = %id, error = %e, "Failed to read item"),
            }
        }

        items.sort_by(|a, b| {
            (Reverse(a.header.priority), a.header.created, &a.id)
                .cmp(&(Reverse(b.header.priority), b.header.created, &b.id))
        });

        for item in items {
            if self.limited {
                info!(item_id = %item.id, priority = %item.header.priority, "Limited mode: item waiting");
                report.skipped.push(item.id);
                continue;
            }
            if self.alerts.is_active(&item.id).await {
                report.skipped.push(item.id);
                continue;
            }

            let Some(_claim) = self.claims.try_claim(&item.id)? else {
                debug!(item_id = %item.id, "Claimed elsewhere");
                report.skipped.push(item.id);
                continue;
            };

            // The listing may be stale: another orchestrator can finish an
            // item and release its claim before we get here
            let id = item.id;
            let item = match self.store.read(ItemState::NeedsAction, &id).await {
                Ok(item) => item,
                Err(StoreError::NotFound { .. }) => {
                    debug!(item_id = %id, "Handled elsewhere");
                    continue;
                }
                Err(e) => {
                    error!(item_id = %id, error = %e, "Failed to re-read claimed item");
                    continue;
                }
            };

            if let Err(e) = self.process_item(item, handbook, report).await {
                error!(item_id = %id, error = %format!("{:#}", e), "Item not processed");
            }
        }

        Ok(())
    }

    #[instrument(skip_all, fields(item_id = %item.id, priority = %item.header.priority))]
    async fn process_item(
        &self,
        item: Item,
        handbook: &Handbook,
        report: &mut CycleReport,
    ) -> Result<()> {
        let id = item.id.clone();

        // Items written by hand never passed through a watcher
        if self.log.history(&id).await?.is_empty() {
            self.log
                .append(&LogEntry::created(&id, ItemState::NeedsAction, Actor::Orchestrator, "registered"))
                .await?;
        }

        let approval = handbook.approval_required(&item.header);
        self.log
            .append(&LogEntry::new(
                &id,
                AuditAction::Claimed,
                Outcome::Success,
                Actor::Orchestrator,
                match &approval {
                    Some(reason) => format!("claimed; needs approval: {}", reason),
                    None => "claimed".to_string(),
                },
            ))
            .await?;

        let outcome = self.persistence_loop(&item, approval.as_deref()).await?;

        match outcome {
            ItemOutcome::Completed => {
                info!("Item done");
                self.note(&format!("Processed `{}`", id)).await;
                report.completed.push(id);
            }
            ItemOutcome::Requested => {
                self.note(&format!("`{}` is waiting for approval", id)).await;
                report.requested.push(id);
            }
            ItemOutcome::MovedByAgent => report.completed.push(id),
            ItemOutcome::Incomplete => report.incomplete.push(id),
        }

        Ok(())
    }

    /// Invoke the agent until it signals completion, moves the item, or a bound is hit
    async fn persistence_loop(&self, item: &Item, approval: Option<&str>) -> Result<ItemOutcome> {
        let mut tracker = PersistenceTracker::new();

        loop {
            if let Err(limit) = self.limits.check(&tracker) {
                warn!(%limit, "Persistence bound reached");
                self.log
                    .append(&LogEntry::new(
                        &item.id,
                        AuditAction::Incomplete,
                        Outcome::Incomplete,
                        Actor::Orchestrator,
                        limit.to_string(),
                    ))
                    .await?;
                return Ok(ItemOutcome::Incomplete);
            }

            tracker.record_iteration();
            let iteration = tracker.iterations;
            let task = AgentTask {
                item_id: item.id.clone(),
                prompt: self.task_prompt(item, approval, iteration),
                working_dir: self.root.clone(),
            };
            let timeout = self.agent_timeout.min(self.limits.remaining(&tracker));

            let started = Instant::now();
            let result = self.agent.invoke(&task, timeout).await;
            let duration_ms = started.elapsed().as_millis() as u64;

            let completed = match &result {
                Ok(output) => {
                    let outcome = if output.completed { Outcome::Success } else { Outcome::Incomplete };
                    self.log
                        .append(
                            &LogEntry::new(
                                &item.id,
                                AuditAction::AgentInvoked,
                                outcome,
                                Actor::Orchestrator,
                                format!("{} iteration {}", self.agent.name(), iteration),
                            )
                            .with_duration(duration_ms),
                        )
                        .await?;
                    output.completed
                }
                Err(e) => {
                    warn!(iteration, error = %e, "Agent invocation failed");
                    self.log
                        .append(
                            &LogEntry::new(
                                &item.id,
                                AuditAction::AgentInvoked,
                                Outcome::Failure,
                                Actor::Orchestrator,
                                format!("{} iteration {}", self.agent.name(), iteration),
                            )
                            .with_duration(duration_ms)
                            .with_error(format!("{:#}", e)),
                        )
                        .await?;
                    false
                }
            };

            // Leaving Needs_Action counts as completion
            let location = self.store.locate(&item.id).await;
            if location != Some(ItemState::NeedsAction) {
                self.record_agent_move(&item.id, location).await?;
                return Ok(ItemOutcome::MovedByAgent);
            }

            if completed {
                return self.complete(&item.id, approval).await;
            }
        }
    }

    /// The agent said it is done and the item is still in Needs_Action
    async fn complete(&self, id: &str, approval: Option<&str>) -> Result<ItemOutcome> {
        match approval {
            Some(reason) => {
                // Re-read: the agent may have filled in the request details
                let item = self.store.read(ItemState::NeedsAction, id).await?;
                self.gate.request(&item, reason).await?;
                Ok(ItemOutcome::Requested)
            }
            None => {
                self.move_logged(id, ItemState::NeedsAction, ItemState::Done, Actor::Orchestrator)
                    .await?;
                Ok(ItemOutcome::Completed)
            }
        }
    }

    /// Log where the agent put an item, flagging moves it was not allowed to make
    async fn record_agent_move(&self, id: &str, location: Option<ItemState>) -> Result<()> {
        let from = ItemState::NeedsAction;

        match location {
            Some(to) if from.can_transition_to(to) => {
                info!(item_id = id, %to, "Agent moved item");
                self.log
                    .append(&LogEntry::transition(id, from, to, Actor::Agent))
                    .await?;
                self.note(&format!("Agent moved `{}` to {}", id, to.folder())).await;
            }
            Some(ItemState::Approved) => {
                // Only a human may approve
                error!(item_id = id, "Agent moved item into Approved");
                let entry = LogEntry::new(
                    id,
                    AuditAction::AuthorizationDenied,
                    Outcome::Rejected,
                    Actor::Agent,
                    "agent moved item from Needs_Action into Approved",
                )
                .with_states(Some(from), Some(ItemState::Approved));
                self.log.append(&entry).await?;

                let error = StoreError::IllegalTransition {
                    id: id.to_string(),
                    from,
                    to: ItemState::Approved,
                };
                let mut report = CycleReport::default();
                self.quarantine(id, ItemState::Approved, &error, &mut report).await?;
                self.raise_alert(
                    id,
                    "Agent approved its own request",
                    "The agent moved this item into Approved. Only a human may approve; \
                     the item was moved to Quarantine and nothing was executed.",
                )
                .await?;
            }
            other => {
                let summary = match other {
                    Some(to) => format!("agent moved item to {} (not allowed)", to),
                    None => "item disappeared from the vault during processing".to_string(),
                };
                error!(item_id = id, %summary, "Illegal move by agent");
                let entry = LogEntry::new(id, AuditAction::Transition, Outcome::Failure, Actor::Agent, &summary)
                    .with_states(Some(from), other);
                self.log.append(&entry).await?;
                self.raise_alert(id, "Item moved illegally", &summary).await?;
            }
        }

        Ok(())
    }

    fn task_prompt(&self, item: &Item, approval: Option<&str>, iteration: u32) -> String {
        let item_path = Path::new(ItemState::NeedsAction.folder()).join(item.file_name());

        let approval_line = match approval {
            Some(reason) => format!(
                "This item needs human approval ({}). Do NOT carry out the action. \
                 Write the full request details (action, amount, recipient) into the item's header and body \
                 and leave the file where it is.",
                reason
            ),
            None => "No approval is needed for this item.".to_string(),
        };

        format!(
            "Process the item {item} (type: {kind}, priority: {priority}).\n\
             Follow the rules in {handbook}.\n\
             {approval_line}\n\
             Write any multi-step plan to {plans}/.\n\
             When the item is fully handled, print {sentinel}.\n\
             (iteration {iteration} of {max})",
            item = item_path.display(),
            kind = item.header.kind,
            priority = item.header.priority,
            handbook = paths::HANDBOOK_FILE,
            plans = paths::PLANS_DIR,
            sentinel = self.sentinel,
            max = self.limits.max_iterations,
        )
    }

    // ---- Shared helpers ----

    async fn move_logged(&self, id: &str, from: ItemState, to: ItemState, actor: Actor) -> Result<()> {
        self.store.transition(id, from, to).await?;
        self.log.append(&LogEntry::transition(id, from, to, actor)).await
    }

    async fn quarantine(
        &self,
        id: &str,
        from: ItemState,
        error: &StoreError,
        report: &mut CycleReport,
    ) -> Result<()> {
        warn!(item_id = id, %from, %error, "Quarantining item");
        self.store.transition(id, from, ItemState::Quarantine).await?;

        let entry = LogEntry::new(
            id,
            AuditAction::Quarantined,
            Outcome::Failure,
            Actor::Orchestrator,
            format!("moved from {} to Quarantine", from),
        )
        .with_states(Some(from), Some(ItemState::Quarantine))
        .with_error(error.to_string());
        self.log.append(&entry).await?;

        self.note(&format!("Quarantined `{}`", id)).await;
        report.quarantined.push(id.to_string());
        Ok(())
    }

    async fn raise_alert(&self, id: &str, title: &str, detail: &str) -> Result<()> {
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

    /// Dashboard activity is best effort
    async fn note(&self, message: &str) {
        if let Some(dashboard) = &self.dashboard {
            if let Err(e) = dashboard.record(Utc::now(), message).await {
                warn!(error = %e, "Failed to update dashboard");
            }
        }
    }
}
