//! Shared fixtures for the integration tests: a vault in a temp dir, a
//! scripted agent and a counting action executor.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use tempfile::TempDir;

use vaultflow::adapters::{ActionExecutor, ActionReport, Agent, AgentOutput, AgentTask};
use vaultflow::config::VaultConfig;
use vaultflow::core::{Authorization, ItemStore, Orchestrator, RetryPolicy};
use vaultflow::domain::item::render_document;
use vaultflow::domain::{ItemHeader, ItemState, Priority};

/// What the scripted agent does on every invocation
#[derive(Debug, Clone, Copy)]
pub enum Script {
    /// Print the completion sentinel
    Complete,

    /// Never finish
    Stall,

    /// Move the item out of Needs_Action itself
    MoveTo(ItemState),

    /// Complete, but take a while on the named item
    SlowOn(&'static str, Duration),

    /// Write a payment request straight into Pending_Approval, then complete
    RequestApproval(&'static str),
}

pub struct ScriptedAgent {
    root: PathBuf,
    script: Script,
    pub calls: AtomicU32,
    invoked: Mutex<Vec<String>>,
}

impl ScriptedAgent {
    pub fn new(root: &Path, script: Script) -> Arc<Self> {
        Arc::new(Self {
            root: root.to_path_buf(),
            script,
            calls: AtomicU32::new(0),
            invoked: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// How often the agent was handed a given item
    pub fn calls_for(&self, item_id: &str) -> usize {
        self.invoked
            .lock()
            .unwrap()
            .iter()
            .filter(|id| *id == item_id)
            .count()
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn invoke(&self, task: &AgentTask, _timeout: Duration) -> Result<AgentOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.invoked.lock().unwrap().push(task.item_id.clone());

        let completed = match self.script {
            Script::Complete => true,
            Script::SlowOn(id, delay) => {
                if task.item_id == id {
                    tokio::time::sleep(delay).await;
                }
                true
            }
            Script::RequestApproval(request_id) => {
                let header = ItemHeader::new("approval_request", Utc::now(), Priority::High)
                    .with_field("action", "payment")
                    .with_field("amount", 600)
                    .with_field("recipient", "Client A");
                let document = render_document(&header, "\n# Payment to Client A\n\nInvoice #1042, $600.\n")?;
                std::fs::write(
                    self.root
                        .join(ItemState::PendingApproval.folder())
                        .join(format!("{}.md", request_id)),
                    document,
                )?;
                true
            }
            Script::Stall => false,
            Script::MoveTo(state) => {
                let file = format!("{}.md", task.item_id);
                std::fs::rename(
                    self.root.join(ItemState::NeedsAction.folder()).join(&file),
                    self.root.join(state.folder()).join(&file),
                )?;
                true
            }
        };

        Ok(AgentOutput {
            stdout: if completed { "TASK_COMPLETE".to_string() } else { "working".to_string() },
            completed,
            duration: Duration::ZERO,
        })
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

/// Executor that fails its first `failures` calls
pub struct CountingExecutor {
    failures: u32,
    pub calls: AtomicU32,
    invoked: Mutex<Vec<String>>,
}

impl CountingExecutor {
    pub fn succeeding() -> Arc<Self> {
        Self::failing(0)
    }

    pub fn failing(failures: u32) -> Arc<Self> {
        Arc::new(Self {
            failures,
            calls: AtomicU32::new(0),
            invoked: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// How often the agent was handed a given item
    pub fn calls_for(&self, item_id: &str) -> usize {
        self.invoked
            .lock()
            .unwrap()
            .iter()
            .filter(|id| *id == item_id)
            .count()
    }
}

#[async_trait]
impl ActionExecutor for CountingExecutor {
    fn name(&self) -> &str {
        "counting"
    }

    async fn execute(&self, authorization: &Authorization, _timeout: Duration) -> Result<ActionReport> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            anyhow::bail!("payment gateway unavailable");
        }
        Ok(ActionReport {
            summary: format!("executed {}", authorization.item_id),
            duration: Duration::ZERO,
        })
    }
}

pub struct TestVault {
    pub dir: TempDir,
    pub store: ItemStore,
}

impl TestVault {
    pub async fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let store = ItemStore::open(dir.path()).await.unwrap();
        store.ensure_layout().await.unwrap();
        Self { dir, store }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn path_of(&self, state: ItemState, id: &str) -> PathBuf {
        self.store.item_path(state, id)
    }

    /// Move an item file the way a person would in a file manager
    pub fn drag(&self, id: &str, from: ItemState, to: ItemState) {
        std::fs::rename(self.path_of(from, id), self.path_of(to, id)).unwrap();
    }

    pub async fn orchestrator(
        &self,
        agent: Arc<ScriptedAgent>,
        executor: Arc<CountingExecutor>,
    ) -> Orchestrator {
        Orchestrator::open(self.root(), &VaultConfig::default(), agent)
            .await
            .unwrap()
            .with_executor(executor)
            .with_retry_policy(RetryPolicy::immediate())
    }

    /// The `$600 to Client A` payment item
    pub async fn add_payment(&self, id: &str, amount: u64) {
        let header = ItemHeader::new("email", Utc::now(), Priority::High)
            .with_field("action", "payment")
            .with_field("amount", amount)
            .with_field("recipient", "Client A");
        self.store
            .create(ItemState::NeedsAction, id, header, "\n# Invoice\n\nPlease pay the invoice.\n")
            .await
            .unwrap();
    }
}
