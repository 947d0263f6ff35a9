//! Adapter interfaces for external systems.
//!
//! The reasoning agent is an external CLI; adapters give the orchestrator a
//! uniform way to invoke it and to execute approved actions through it.

pub mod cli_agent;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;

use crate::core::approval::Authorization;

pub use cli_agent::CliAgent;

/// A unit of work handed to the agent
#[derive(Debug, Clone)]
pub struct AgentTask {
    /// Item the task is about
    pub item_id: String,

    /// Instructions passed to the agent
    pub prompt: String,

    /// Directory the agent runs in (the vault root)
    pub working_dir: PathBuf,
}

/// Output from an agent invocation
#[derive(Debug, Clone)]
pub struct AgentOutput {
    /// Captured standard output
    pub stdout: String,

    /// Whether the agent signalled completion
    pub completed: bool,

    /// Wall-clock time of the invocation
    pub duration: Duration,
}

/// Trait for reasoning agents
#[async_trait]
pub trait Agent: Send + Sync {
    /// Human-readable agent name
    fn name(&self) -> &str;

    /// Run the agent on a task, bounded by `timeout`
    async fn invoke(&self, task: &AgentTask, timeout: Duration) -> Result<AgentOutput>;

    /// Check the agent is installed and runnable
    async fn health_check(&self) -> Result<()>;
}

/// Result of a successfully executed action
#[derive(Debug, Clone)]
pub struct ActionReport {
    pub summary: String,
    pub duration: Duration,
}

/// Executes an approved, sensitive action
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    fn name(&self) -> &str;

    /// Perform exactly the action described by the authorization
    async fn execute(&self, authorization: &Authorization, timeout: Duration) -> Result<ActionReport>;
}

/// Executes approved actions by handing them back to the agent
pub struct AgentActionExecutor {
    agent: Arc<dyn Agent>,
    working_dir: PathBuf,
}

impl AgentActionExecutor {
    pub fn new(agent: Arc<dyn Agent>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            agent,
            working_dir: working_dir.into(),
        }
    }

    fn prompt(authorization: &Authorization) -> String {
        let action = authorization
            .header
            .action()
            .unwrap_or_else(|| authorization.header.kind.clone());

        format!(
            "A human has approved the request in {path}.\n\
             Execute exactly the `{action}` action it describes, nothing more.\n\
             Do not move or edit the request file.\n\
             When the action has been carried out, print the completion sentinel.",
            path = authorization.path.display(),
            action = action,
        )
    }
}

#[async_trait]
impl ActionExecutor for AgentActionExecutor {
    fn name(&self) -> &str {
        self.agent.name()
    }

    async fn execute(&self, authorization: &Authorization, timeout: Duration) -> Result<ActionReport> {
        let started = Instant::now();
        let task = AgentTask {
            item_id: authorization.item_id.clone(),
            prompt: Self::prompt(authorization),
            working_dir: self.working_dir.clone(),
        };

        let output = self.agent.invoke(&task, timeout).await?;
        if !output.completed {
            anyhow::bail!("Agent '{}' did not confirm the action", self.agent.name());
        }

        Ok(ActionReport {
            summary: format!("executed via {}", self.agent.name()),
            duration: started.elapsed(),
        })
    }
}
