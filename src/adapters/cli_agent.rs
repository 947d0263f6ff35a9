//! Reasoning agent run as a CLI subprocess.
//!
//! Spawns `<command> <args...> <prompt>` with the vault root as working
//! directory, collecting stdout. Completion is signalled by the agent printing
//! the configured sentinel.

use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use super::{Agent, AgentOutput, AgentTask};
use crate::config::AgentSettings;

/// Agent adapter using subprocess mode
pub struct CliAgent {
    /// Agent binary (default: "claude")
    command: String,

    /// Arguments placed before the prompt
    args: Vec<String>,

    /// Completion marker expected in stdout
    sentinel: String,
}

impl CliAgent {
    pub fn new(command: impl Into<String>, args: Vec<String>, sentinel: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args,
            sentinel: sentinel.into(),
        }
    }

    pub fn from_settings(settings: &AgentSettings) -> Self {
        Self::new(
            settings.command.clone(),
            settings.args.clone(),
            settings.completion_sentinel.clone(),
        )
    }

    pub fn sentinel(&self) -> &str {
        &self.sentinel
    }
}

#[async_trait]
impl Agent for CliAgent {
    fn name(&self) -> &str {
        &self.command
    }

    async fn invoke(&self, task: &AgentTask, invoke_timeout: Duration) -> Result<AgentOutput> {
        let started = Instant::now();

        let child = Command::new(&self.command)
            .args(&self.args)
            .arg(&task.prompt)
            .current_dir(&task.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn agent '{}' for {}", self.command, task.item_id))?;

        // On timeout the child is dropped, which kills it
        let output = timeout(invoke_timeout, child.wait_with_output())
            .await
            .with_context(|| {
                format!(
                    "Agent '{}' timed out after {:?} on {}",
                    self.command, invoke_timeout, task.item_id
                )
            })?
            .with_context(|| format!("Failed to wait for agent '{}'", self.command))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let exit_code = output.status.code().unwrap_or(-1);
            anyhow::bail!(
                "Agent '{}' failed with exit code {}: {}",
                self.command,
                exit_code,
                stderr.trim()
            );
        }

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let completed = stdout.contains(&self.sentinel);
        debug!(item_id = %task.item_id, completed, bytes = stdout.len(), "Agent returned");

        Ok(AgentOutput {
            stdout,
            completed,
            duration: started.elapsed(),
        })
    }

    async fn health_check(&self) -> Result<()> {
        let output = Command::new(&self.command)
            .arg("--version")
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("Agent '{}' is not installed or not on PATH", self.command))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("Agent '{}' health check failed: {}", self.command, stderr.trim());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn task(dir: &TempDir) -> AgentTask {
        AgentTask {
            item_id: "FILE_x".to_string(),
            prompt: "process it".to_string(),
            working_dir: dir.path().to_path_buf(),
        }
    }

    #[test]
    fn test_from_settings() {
        let agent = CliAgent::from_settings(&AgentSettings::default());
        assert_eq!(agent.name(), "claude");
        assert_eq!(agent.sentinel(), "TASK_COMPLETE");
    }

    #[tokio::test]
    async fn test_missing_binary() {
        let temp = TempDir::new().unwrap();
        let agent = CliAgent::new("vaultflow-no-such-agent", vec![], "DONE");

        assert!(agent.health_check().await.is_err());
        assert!(agent.invoke(&task(&temp), Duration::from_secs(5)).await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_sentinel_detected() {
        let temp = TempDir::new().unwrap();
        // `echo <args...> <prompt>`
        let agent = CliAgent::new("echo", vec!["TASK_COMPLETE".to_string()], "TASK_COMPLETE");

        let output = agent.invoke(&task(&temp), Duration::from_secs(5)).await.unwrap();
        assert!(output.completed);
        assert!(output.stdout.contains("process it"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_no_sentinel() {
        let temp = TempDir::new().unwrap();
        let agent = CliAgent::new("echo", vec![], "TASK_COMPLETE");

        let output = agent.invoke(&task(&temp), Duration::from_secs(5)).await.unwrap();
        assert!(!output.completed);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout() {
        let temp = TempDir::new().unwrap();
        let agent = CliAgent::new("sleep", vec![], "TASK_COMPLETE");
        let task = AgentTask {
            prompt: "5".to_string(),
            ..task(&temp)
        };

        let result = agent.invoke(&task, Duration::from_millis(100)).await;
        assert!(result.unwrap_err().to_string().contains("timed out"));
    }
}
