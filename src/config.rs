//! Configuration for a vault.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (VAULTFLOW_AGENT_COMMAND, VAULTFLOW_AGENT_TIMEOUT,
//!    VAULTFLOW_ORCHESTRATOR_INTERVAL, VAULTFLOW_WATCHER_INTERVAL)
//! 2. Config file (`<vault>/.vaultflow/config.yaml`)
//! 3. Defaults
//!
//! The config is loaded once per process start. The Handbook is policy, not
//! config, and is re-read every orchestrator cycle (see `core::handbook`).

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::core::limits::RetryPolicy;

pub mod paths;

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VaultConfig {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub watcher: WatcherSettings,
    #[serde(default)]
    pub orchestrator: OrchestratorSettings,
    #[serde(default)]
    pub agent: AgentSettings,
}

/// Which external source a watcher observes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Files dropped into Inbox/
    #[default]
    Filesystem,

    /// Mailbox export (JSONL, one message per line)
    Email,

    /// Chat transcript export (JSONL, one message per line)
    Chat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherSettings {
    /// Source observed by `vaultflow watch`
    #[serde(default)]
    pub source: SourceKind,

    /// Seconds between polls
    #[serde(default = "default_watcher_interval")]
    pub interval_seconds: u64,

    /// How long a dropped file's size must stay unchanged before it is picked up
    #[serde(default = "default_stability_delay")]
    pub stability_delay_secs: u64,

    /// Directory holding message exports (email/chat sources), relative to the vault
    #[serde(default)]
    pub messages_dir: Option<String>,

    /// File names skipped silently
    #[serde(default = "default_ignore_patterns")]
    pub ignore_patterns: Vec<String>,

    /// File names refused and audited (secrets must never enter the vault)
    #[serde(default = "default_denylist")]
    pub denylist_patterns: Vec<String>,
}

fn default_watcher_interval() -> u64 {
    5
}
fn default_stability_delay() -> u64 {
    2
}

fn default_ignore_patterns() -> Vec<String> {
    vec![
        ".*".to_string(),
        "*.tmp".to_string(),
        "*.part".to_string(),
        "*.crdownload".to_string(),
        "*.md".to_string(),
    ]
}

fn default_denylist() -> Vec<String> {
    vec![
        ".env*".to_string(),
        "secrets*".to_string(),
        "*credential*".to_string(),
        "*.pem".to_string(),
        "*.key".to_string(),
    ]
}

impl Default for WatcherSettings {
    fn default() -> Self {
        Self {
            source: SourceKind::default(),
            interval_seconds: default_watcher_interval(),
            stability_delay_secs: default_stability_delay(),
            messages_dir: None,
            ignore_patterns: default_ignore_patterns(),
            denylist_patterns: default_denylist(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorSettings {
    /// Seconds between cycles (default: 30)
    #[serde(default = "default_orchestrator_interval")]
    pub interval_seconds: u64,

    /// Agent invocations per item before giving up (default: 10)
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Wall-clock bound per item in seconds (default: 900 = 15 min)
    #[serde(default = "default_max_duration")]
    pub max_duration_seconds: u64,

    /// Delays between the first attempt and the single retry
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Keep Dashboard.md "Recent Activity" up to date
    #[serde(default = "default_true")]
    pub update_dashboard: bool,
}

fn default_orchestrator_interval() -> u64 {
    30
}
fn default_max_iterations() -> u32 {
    10
}
fn default_max_duration() -> u64 {
    900
}
fn default_true() -> bool {
    true
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            interval_seconds: default_orchestrator_interval(),
            max_iterations: default_max_iterations(),
            max_duration_seconds: default_max_duration(),
            retry: RetryPolicy::default(),
            update_dashboard: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSettings {
    /// Agent binary (default: "claude")
    #[serde(default = "default_agent_command")]
    pub command: String,

    /// Arguments placed before the task description
    #[serde(default = "default_agent_args")]
    pub args: Vec<String>,

    /// Per-invocation timeout in seconds (default: 600)
    #[serde(default = "default_agent_timeout")]
    pub timeout_seconds: u64,

    /// String the agent prints when it has finished a task
    #[serde(default = "default_sentinel")]
    pub completion_sentinel: String,
}

fn default_agent_command() -> String {
    "claude".to_string()
}
fn default_agent_args() -> Vec<String> {
    vec!["--print".to_string()]
}
fn default_agent_timeout() -> u64 {
    600
}
fn default_sentinel() -> String {
    "TASK_COMPLETE".to_string()
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            command: default_agent_command(),
            args: default_agent_args(),
            timeout_seconds: default_agent_timeout(),
            completion_sentinel: default_sentinel(),
        }
    }
}

impl VaultConfig {
    /// Load configuration for a vault: config file, then env overrides
    pub fn load(root: &Path) -> Result<Self> {
        let config_path = paths::config_file(root);

        let mut config = if config_path.exists() {
            load_config_file(&config_path)?
        } else {
            Self::default()
        };

        config.apply_env()?;
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env(&mut self) -> Result<()> {
        if let Ok(command) = std::env::var("VAULTFLOW_AGENT_COMMAND") {
            self.agent.command = command;
        }
        if let Ok(timeout) = std::env::var("VAULTFLOW_AGENT_TIMEOUT") {
            self.agent.timeout_seconds = timeout
                .parse()
                .with_context(|| format!("Invalid VAULTFLOW_AGENT_TIMEOUT: {}", timeout))?;
        }
        if let Ok(interval) = std::env::var("VAULTFLOW_ORCHESTRATOR_INTERVAL") {
            self.orchestrator.interval_seconds = interval
                .parse()
                .with_context(|| format!("Invalid VAULTFLOW_ORCHESTRATOR_INTERVAL: {}", interval))?;
        }
        if let Ok(interval) = std::env::var("VAULTFLOW_WATCHER_INTERVAL") {
            self.watcher.interval_seconds = interval
                .parse()
                .with_context(|| format!("Invalid VAULTFLOW_WATCHER_INTERVAL: {}", interval))?;
        }
        Ok(())
    }

    /// Resolve the message export directory against the vault root
    pub fn messages_dir(&self, root: &Path) -> PathBuf {
        match &self.watcher.messages_dir {
            Some(dir) => resolve_path(root, dir),
            None => paths::messages_dir(root, self.watcher.source),
        }
    }
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<VaultConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the vault root
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}
