//! Command-line interface for vaultflow.
//!
//! Provides commands for initialising a vault, running a watcher or the
//! orchestrator, approving requests, and inspecting state and the audit log.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::warn;

use crate::adapters::{Agent, CliAgent};
use crate::config::{paths, SourceKind, VaultConfig};
use crate::core::atomic;
use crate::core::{shutdown, ApprovalGate, AuditLog, Dashboard, Handbook, ItemStore, Orchestrator};
use crate::domain::ItemState;
use crate::ingest::messages::MessageKind;
use crate::ingest::{runner, ActionFileWriter, FilesystemWatcher, MessageWatcher, Watcher};

/// vaultflow - Watcher, orchestrator and approval gate for an AI employee vault
#[derive(Parser, Debug)]
#[command(name = "vaultflow")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create the vault folders, Handbook and Dashboard
    Init {
        /// Vault root (created if missing)
        root: PathBuf,
    },

    /// Watch a source and write new items to Needs_Action
    Watch {
        /// Vault root
        root: PathBuf,

        /// Source to observe (defaults to the configured one)
        #[arg(short, long, value_enum)]
        source: Option<SourceKind>,

        /// Seconds between polls
        #[arg(short, long)]
        interval: Option<u64>,
    },

    /// Process Needs_Action and execute approved actions
    Orchestrate {
        /// Vault root
        root: PathBuf,

        /// Run a single cycle and exit
        #[arg(long)]
        once: bool,

        /// Seconds between cycles
        #[arg(short, long)]
        interval: Option<u64>,
    },

    /// Show how many items are in each state
    Status {
        /// Vault root
        root: PathBuf,
    },

    /// Approve a pending request (same as moving it to Approved by hand)
    Approve {
        /// Vault root
        root: PathBuf,

        /// Item ID
        item_id: String,
    },

    /// Show audit log entries
    Log {
        /// Vault root
        root: PathBuf,

        /// Only entries for this item
        #[arg(long)]
        item: Option<String>,

        /// Maximum number of entries to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Check the vault layout, Handbook and agent
    Verify {
        /// Vault root
        root: PathBuf,
    },

    /// Show resolved configuration (debug)
    Config {
        /// Vault root
        root: PathBuf,
    },
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Init { root } => init_vault(&root).await,
            Commands::Watch {
                root,
                source,
                interval,
            } => watch(&root, source, interval).await,
            Commands::Orchestrate {
                root,
                once,
                interval,
            } => orchestrate(&root, once, interval).await,
            Commands::Status { root } => show_status(&root).await,
            Commands::Approve { root, item_id } => approve(&root, &item_id).await,
            Commands::Log { root, item, limit } => show_log(&root, item.as_deref(), limit).await,
            Commands::Verify { root } => verify(&root).await,
            Commands::Config { root } => show_config(&root),
        }
    }
}

/// Create folders and seed documents; never overwrites existing files
async fn init_vault(root: &Path) -> Result<()> {
    tokio::fs::create_dir_all(root)
        .await
        .with_context(|| format!("Failed to create vault root: {}", root.display()))?;

    let store = ItemStore::open(root).await?;
    store.ensure_layout().await?;

    let handbook = Handbook::default_document()?;
    let seeds = [
        (paths::handbook(root), handbook),
        (paths::dashboard(root), Dashboard::default_document()),
    ];

    for (path, content) in seeds {
        if path.exists() {
            println!("  kept     {}", path.display());
            continue;
        }
        let target = path.clone();
        tokio::task::spawn_blocking(move || atomic::atomic_create(&target, content.as_bytes()))
            .await?
            .with_context(|| format!("Failed to write {}", path.display()))?;
        println!("  created  {}", path.display());
    }

    println!("Vault ready at {}", root.display());
    Ok(())
}

/// Run a watcher until Ctrl+C
async fn watch(root: &Path, source: Option<SourceKind>, interval: Option<u64>) -> Result<()> {
    let mut config = VaultConfig::load(root)?;
    if let Some(source) = source {
        config.watcher.source = source;
    }
    let interval = Duration::from_secs(interval.unwrap_or(config.watcher.interval_seconds));

    let store = ItemStore::open(root)
        .await
        .with_context(|| format!("Vault not found: {}", root.display()))?;
    let log = AuditLog::open(root).await?;
    let writer = ActionFileWriter::new(root, store, log);

    let mut watcher: Box<dyn Watcher> = match MessageKind::from_source(config.watcher.source) {
        None => {
            let mut watcher = FilesystemWatcher::new(root, &config.watcher, writer)?;
            if let Err(e) = watcher.enable_notifications() {
                warn!(error = %e, "File notifications unavailable, polling only");
            }
            Box::new(watcher)
        }
        Some(kind) => Box::new(MessageWatcher::new(config.messages_dir(root), kind, writer)),
    };

    let (trigger, signal) = shutdown::channel();
    trigger.trigger_on_ctrl_c();

    runner::run(watcher.as_mut(), interval, signal).await;
    Ok(())
}

/// Run the orchestrator once, or until Ctrl+C
async fn orchestrate(root: &Path, once: bool, interval: Option<u64>) -> Result<()> {
    let config = VaultConfig::load(root)?;
    let interval = Duration::from_secs(interval.unwrap_or(config.orchestrator.interval_seconds));

    let agent: Arc<dyn Agent> = Arc::new(CliAgent::from_settings(&config.agent));
    let mut orchestrator = Orchestrator::open(root, &config, agent).await?;
    orchestrator.check_agent().await;

    if once {
        let report = orchestrator.run_cycle().await?;
        println!("Executed:     {}", report.executed.len());
        println!("Completed:    {}", report.completed.len());
        println!("Requested:    {}", report.requested.len());
        println!("Failed:       {}", report.failed.len());
        println!("Incomplete:   {}", report.incomplete.len());
        println!("Quarantined:  {}", report.quarantined.len());
        println!("Skipped:      {}", report.skipped.len());
        if !report.reconciled.bypassed.is_empty() {
            eprintln!(
                "\n[Approval bypassed for: {}]",
                report.reconciled.bypassed.join(", ")
            );
        }
        if !report.reconciled.denied.is_empty() {
            eprintln!(
                "\n[Approved without a request, quarantined: {}]",
                report.reconciled.denied.join(", ")
            );
        }
        return Ok(());
    }

    let (trigger, signal) = shutdown::channel();
    trigger.trigger_on_ctrl_c();
    orchestrator.run(interval, signal).await
}

/// Print item counts per state
async fn show_status(root: &Path) -> Result<()> {
    let store = ItemStore::open(root)
        .await
        .with_context(|| format!("Vault not found: {}", root.display()))?;
    let counts = store.counts().await?;

    println!("{:<20} {:>6}", "STATE", "ITEMS");
    println!("{}", "-".repeat(27));
    for state in ItemState::ALL {
        println!(
            "{:<20} {:>6}",
            state.folder(),
            counts.get(&state).copied().unwrap_or(0)
        );
    }

    let alerts = std::fs::read_dir(paths::alerts_dir(root))
        .map(|entries| entries.filter_map(|e| e.ok()).count())
        .unwrap_or(0);
    if alerts > 0 {
        println!("\n{} open alert(s) in {}/", alerts, paths::ALERTS_DIR);
    }

    Ok(())
}

async fn approve(root: &Path, item_id: &str) -> Result<()> {
    let store = ItemStore::open(root)
        .await
        .with_context(|| format!("Vault not found: {}", root.display()))?;
    let log = AuditLog::open(root).await?;

    ApprovalGate::new(store, log)
        .approve(item_id)
        .await
        .with_context(|| format!("Failed to approve {}", item_id))?;

    println!("Approved {}", item_id);
    Ok(())
}

/// Print audit log entries, oldest first
async fn show_log(root: &Path, item: Option<&str>, limit: usize) -> Result<()> {
    let log = AuditLog::open(root).await?;
    let mut entries = match item {
        Some(id) => log.history(id).await?,
        None => log.tail(limit).await?,
    };
    if entries.len() > limit {
        entries.drain(..entries.len() - limit);
    }

    if entries.is_empty() {
        println!("No log entries found");
        return Ok(());
    }

    println!(
        "{:<20} {:<22} {:<11} {:<13} {:<40} {}",
        "TIME", "ACTION", "OUTCOME", "ACTOR", "ITEM", "SUMMARY"
    );
    println!("{}", "-".repeat(130));

    for entry in entries {
        let states = match (entry.from, entry.to) {
            (Some(from), Some(to)) => format!(" [{} -> {}]", from, to),
            (None, Some(to)) => format!(" [-> {}]", to),
            _ => String::new(),
        };
        println!(
            "{:<20} {:<22} {:<11} {:<13} {:<40} {}{}",
            entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
            format!("{:?}", entry.action),
            format!("{:?}", entry.outcome),
            format!("{:?}", entry.actor),
            entry.item_id,
            entry.summary,
            states
        );
        if let Some(error) = entry.error {
            println!("{:<20} error: {}", "", error);
        }
    }

    Ok(())
}

/// Check everything a working vault needs; fails if anything is missing
async fn verify(root: &Path) -> Result<()> {
    let mut checks: Vec<(String, bool)> = Vec::new();

    checks.push(("vault root exists".to_string(), root.is_dir()));
    for state in ItemState::ALL {
        let dir = root.join(state.folder());
        checks.push((format!("folder {}/", state.folder()), dir.is_dir()));
    }
    for dir in paths::AUXILIARY_DIRS {
        checks.push((format!("folder {}/", dir), root.join(dir).is_dir()));
    }

    checks.push(("Dashboard.md present".to_string(), paths::dashboard(root).is_file()));
    let handbook_ok = paths::handbook(root).is_file() && Handbook::load(root).await.is_ok();
    checks.push(("Company_Handbook.md parses".to_string(), handbook_ok));

    let config = VaultConfig::load(root);
    checks.push(("config loads".to_string(), config.is_ok()));

    if let Ok(config) = &config {
        let agent = CliAgent::from_settings(&config.agent);
        let healthy = agent.health_check().await.is_ok();
        checks.push((format!("agent `{}` responds", config.agent.command), healthy));
    }

    let mut failed = 0;
    for (name, ok) in &checks {
        println!("  [{}] {}", if *ok { "PASS" } else { "FAIL" }, name);
        if !ok {
            failed += 1;
        }
    }

    if failed > 0 {
        anyhow::bail!("{} of {} checks failed", failed, checks.len());
    }

    println!("\nAll {} checks passed", checks.len());
    Ok(())
}

/// Show resolved configuration
fn show_config(root: &Path) -> Result<()> {
    let config = VaultConfig::load(root)?;
    println!("Config file: {}", paths::config_file(root).display());
    println!();
    print!("{}", serde_yaml::to_string(&config)?);
    Ok(())
}
