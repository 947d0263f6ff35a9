//! Append-only audit log with file-based persistence.
//!
//! Entries are stored as newline-delimited JSON in one file per UTC day
//! (`Logs/YYYY-MM-DD.jsonl`). Appends take an exclusive file lock so the watcher
//! and the orchestrator can write concurrently without interleaving lines.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use fs2::FileExt;
use tokio::fs::{self, File};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;

use crate::config::paths;
use crate::domain::{AuditAction, ItemState, LogEntry, Outcome};

/// File-based audit log using daily JSONL files
#[derive(Debug, Clone)]
pub struct AuditLog {
    logs_dir: PathBuf,
}

impl AuditLog {
    /// Open the audit log of a vault
    pub async fn open(root: &Path) -> Result<Self> {
        let logs_dir = paths::logs_dir(root);

        fs::create_dir_all(&logs_dir)
            .await
            .with_context(|| format!("Failed to create logs directory: {}", logs_dir.display()))?;

        Ok(Self { logs_dir })
    }

    pub fn logs_dir(&self) -> &Path {
        &self.logs_dir
    }

    /// Path of the log file for a given day
    pub fn day_path(&self, day: NaiveDate) -> PathBuf {
        self.logs_dir.join(format!("{}.jsonl", day.format("%Y-%m-%d")))
    }

    /// Append an entry to the log for the entry's day
    pub async fn append(&self, entry: &LogEntry) -> Result<()> {
        let path = self.day_path(entry.timestamp.date_naive());
        let json = serde_json::to_string(entry).context("Failed to serialize log entry")?;

        tokio::task::spawn_blocking(move || append_line(&path, &json))
            .await
            .context("Audit append task panicked")?
    }

    /// Day files present in the log, oldest first
    pub async fn days(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();

        if !self.logs_dir.exists() {
            return Ok(files);
        }

        let mut entries = fs::read_dir(&self.logs_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_day = path
                .file_stem()
                .and_then(|s| s.to_str())
                .is_some_and(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok());

            if is_day && path.extension().is_some_and(|e| e == "jsonl") {
                files.push(path);
            }
        }

        // ISO dates sort chronologically
        files.sort();
        Ok(files)
    }

    /// Replay all entries in order
    pub async fn replay(&self) -> Result<Vec<LogEntry>> {
        let mut entries = Vec::new();
        for path in self.days().await? {
            read_day(&path, &mut entries).await?;
        }
        Ok(entries)
    }

    /// Every entry that mentions an item, in order
    pub async fn history(&self, item_id: &str) -> Result<Vec<LogEntry>> {
        self.find_entries(|e| e.item_id == item_id).await
    }

    /// Find entries matching a predicate
    pub async fn find_entries<F>(&self, predicate: F) -> Result<Vec<LogEntry>>
    where
        F: Fn(&LogEntry) -> bool,
    {
        let entries = self.replay().await?;
        Ok(entries.into_iter().filter(predicate).collect())
    }

    /// Last state the log places each item in. A rejection with no
    /// destination means the item left the vault.
    pub async fn last_known_states(&self) -> Result<HashMap<String, ItemState>> {
        let mut states = HashMap::new();
        for entry in self.replay().await? {
            if let Some(state) = entry.resulting_state() {
                states.insert(entry.item_id, state);
            } else if entry.action == AuditAction::Rejected {
                states.remove(&entry.item_id);
            }
        }
        Ok(states)
    }

    /// Whether an approved action already ran (idempotency check)
    pub async fn has_executed(&self, item_id: &str) -> Result<bool> {
        let entries = self.replay().await?;

        Ok(entries.iter().any(|e| {
            e.item_id == item_id
                && e.action == AuditAction::ActionExecuted
                && e.outcome == Outcome::Success
        }))
    }

    /// Number of failed attempts recorded for an action
    pub async fn failed_attempts(&self, item_id: &str) -> Result<usize> {
        let entries = self.replay().await?;

        Ok(entries
            .iter()
            .filter(|e| e.item_id == item_id && e.action == AuditAction::ActionFailed)
            .count())
    }

    /// Most recent entries, newest last
    pub async fn tail(&self, limit: usize) -> Result<Vec<LogEntry>> {
        let entries = self.replay().await?;
        let skip = entries.len().saturating_sub(limit);
        Ok(entries.into_iter().skip(skip).collect())
    }
}

/// Append one JSON line under an exclusive lock
fn append_line(path: &Path, json: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open log file: {}", path.display()))?;

    file.lock_exclusive()
        .with_context(|| format!("Failed to lock log file: {}", path.display()))?;

    writeln!(file, "{}", json).context("Failed to write log entry")?;
    file.flush().context("Failed to flush log entry")?;
    file.sync_data().context("Failed to sync log entry")?;

    // Lock is released when file is dropped
    Ok(())
}

async fn read_day(path: &Path, entries: &mut Vec<LogEntry>) -> Result<()> {
    let file = File::open(path)
        .await
        .with_context(|| format!("Failed to open log file: {}", path.display()))?;

    let mut lines = BufReader::new(file).lines();
    let mut line_no = 0usize;

    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<LogEntry>(&line) {
            Ok(entry) => entries.push(entry),
            // A crash mid-append can leave a torn last line
            Err(e) => warn!(file = %path.display(), line = line_no, error = %e, "Skipping unreadable log line"),
        }
    }

    Ok(())
}
