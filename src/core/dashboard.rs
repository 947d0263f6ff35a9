//! `Dashboard.md` maintenance.
//!
//! The orchestrator prepends one line per action under `## Recent Activity`,
//! keeping the newest [`MAX_RECENT`] entries. A vault without a dashboard is
//! left alone.

use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tokio::fs;

use crate::config::paths;

use super::atomic;

const SECTION: &str = "## Recent Activity";

/// Entries kept under Recent Activity
pub const MAX_RECENT: usize = 20;

#[derive(Debug, Clone)]
pub struct Dashboard {
    path: PathBuf,
}

impl Dashboard {
    pub fn new(root: &Path) -> Self {
        Self {
            path: paths::dashboard(root),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Prepend an activity line. Returns `false` if there is no dashboard.
    pub async fn record(&self, at: DateTime<Utc>, message: &str) -> io::Result<bool> {
        let text = match fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e),
        };

        let line = format!("- `{}` {}", at.format("%Y-%m-%d %H:%M UTC"), message.trim());
        let updated = prepend_activity(&text, &line);

        let path = self.path.clone();
        tokio::task::spawn_blocking(move || atomic::atomic_write(&path, updated.as_bytes()))
            .await
            .map_err(io::Error::other)??;

        Ok(true)
    }

    /// The dashboard written by `vaultflow init`
    pub fn default_document() -> String {
        format!(
            "# AI Employee Dashboard\n\n\
             Items move through Needs_Action, Pending_Approval, Approved and Done.\n\
             Move a request from Pending_Approval to Approved to authorize it.\n\n\
             {SECTION}\n\n"
        )
    }
}

/// Insert `line` as the first entry of the Recent Activity section, creating
/// the section at the end if missing, and drop entries past `MAX_RECENT`.
fn prepend_activity(text: &str, line: &str) -> String {
    let lines: Vec<&str> = text.lines().collect();

    let Some(heading) = lines.iter().position(|l| l.trim() == SECTION) else {
        let mut out = text.trim_end().to_string();
        if !out.is_empty() {
            out.push_str("\n\n");
        }
        out.push_str(&format!("{}\n\n{}\n", SECTION, line));
        return out;
    };

    // Section runs until the next heading of the same or higher level
    let end = lines[heading + 1..]
        .iter()
        .position(|l| l.starts_with("# ") || l.starts_with("## "))
        .map(|i| heading + 1 + i)
        .unwrap_or(lines.len());

    let mut entries: Vec<&str> = vec![line];
    entries.extend(
        lines[heading + 1..end]
            .iter()
            .filter(|l| l.trim_start().starts_with("- "))
            .copied(),
    );
    entries.truncate(MAX_RECENT);

    let mut out: Vec<&str> = lines[..=heading].to_vec();
    out.push("");
    out.extend(entries);
    if end < lines.len() {
        out.push("");
        out.extend(&lines[end..]);
    }

    let mut rendered = out.join("\n");
    rendered.push('\n');
    rendered
}
