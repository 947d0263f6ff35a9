//! Human-visible alerts in `Alerts/`.
//!
//! An alert is a Markdown file `Alerts/ALERT_<id>.md`. While it exists the
//! orchestrator leaves the item alone; deleting it re-arms processing.

use std::io;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::warn;

use crate::config::paths;
use crate::domain::item::render_document;
use crate::domain::{ItemHeader, Priority};

use super::atomic;

#[derive(Debug, Clone)]
pub struct Alerts {
    dir: PathBuf,
}

impl Alerts {
    pub fn new(root: &Path) -> Self {
        Self {
            dir: paths::alerts_dir(root),
        }
    }

    pub fn path(&self, item_id: &str) -> PathBuf {
        self.dir.join(format!("ALERT_{}.md", item_id))
    }

    /// Whether an unresolved alert exists for an item
    pub async fn is_active(&self, item_id: &str) -> bool {
        tokio::fs::metadata(self.path(item_id)).await.is_ok()
    }

    /// Write an alert. Returns `false` if one is already open for the item.
    pub async fn raise(&self, item_id: &str, title: &str, detail: &str) -> io::Result<bool> {
        let path = self.path(item_id);

        let header = ItemHeader::new("alert", Utc::now(), Priority::High)
            .with_field("item_id", item_id)
            .with_field("title", title);
        let body = format!(
            "\n# {}\n\n{}\n\nDelete this file once the problem is resolved to let `{}` be processed again.\n",
            title, detail, item_id
        );
        let document = render_document(&header, &body)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let target = path.clone();
        let created = tokio::task::spawn_blocking(move || atomic::atomic_create(&target, document.as_bytes()))
            .await
            .map_err(io::Error::other)?;

        match created {
            Ok(()) => {
                warn!(item_id, path = %path.display(), title, "Alert raised");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e),
        }
    }
}
