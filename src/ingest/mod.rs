//! Watchers: turn external events into actionable items.
//!
//! ```text
//! Inbox/ drop ──┐
//! mail export ──┼─→ Watcher ─→ Needs_Action/<id>.md
//! chat export ──┘       ↓
//!                 Logs/<day>.jsonl
//! ```
//!
//! A [`Watcher`] observes one source. [`runner::run`] polls it until shutdown;
//! each tick is fault-isolated so a bad source never stops the loop.

pub mod filesystem;
pub mod messages;
pub mod runner;

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{info, warn};

use crate::core::handbook::Handbook;
use crate::core::item_store::{ItemStore, StoreError};
use crate::core::shutdown::ShutdownSignal;
use crate::core::AuditLog;
use crate::domain::{Actor, Item, ItemHeader, ItemState, LogEntry};

pub use filesystem::FilesystemWatcher;
pub use messages::MessageWatcher;

/// Errors that can occur with a watcher
#[derive(Debug, Error)]
pub enum WatcherError {
    #[error("Source does not exist: {0}")]
    SourceNotFound(PathBuf),

    #[error("Notify error: {0}")]
    Notify(#[from] notify::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid file pattern: {0}")]
    Pattern(#[from] glob::PatternError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Audit(#[from] anyhow::Error),
}

impl WatcherError {
    /// Structural errors recur every tick until a human fixes the source
    pub fn is_structural(&self) -> bool {
        matches!(self, Self::SourceNotFound(_) | Self::Pattern(_))
    }
}

/// An external item observed by a watcher, not yet in the vault
#[derive(Debug, Clone)]
pub struct SourceItem {
    /// Stable dedupe key (path + mtime + size, or message id)
    pub key: String,

    /// Deterministic item id derived from the source
    pub id: String,

    /// Header `type`
    pub kind: String,

    /// When the source produced it
    pub created: DateTime<Utc>,

    /// Markdown body of the action file
    pub body: String,

    /// Text the Handbook's keywords are matched against
    pub keyword_text: String,

    /// Extra header fields
    pub fields: BTreeMap<String, serde_yaml::Value>,

    /// File copied next to the item as its payload
    pub payload: Option<PathBuf>,
}

/// A source of new items
#[async_trait]
pub trait Watcher: Send {
    /// Human-readable watcher name
    fn name(&self) -> &str;

    /// New external items since the last check. Never returns an item that is
    /// already in the vault.
    async fn check_for_updates(&mut self) -> Result<Vec<SourceItem>, WatcherError>;

    /// Materialise an item in `Needs_Action`
    async fn create_action_file(&mut self, item: SourceItem) -> Result<Item, WatcherError>;

    /// Wait for the next tick. Returns `true` on shutdown.
    async fn wait(&mut self, interval: Duration, shutdown: &mut ShutdownSignal) -> bool {
        shutdown.sleep(interval).await
    }
}

/// Writes source items into the vault; shared by all watchers
#[derive(Debug, Clone)]
pub struct ActionFileWriter {
    root: PathBuf,
    store: ItemStore,
    log: AuditLog,
}

impl ActionFileWriter {
    pub fn new(root: &Path, store: ItemStore, log: AuditLog) -> Self {
        Self {
            root: root.to_path_buf(),
            store,
            log,
        }
    }

    pub fn store(&self) -> &ItemStore {
        &self.store
    }

    pub fn audit_log(&self) -> &AuditLog {
        &self.log
    }

    /// Whether an item id is already present in any state
    pub async fn is_known(&self, id: &str) -> bool {
        self.store.locate(id).await.is_some()
    }

    /// Write the payload (if any), then the item, then the audit entry
    pub async fn write(&self, source: SourceItem) -> Result<Item, WatcherError> {
        let handbook = match Handbook::load(&self.root).await {
            Ok(handbook) => handbook,
            Err(e) => {
                warn!(error = %e, "Handbook unreadable, using built-in policy");
                Handbook::default()
            }
        };

        let mut header = ItemHeader::new(
            source.kind.clone(),
            source.created,
            handbook.priority_for(&source.keyword_text),
        );
        header.tags = handbook.tags_for(&source.keyword_text);
        header.extra = source.fields;

        // Payload first: an item never appears without it
        if let Some(payload) = &source.payload {
            match self
                .store
                .attach_payload(ItemState::NeedsAction, &source.id, payload)
                .await
            {
                Ok(_) | Err(StoreError::AlreadyExists(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        let item = self
            .store
            .create(ItemState::NeedsAction, &source.id, header, &source.body)
            .await?;

        let entry = LogEntry::created(
            &item.id,
            ItemState::NeedsAction,
            Actor::Watcher,
            format!("{} observed", source.kind),
        );
        self.log.append(&entry).await?;

        info!(item_id = %item.id, priority = %item.header.priority, "Action file created");
        Ok(item)
    }
}

/// `<PREFIX>_<YYYYMMDD_HHMMSS>_<suffix>`
pub fn derive_id(prefix: &str, at: DateTime<Utc>, suffix: &str) -> String {
    format!(
        "{}_{}_{}",
        prefix,
        at.format("%Y%m%d_%H%M%S"),
        crate::domain::item::sanitize_id(suffix)
    )
}
