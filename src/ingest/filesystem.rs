//! Drop-folder watcher.
//!
//! Watches `Inbox/` for files a human drops in. A file is picked up once its
//! size has been stable for `stability_delay_secs`, then copied next to a new
//! `FILE_<mtime>_<name>.md` item in `Needs_Action`. The original stays in Inbox.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use glob::Pattern;
use notify::{RecommendedWatcher, RecursiveMode};
use notify_debouncer_mini::{new_debouncer, DebounceEventResult, Debouncer};
use serde_yaml::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{derive_id, ActionFileWriter, SourceItem, Watcher, WatcherError};
use crate::config::WatcherSettings;
use crate::core::shutdown::ShutdownSignal;
use crate::domain::{Actor, AuditAction, Item, ItemState, LogEntry, Outcome};

/// Inbox watcher with stability checking
pub struct FilesystemWatcher {
    inbox: PathBuf,
    writer: ActionFileWriter,
    ignore: Vec<Pattern>,
    denylist: Vec<Pattern>,
    stability_delay: Duration,

    /// Files being stabilized (path -> (size, first seen at that size))
    pending: HashMap<PathBuf, (u64, Instant)>,

    /// Source keys already handed out
    seen: HashSet<String>,

    /// Denylisted names already audited
    rejected: HashSet<String>,

    /// Inbox change notifications, when enabled
    events: Option<mpsc::UnboundedReceiver<DebounceEventResult>>,
    _debouncer: Option<Debouncer<RecommendedWatcher>>,
}

impl FilesystemWatcher {
    pub fn new(root: &Path, settings: &WatcherSettings, writer: ActionFileWriter) -> Result<Self, WatcherError> {
        Ok(Self {
            inbox: root.join(ItemState::Inbox.folder()),
            writer,
            ignore: compile(&settings.ignore_patterns)?,
            denylist: compile(&settings.denylist_patterns)?,
            stability_delay: Duration::from_secs(settings.stability_delay_secs),
            pending: HashMap::new(),
            seen: HashSet::new(),
            rejected: HashSet::new(),
            events: None,
            _debouncer: None,
        })
    }

    pub fn inbox(&self) -> &Path {
        &self.inbox
    }

    /// Wake the polling loop as soon as something changes in Inbox
    pub fn enable_notifications(&mut self) -> Result<(), WatcherError> {
        if !self.inbox.is_dir() {
            return Err(WatcherError::SourceNotFound(self.inbox.clone()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let mut debouncer = new_debouncer(Duration::from_millis(500), move |result: DebounceEventResult| {
            let _ = tx.send(result);
        })?;
        debouncer
            .watcher()
            .watch(&self.inbox, RecursiveMode::NonRecursive)?;

        info!(inbox = %self.inbox.display(), "Watching Inbox for changes");
        self.events = Some(rx);
        self._debouncer = Some(debouncer);
        Ok(())
    }

    fn classify(&self, name: &str) -> Classification {
        if self.denylist.iter().any(|p| p.matches(name)) {
            Classification::Denied
        } else if self.ignore.iter().any(|p| p.matches(name)) {
            Classification::Ignored
        } else {
            Classification::Candidate
        }
    }

    /// Whether a file's size has held still long enough
    fn is_stable(&mut self, path: &Path, size: u64) -> bool {
        match self.pending.get(path) {
            Some((last_size, since)) if *last_size == size => since.elapsed() >= self.stability_delay,
            _ => {
                self.pending.insert(path.to_path_buf(), (size, Instant::now()));
                self.stability_delay.is_zero()
            }
        }
    }

    async fn reject(&mut self, name: &str, modified: DateTime<Utc>) -> Result<(), WatcherError> {
        if !self.rejected.insert(name.to_string()) {
            return Ok(());
        }

        warn!(file = name, "Refusing denylisted file");
        let entry = LogEntry::new(
            derive_id("FILE", modified, name),
            AuditAction::SourceRejected,
            Outcome::Rejected,
            Actor::Watcher,
            "file name matches the denylist; not copied into the vault",
        );
        self.writer.audit_log().append(&entry).await?;
        Ok(())
    }
}

enum Classification {
    Candidate,
    Ignored,
    Denied,
}

fn compile(patterns: &[String]) -> Result<Vec<Pattern>, WatcherError> {
    patterns
        .iter()
        .map(|p| Pattern::new(p).map_err(WatcherError::from))
        .collect()
}

#[async_trait]
impl Watcher for FilesystemWatcher {
    fn name(&self) -> &str {
        "filesystem"
    }

    async fn check_for_updates(&mut self) -> Result<Vec<SourceItem>, WatcherError> {
        if !self.inbox.is_dir() {
            return Err(WatcherError::SourceNotFound(self.inbox.clone()));
        }

        let mut found = Vec::new();
        let mut present = HashSet::new();
        let mut entries = tokio::fs::read_dir(&self.inbox).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };

            // Vanished between listing and stat: not an error
            let Ok(metadata) = tokio::fs::metadata(&path).await else {
                continue;
            };
            if !metadata.is_file() {
                continue;
            }
            let modified: DateTime<Utc> = metadata.modified()?.into();

            match self.classify(&name) {
                Classification::Ignored => continue,
                Classification::Denied => {
                    self.reject(&name, modified).await?;
                    continue;
                }
                Classification::Candidate => {}
            }

            present.insert(path.clone());
            let size = metadata.len();
            let key = format!(
                "{}|{}|{}",
                path.display(),
                modified.timestamp_nanos_opt().unwrap_or_default(),
                size
            );
            if self.seen.contains(&key) {
                continue;
            }

            if size == 0 || !self.is_stable(&path, size) {
                debug!(file = %name, size, "Waiting for file to settle");
                continue;
            }
            self.pending.remove(&path);

            let id = derive_id("FILE", modified, &name);
            self.seen.insert(key.clone());
            if self.writer.is_known(&id).await {
                continue;
            }

            found.push(SourceItem {
                key,
                id,
                kind: "file_drop".to_string(),
                created: modified,
                body: drop_body(&name, size, Utc::now()),
                keyword_text: name.clone(),
                fields: BTreeMap::from([
                    ("original_name".to_string(), Value::from(name.clone())),
                    ("size".to_string(), Value::from(size)),
                    ("source_path".to_string(), Value::from(path.display().to_string())),
                ]),
                payload: Some(path),
            });
        }

        // Forget files that were removed while settling
        self.pending.retain(|path, _| present.contains(path));

        Ok(found)
    }

    async fn create_action_file(&mut self, item: SourceItem) -> Result<Item, WatcherError> {
        let key = item.key.clone();
        self.writer.write(item).await.inspect_err(|_| {
            // Retry on a later tick
            self.seen.remove(&key);
        })
    }

    async fn wait(&mut self, interval: Duration, shutdown: &mut ShutdownSignal) -> bool {
        let Some(events) = self.events.as_mut() else {
            return shutdown.sleep(interval).await;
        };

        tokio::select! {
            stop = shutdown.sleep(interval) => stop,
            Some(result) = events.recv() => {
                if let Err(e) = result {
                    warn!(error = ?e, "Inbox notification error");
                }
                while events.try_recv().is_ok() {}
                shutdown.is_triggered()
            }
        }
    }
}

fn drop_body(name: &str, size: u64, dropped_at: DateTime<Utc>) -> String {
    format!(
        "\n# File Drop for Processing\n\n\
         **Original File:** `{name}`\n\n\
         **Size:** {size} bytes\n\n\
         **Dropped At:** {at}\n\n\
         ## Suggested Actions\n\
         - [ ] Review file content\n\
         - [ ] Determine required action\n\
         - [ ] Execute action or create plan\n\
         - [ ] Move to /Done when complete\n",
        at = dropped_at.format("%Y-%m-%d %H:%M:%S UTC"),
    )
}
