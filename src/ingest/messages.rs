//! Mailbox and chat-transcript watcher.
//!
//! Reads `*.jsonl` exports from a directory, one message per line:
//!
//! ```json
//! {"id": "<msg-id>", "from": "client@example.com", "subject": "Invoice", "body": "...", "received_at": "2026-01-07T10:30:00Z"}
//! ```
//!
//! Each new message becomes an `EMAIL_<ts>_<hash>` or `CHAT_<ts>_<hash>` item,
//! where the hash is derived from the message id so re-exports never duplicate.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_yaml::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use super::{derive_id, ActionFileWriter, SourceItem, Watcher, WatcherError};
use crate::config::SourceKind;
use crate::domain::item::parse_timestamp;
use crate::domain::{Item, ItemState};

/// Which kind of export a message watcher reads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Email,
    Chat,
}

impl MessageKind {
    pub fn from_source(source: SourceKind) -> Option<Self> {
        match source {
            SourceKind::Email => Some(Self::Email),
            SourceKind::Chat => Some(Self::Chat),
            SourceKind::Filesystem => None,
        }
    }

    fn prefix(&self) -> &'static str {
        match self {
            Self::Email => "EMAIL",
            Self::Chat => "CHAT",
        }
    }

    fn item_type(&self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Chat => "chat_message",
        }
    }
}

/// One line of an export
#[derive(Debug, Clone, Deserialize)]
pub struct ExportedMessage {
    pub id: String,
    pub from: String,
    #[serde(default)]
    pub subject: Option<String>,
    pub body: String,
    #[serde(default)]
    pub received_at: Option<String>,
}

/// Watcher over a directory of JSONL message exports
pub struct MessageWatcher {
    dir: PathBuf,
    kind: MessageKind,
    writer: ActionFileWriter,

    /// Message ids already handed out
    seen: HashSet<String>,
}

impl MessageWatcher {
    pub fn new(dir: impl Into<PathBuf>, kind: MessageKind, writer: ActionFileWriter) -> Self {
        Self {
            dir: dir.into(),
            kind,
            writer,
            seen: HashSet::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Export files, oldest name first
    async fn export_files(&self) -> Result<Vec<PathBuf>, WatcherError> {
        let mut files = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|e| e == "jsonl") && entry.file_type().await?.is_file() {
                files.push(path);
            }
        }

        files.sort();
        Ok(files)
    }

    /// Whether any state folder holds an item for this message hash
    async fn is_known(&self, hash: &str) -> Result<bool, WatcherError> {
        let suffix = format!("_{}", hash);
        for state in ItemState::ALL {
            let ids = self.writer.store().list_ids(state).await?;
            if ids.iter().any(|id| id.ends_with(&suffix)) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn to_source_item(&self, message: ExportedMessage, hash: String, fallback: DateTime<Utc>) -> SourceItem {
        let received = message
            .received_at
            .as_deref()
            .and_then(parse_timestamp)
            .unwrap_or(fallback);
        let subject = message.subject.clone().unwrap_or_default();

        let mut fields = BTreeMap::from([
            ("from".to_string(), Value::from(message.from.clone())),
            ("message_id".to_string(), Value::from(message.id.clone())),
        ]);
        if !subject.is_empty() {
            fields.insert("subject".to_string(), Value::from(subject.clone()));
        }

        let body = match self.kind {
            MessageKind::Email => format!(
                "\n# Email: {subject}\n\n\
                 **From:** {from}\n\n\
                 **Received:** {at}\n\n\
                 ## Content\n\n{body}\n\n\
                 ## Suggested Actions\n\
                 - [ ] Draft a reply\n\
                 - [ ] Flag anything that needs approval\n",
                subject = if subject.is_empty() { "(no subject)" } else { subject.as_str() },
                from = message.from,
                at = received.format("%Y-%m-%d %H:%M:%S UTC"),
                body = message.body.trim(),
            ),
            MessageKind::Chat => format!(
                "\n# Message from {from}\n\n\
                 **Received:** {at}\n\n\
                 ## Content\n\n{body}\n\n\
                 ## Suggested Actions\n\
                 - [ ] Reply to sender\n",
                from = message.from,
                at = received.format("%Y-%m-%d %H:%M:%S UTC"),
                body = message.body.trim(),
            ),
        };

        SourceItem {
            key: message.id.clone(),
            id: derive_id(self.kind.prefix(), received, &hash),
            kind: self.kind.item_type().to_string(),
            created: received,
            body,
            keyword_text: format!("{} {}", subject, message.body),
            fields,
            payload: None,
        }
    }
}

/// First 12 hex chars of SHA-256 of the message id
pub fn message_hash(message_id: &str) -> String {
    let digest = Sha256::digest(message_id.as_bytes());
    hex::encode(&digest[..6])
}

#[async_trait]
impl Watcher for MessageWatcher {
    fn name(&self) -> &str {
        self.kind.item_type()
    }

    async fn check_for_updates(&mut self) -> Result<Vec<SourceItem>, WatcherError> {
        if !self.dir.is_dir() {
            return Err(WatcherError::SourceNotFound(self.dir.clone()));
        }

        let mut found = Vec::new();

        for path in self.export_files().await? {
            let text = tokio::fs::read_to_string(&path).await?;
            let modified: DateTime<Utc> = tokio::fs::metadata(&path).await?.modified()?.into();

            for (line_no, line) in text.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }

                let message: ExportedMessage = match serde_json::from_str(line) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!(file = %path.display(), line = line_no + 1, error = %e, "Skipping unparsable message");
                        continue;
                    }
                };

                if message.id.trim().is_empty() || !self.seen.insert(message.id.clone()) {
                    continue;
                }

                let hash = message_hash(&message.id);
                if self.is_known(&hash).await? {
                    debug!(message_id = %message.id, "Message already in vault");
                    continue;
                }

                found.push(self.to_source_item(message, hash, modified));
            }
        }

        Ok(found)
    }

    async fn create_action_file(&mut self, item: SourceItem) -> Result<Item, WatcherError> {
        let key = item.key.clone();
        self.writer.write(item).await.inspect_err(|_| {
            self.seen.remove(&key);
        })
    }
}
