//! Directory-backed item store.
//!
//! Each [`ItemState`] is a folder under the vault root and an item is the file
//! `<state>/<id>.md`. A companion payload (e.g. the dropped attachment) lives
//! next to it as `<state>/<id>`. The store only ever creates items and moves
//! them; it never rewrites or deletes an item in place.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::fs;
use tracing::debug;

use crate::config::paths;
use crate::domain::item::{id_from_file_name, item_file_name, render_document};
use crate::domain::{Item, ItemHeader, ItemParseError, ItemState};

use super::atomic;

/// Errors that can occur with the item store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Vault root does not exist or is not a directory: {0}")]
    RootNotFound(PathBuf),

    #[error("Item {id} not found in {state}")]
    NotFound { id: String, state: ItemState },

    #[error("Item already exists: {0}")]
    AlreadyExists(PathBuf),

    #[error("Illegal transition for {id}: {from} -> {to}")]
    IllegalTransition {
        id: String,
        from: ItemState,
        to: ItemState,
    },

    #[error("Malformed item {id}: {source}")]
    Malformed {
        id: String,
        #[source]
        source: ItemParseError,
    },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_yaml::Error),

    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl StoreError {
    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::Malformed { .. })
    }
}

/// The vault's item store
#[derive(Debug, Clone)]
pub struct ItemStore {
    root: PathBuf,
}

impl ItemStore {
    /// Create a store handle without touching the filesystem
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Open an existing vault and make sure every folder exists
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        match fs::metadata(&root).await {
            Ok(meta) if meta.is_dir() => {}
            _ => return Err(StoreError::RootNotFound(root)),
        }

        let store = Self::new(root);
        store.ensure_layout().await?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Folder backing a state
    pub fn state_dir(&self, state: ItemState) -> PathBuf {
        self.root.join(state.folder())
    }

    /// Path of an item file in a state
    pub fn item_path(&self, state: ItemState, id: &str) -> PathBuf {
        self.state_dir(state).join(item_file_name(id))
    }

    /// Path of an item's companion payload in a state
    pub fn payload_path(&self, state: ItemState, id: &str) -> PathBuf {
        self.state_dir(state).join(id)
    }

    /// Create every state folder plus the auxiliary folders
    pub async fn ensure_layout(&self) -> Result<(), StoreError> {
        for state in ItemState::ALL {
            fs::create_dir_all(self.state_dir(state)).await?;
        }
        for dir in paths::AUXILIARY_DIRS {
            fs::create_dir_all(self.root.join(dir)).await?;
        }
        fs::create_dir_all(paths::claims_dir(&self.root)).await?;
        Ok(())
    }

    /// Ids of all items in a state, sorted
    pub async fn list_ids(&self, state: ItemState) -> Result<Vec<String>, StoreError> {
        let dir = self.state_dir(state);
        let mut ids = Vec::new();

        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(ids),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            if let Some(id) = entry.file_name().to_str().and_then(id_from_file_name) {
                ids.push(id.to_string());
            }
        }

        ids.sort();
        Ok(ids)
    }

    /// Whether an item is present in a state right now
    pub async fn exists(&self, state: ItemState, id: &str) -> bool {
        fs::metadata(self.item_path(state, id))
            .await
            .map(|m| m.is_file())
            .unwrap_or(false)
    }

    /// Find which state an item is currently in
    pub async fn locate(&self, id: &str) -> Option<ItemState> {
        for state in ItemState::ALL {
            if self.exists(state, id).await {
                return Some(state);
            }
        }
        None
    }

    /// Read and parse an item
    pub async fn read(&self, state: ItemState, id: &str) -> Result<Item, StoreError> {
        let path = self.item_path(state, id);
        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound {
                    id: id.to_string(),
                    state,
                })
            }
            Err(e) => return Err(e.into()),
        };

        Item::parse(id, state, path, &text).map_err(|source| StoreError::Malformed {
            id: id.to_string(),
            source,
        })
    }

    /// Write a new item into a state. Never overwrites: an existing item with the
    /// same id in that state yields `AlreadyExists`.
    pub async fn create(
        &self,
        state: ItemState,
        id: &str,
        header: ItemHeader,
        body: &str,
    ) -> Result<Item, StoreError> {
        let path = self.item_path(state, id);
        let document = render_document(&header, body)?;

        let target = path.clone();
        tokio::task::spawn_blocking(move || atomic::atomic_create(&target, document.as_bytes()))
            .await?
            .map_err(|e| match e.kind() {
                io::ErrorKind::AlreadyExists => StoreError::AlreadyExists(path.clone()),
                _ => StoreError::Io(e),
            })?;

        debug!(%id, %state, "Item created");

        Ok(Item {
            id: id.to_string(),
            state,
            header,
            body: body.to_string(),
            path,
        })
    }

    /// Replace an item's header and body in place (atomic for readers)
    pub async fn update(
        &self,
        state: ItemState,
        id: &str,
        header: &ItemHeader,
        body: &str,
    ) -> Result<(), StoreError> {
        let path = self.item_path(state, id);
        if !self.exists(state, id).await {
            return Err(StoreError::NotFound {
                id: id.to_string(),
                state,
            });
        }

        let document = render_document(header, body)?;
        tokio::task::spawn_blocking(move || atomic::atomic_write(&path, document.as_bytes()))
            .await??;
        Ok(())
    }

    /// Copy a source file in as an item's companion payload
    pub async fn attach_payload(
        &self,
        state: ItemState,
        id: &str,
        source: &Path,
    ) -> Result<PathBuf, StoreError> {
        let dst = self.payload_path(state, id);
        let (src, target) = (source.to_path_buf(), dst.clone());

        tokio::task::spawn_blocking(move || atomic::atomic_copy(&src, &target))
            .await?
            .map_err(|e| match e.kind() {
                io::ErrorKind::AlreadyExists => StoreError::AlreadyExists(dst.clone()),
                _ => StoreError::Io(e),
            })?;

        Ok(dst)
    }

    /// Move an item (and its payload, if any) along a legal transition
    pub async fn transition(
        &self,
        id: &str,
        from: ItemState,
        to: ItemState,
    ) -> Result<PathBuf, StoreError> {
        if !from.can_transition_to(to) {
            return Err(StoreError::IllegalTransition {
                id: id.to_string(),
                from,
                to,
            });
        }

        let src = self.item_path(from, id);
        let dst = self.item_path(to, id);

        if !self.exists(from, id).await {
            return Err(StoreError::NotFound {
                id: id.to_string(),
                state: from,
            });
        }
        if fs::metadata(&dst).await.is_ok() {
            return Err(StoreError::AlreadyExists(dst));
        }

        // Payload first, so the item never shows up in `to` without it
        let payload_src = self.payload_path(from, id);
        let payload_dst = self.payload_path(to, id);
        let has_payload = fs::metadata(&payload_src)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false);

        if has_payload {
            move_blocking(payload_src.clone(), payload_dst.clone()).await?;
        }

        if let Err(e) = move_blocking(src, dst.clone()).await {
            if has_payload {
                let _ = move_blocking(payload_dst, payload_src).await;
            }
            return Err(e);
        }

        debug!(%id, %from, %to, "Item moved");
        Ok(dst)
    }

    /// Number of items per state
    pub async fn counts(&self) -> Result<BTreeMap<ItemState, usize>, StoreError> {
        let mut counts = BTreeMap::new();
        for state in ItemState::ALL {
            counts.insert(state, self.list_ids(state).await?.len());
        }
        Ok(counts)
    }
}

async fn move_blocking(src: PathBuf, dst: PathBuf) -> Result<(), StoreError> {
    let target = dst.clone();
    tokio::task::spawn_blocking(move || atomic::move_no_clobber(&src, &target))
        .await?
        .map_err(|e| match e.kind() {
            io::ErrorKind::AlreadyExists => StoreError::AlreadyExists(dst),
            _ => StoreError::Io(e),
        })
}
