//! Item claims: at most one processing attempt per item at a time.
//!
//! A claim is an exclusive advisory lock on `.vaultflow/claims/<id>.lock`. The
//! lock lives as long as the [`Claim`] guard; the OS drops it when the process
//! exits, so a crashed orchestrator never leaves a stale claim behind.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::debug;

use crate::config::paths;

/// Hands out claims for items in one vault
#[derive(Debug, Clone)]
pub struct ClaimRegistry {
    dir: PathBuf,
}

impl ClaimRegistry {
    pub fn new(root: &Path) -> io::Result<Self> {
        let dir = paths::claims_dir(root);
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn lock_path(&self, item_id: &str) -> PathBuf {
        self.dir.join(format!("{}.lock", item_id))
    }

    /// Try to claim an item. `Ok(None)` means someone else holds it.
    pub fn try_claim(&self, item_id: &str) -> io::Result<Option<Claim>> {
        let path = self.lock_path(item_id);
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;

        match file.try_lock_exclusive() {
            Ok(()) => {}
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => return Ok(None),
            Err(e) => return Err(e),
        }

        // Holder pid, for humans inspecting the claims folder
        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;

        debug!(item_id, "Claimed");
        Ok(Some(Claim {
            item_id: item_id.to_string(),
            file,
        }))
    }

    /// Whether another holder currently has the item claimed
    pub fn is_claimed(&self, item_id: &str) -> io::Result<bool> {
        let path = self.lock_path(item_id);
        if !path.exists() {
            return Ok(false);
        }

        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        match file.try_lock_exclusive() {
            Ok(()) => {
                file.unlock()?;
                Ok(false)
            }
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => Ok(true),
            Err(e) => Err(e),
        }
    }
}

/// A held claim; released on drop
#[derive(Debug)]
pub struct Claim {
    item_id: String,
    file: File,
}

impl Drop for Claim {
    fn drop(&mut self) {
        let _ = self.file.unlock();
        debug!(item_id = %self.item_id, "Released claim");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_claim_is_exclusive() {
        let temp = TempDir::new().unwrap();
        let first = ClaimRegistry::new(temp.path()).unwrap();
        let second = ClaimRegistry::new(temp.path()).unwrap();

        let claim = first.try_claim("FILE_a").unwrap();
        assert!(claim.is_some());

        // Separate handle, as a second process would have
        assert!(second.try_claim("FILE_a").unwrap().is_none());
        assert!(second.is_claimed("FILE_a").unwrap());

        drop(claim);
        assert!(!second.is_claimed("FILE_a").unwrap());
        assert!(second.try_claim("FILE_a").unwrap().is_some());
    }

    #[test]
    fn test_claims_are_per_item() {
        let temp = TempDir::new().unwrap();
        let registry = ClaimRegistry::new(temp.path()).unwrap();

        let _a = registry.try_claim("A").unwrap().unwrap();
        assert!(registry.try_claim("B").unwrap().is_some());
        assert!(!registry.is_claimed("C").unwrap());
    }
}
