//! Atomic file primitives for the vault.
//!
//! Readers of the vault (the orchestrator, the agent, a human in Obsidian) must
//! never see a half-written item or the same item in two folders:
//!
//! - writes go to a temp file in the destination directory, are fsynced, then
//!   renamed into place
//! - moves are a single no-replace rename within the vault; across volumes
//!   they fall back to copy + verify + delete
//!
//! These are blocking calls; async callers wrap them in `spawn_blocking`.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::Path;

use sha2::{Digest, Sha256};
use tempfile::{NamedTempFile, PathPersistError, TempPath};

/// Write `data` to `path`, replacing any existing file atomically.
pub fn atomic_write(path: &Path, data: &[u8]) -> io::Result<()> {
    let tmp = write_temp_sibling(path, data)?;
    tmp.persist(path).map_err(|e| e.error)?;
    sync_parent(path);
    Ok(())
}

/// Write `data` to `path`, failing with `AlreadyExists` if `path` exists.
pub fn atomic_create(path: &Path, data: &[u8]) -> io::Result<()> {
    let tmp = write_temp_sibling(path, data)?;
    tmp.persist_noclobber(path).map_err(|e| e.error)?;
    sync_parent(path);
    Ok(())
}

/// Copy `src` to `dst` (which must not exist) so `dst` appears complete or not at all.
pub fn atomic_copy(src: &Path, dst: &Path) -> io::Result<()> {
    let parent = parent_of(dst)?;
    let mut tmp = NamedTempFile::new_in(parent)?;

    let mut source = File::open(src)?;
    io::copy(&mut source, tmp.as_file_mut())?;
    tmp.flush()?;
    tmp.as_file().sync_all()?;

    if file_digest(src)? != file_digest(tmp.path())? {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("copy of {} does not match its source", src.display()),
        ));
    }

    tmp.persist_noclobber(dst).map_err(|e| e.error)?;
    sync_parent(dst);
    Ok(())
}

/// Move `src` to `dst` without overwriting an existing `dst`.
///
/// The existence check and the rename are one operation (`renameat2` with
/// `RENAME_NOREPLACE` where available, link + unlink otherwise).
pub fn move_no_clobber(src: &Path, dst: &Path) -> io::Result<()> {
    match TempPath::from_path(src).persist_noclobber(dst) {
        Ok(()) => {
            sync_parent(dst);
            Ok(())
        }
        Err(PathPersistError { error, path }) => {
            // Disarm, so dropping it leaves the source alone
            let _ = path.keep();
            if is_cross_device(&error) {
                atomic_copy(src, dst)?;
                fs::remove_file(src)
            } else {
                Err(error)
            }
        }
    }
}

/// SHA-256 of a file's contents, hex encoded
pub fn file_digest(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];

    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

fn write_temp_sibling(path: &Path, data: &[u8]) -> io::Result<NamedTempFile> {
    let parent = parent_of(path)?;
    fs::create_dir_all(parent)?;

    let mut tmp = NamedTempFile::new_in(parent)?;
    tmp.write_all(data)?;
    tmp.flush()?;
    tmp.as_file().sync_all()?;
    Ok(tmp)
}

fn parent_of(path: &Path) -> io::Result<&Path> {
    path.parent().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("path has no parent directory: {}", path.display()),
        )
    })
}

/// Best effort: make the rename durable. Not all platforms can fsync a directory.
fn sync_parent(path: &Path) {
    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
}

/// EXDEV on Unix, ERROR_NOT_SAME_DEVICE on Windows
fn is_cross_device(err: &io::Error) -> bool {
    match err.raw_os_error() {
        Some(18) => cfg!(unix),
        Some(17) => cfg!(windows),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_atomic_write_replaces() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("Dashboard.md");

        atomic_write(&path, b"one").unwrap();
        atomic_write(&path, b"two").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "two");
        // No temp files left behind
        assert_eq!(fs::read_dir(temp.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_atomic_create_refuses_existing() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("item.md");

        atomic_create(&path, b"first").unwrap();
        let err = atomic_create(&path, b"second").unwrap_err();

        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        assert_eq!(fs::read_to_string(&path).unwrap(), "first");
    }

    #[test]
    fn test_move_no_clobber() {
        let temp = TempDir::new().unwrap();
        let a = temp.path().join("a.md");
        let b = temp.path().join("b.md");

        fs::write(&a, "a").unwrap();
        fs::write(&b, "b").unwrap();
        let err = move_no_clobber(&a, &b).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        assert_eq!(fs::read_to_string(&a).unwrap(), "a");
        assert_eq!(fs::read_to_string(&b).unwrap(), "b");

        fs::remove_file(&b).unwrap();
        move_no_clobber(&a, &b).unwrap();
        assert!(!a.exists());
        assert_eq!(fs::read_to_string(&b).unwrap(), "a");
    }

    #[test]
    fn test_move_no_clobber_missing_source_keeps_nothing() {
        let temp = TempDir::new().unwrap();
        let err = move_no_clobber(&temp.path().join("gone.md"), &temp.path().join("b.md")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        assert!(!temp.path().join("b.md").exists());
    }

    #[test]
    fn test_atomic_copy_preserves_content() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("invoice.pdf");
        let dst = temp.path().join("copy.pdf");

        fs::write(&src, vec![7u8; 20_000]).unwrap();
        atomic_copy(&src, &dst).unwrap();

        assert_eq!(file_digest(&src).unwrap(), file_digest(&dst).unwrap());
    }
}
