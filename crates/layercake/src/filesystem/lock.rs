//! Advisory lock on a base path.
//!
//! Mutating commands hold an exclusive `flock` on `<base>/.lock` for their
//! whole run so two invocations cannot reshape the same layer tree at once.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use layercake_common::{LayerError, LayerResult};
use rustix::fs::{FlockOperation, flock};
use rustix::io::Errno;

/// An acquired lock. Released on drop.
#[derive(Debug)]
pub struct BaseLock {
    file: File,
    path: PathBuf,
}

impl BaseLock {
    /// Take the lock without waiting.
    ///
    /// # Errors
    ///
    /// [`LayerError::Locked`] if another process holds it, or an OS error
    /// creating the lock file.
    pub fn acquire(path: &Path) -> LayerResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| LayerError::os("create directory", parent, e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(|e| LayerError::os("open lock file", path, e))?;

        match flock(&file, FlockOperation::NonBlockingLockExclusive) {
            Ok(()) => {
                tracing::debug!(path = %path.display(), "Acquired base path lock");
                Ok(Self {
                    file,
                    path: path.to_path_buf(),
                })
            }
            Err(e) if e == Errno::WOULDBLOCK => Err(LayerError::Locked {
                path: path.to_path_buf(),
            }),
            Err(e) => Err(LayerError::os("lock", path, e.into())),
        }
    }

    /// The lock file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for BaseLock {
    fn drop(&mut self) {
        if let Err(e) = flock(&self.file, FlockOperation::Unlock) {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to release lock");
        } else {
            tracing::debug!(path = %self.path.display(), "Released base path lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_holder_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cake/.lock");

        let lock = BaseLock::acquire(&path).unwrap();
        assert_eq!(lock.path(), path);
        assert!(matches!(
            BaseLock::acquire(&path),
            Err(LayerError::Locked { .. })
        ));

        drop(lock);
        BaseLock::acquire(&path).unwrap();
    }
}
