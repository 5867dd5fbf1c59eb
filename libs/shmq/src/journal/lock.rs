//! Exclusive advisory lock over a journal file
//!
//! The guard owns a duplicate of the journal's descriptor, so the journal
//! can remap itself while the lock is held.

use std::fs::File;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::{debug, warn};

use crate::error::{ChannelError, JournalOp, Result};

pub struct JournalLock {
    file: File,
    path: PathBuf,
}

impl JournalLock {
    /// Block until the lock is held
    pub fn acquire(file: &File, path: &Path) -> Result<Self> {
        if let Some(lock) = Self::try_acquire(file, path)? {
            return Ok(lock);
        }
        debug!("Journal {:?} is locked by another process, waiting", path);
        let file = duplicate(file, path)?;
        file.lock_exclusive()
            .map_err(|e| ChannelError::journal(JournalOp::Lock, path, e))?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Take the lock only if nobody else holds it
    pub fn try_acquire(file: &File, path: &Path) -> Result<Option<Self>> {
        let file = duplicate(file, path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self {
                file,
                path: path.to_path_buf(),
            })),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => Ok(None),
            Err(e) => Err(ChannelError::journal(JournalOp::Lock, path, e)),
        }
    }
}

impl Drop for JournalLock {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            warn!("Failed to unlock journal {:?}: {}", self.path, e);
        }
    }
}

fn duplicate(file: &File, path: &Path) -> Result<File> {
    file.try_clone()
        .map_err(|e| ChannelError::journal(JournalOp::Lock, path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use tempfile::tempdir;

    #[test]
    fn test_lock_excludes_other_descriptions() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("lock.journal");
        let open = || {
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)
                .unwrap()
        };
        let first = open();
        let second = open();

        let held = JournalLock::acquire(&first, &path).unwrap();
        assert!(JournalLock::try_acquire(&second, &path).unwrap().is_none());
        drop(held);
        assert!(JournalLock::try_acquire(&second, &path).unwrap().is_some());
    }

    #[test]
    fn test_acquire_waits_for_holder() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wait.journal");
        let open = || {
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)
                .unwrap()
        };
        let first = open();
        let second = open();

        let held = JournalLock::acquire(&first, &path).unwrap();
        std::thread::scope(|s| {
            let waiter = s.spawn(|| JournalLock::acquire(&second, &path).map(drop));
            std::thread::sleep(std::time::Duration::from_millis(20));
            assert!(!waiter.is_finished());
            drop(held);
            waiter.join().unwrap().unwrap();
        });
    }
}
