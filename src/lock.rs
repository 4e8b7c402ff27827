// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{Error, Result};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::Path;

/// Advisory lock on the database `LOCK` file
///
/// Writable engines hold the exclusive lock for their lifetime, readers the
/// shared one. The lock is released when the value is dropped.
pub struct LockFile {
    file: File,
}

impl LockFile {
    /// Takes the exclusive lock, failing with [`Error::FileLock`] if any
    /// other process holds the file.
    pub fn acquire_exclusive(db_path: &Path) -> Result<Self> {
        let file = Self::open(db_path)?;
        file.try_lock_exclusive().map_err(|_| Error::FileLock)?;
        Ok(Self { file })
    }

    /// Takes the shared lock, failing if a writer holds the file.
    pub fn acquire_shared(db_path: &Path) -> Result<Self> {
        let file = Self::open(db_path)?;
        file.try_lock_shared().map_err(|_| Error::FileLock)?;
        Ok(Self { file })
    }

    fn open(db_path: &Path) -> Result<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(db_path.join(crate::file::LOCK_FILE))
            .map_err(Error::FileOpen)
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(e) = fs2::FileExt::unlock(&self.file) {
            log::warn!("Failed to release lock file: {e:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn lock_exclusive_conflicts() -> Result<()> {
        let dir = tempfile::tempdir().map_err(Error::FileWrite)?;

        let held = LockFile::acquire_exclusive(dir.path())?;
        assert!(matches!(
            LockFile::acquire_exclusive(dir.path()),
            Err(Error::FileLock)
        ));
        assert!(matches!(
            LockFile::acquire_shared(dir.path()),
            Err(Error::FileLock)
        ));

        drop(held);
        let _relock = LockFile::acquire_exclusive(dir.path())?;

        Ok(())
    }

    #[test]
    fn lock_shared_is_shared() -> Result<()> {
        let dir = tempfile::tempdir().map_err(Error::FileWrite)?;

        let _r1 = LockFile::acquire_shared(dir.path())?;
        let _r2 = LockFile::acquire_shared(dir.path())?;
        assert!(matches!(
            LockFile::acquire_exclusive(dir.path()),
            Err(Error::FileLock)
        ));

        Ok(())
    }
}
