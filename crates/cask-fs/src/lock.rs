//! Advisory repository lock.
//!
//! A write transaction holds an exclusive `flock` on `<root>/.lock` for its
//! lifetime, so two processes (or two handles in one process) cannot commit
//! concurrently. The lock is advisory: readers never take it, and snapshot
//! views are read-only by construction.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

use crate::{FsError, Result};

/// Held exclusive lock on the repository; released when dropped.
#[derive(Debug)]
pub(crate) struct RepoLock {
    _file: File,
}

impl RepoLock {
    #[cfg(unix)]
    pub(crate) fn acquire(path: &Path) -> Result<RepoLock> {
        use std::os::unix::io::AsRawFd;

        let file = OpenOptions::new().create(true).write(true).open(path)?;
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            return Err(if err.kind() == io::ErrorKind::WouldBlock {
                FsError::Locked
            } else {
                err.into()
            });
        }
        Ok(RepoLock { _file: file })
    }

    #[cfg(not(unix))]
    pub(crate) fn acquire(path: &Path) -> Result<RepoLock> {
        Ok(RepoLock {
            _file: OpenOptions::new().create(true).write(true).open(path)?,
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn lock_is_exclusive_until_dropped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".lock");

        let held = RepoLock::acquire(&path).unwrap();
        assert!(matches!(RepoLock::acquire(&path), Err(FsError::Locked)));

        drop(held);
        RepoLock::acquire(&path).unwrap();
    }
}
