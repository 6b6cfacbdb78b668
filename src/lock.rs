//! Exclusive lock held around each dispatch, so that two messages arriving
//! at once are handled one after the other.

use nix::fcntl::{Flock, FlockArg};
use std::error::Error;
use std::fs::{File, OpenOptions};
use std::path::Path;

/// Held while alive. The kernel drops the lock with the process, so a crash
/// never leaves a stale lock behind.
pub struct ProcessingLock {
    _flock: Flock<File>,
}

impl ProcessingLock {
    /// Block until the lock is ours.
    pub fn acquire(path: &Path) -> Result<ProcessingLock, Box<dyn Error>> {
        Self::lock(path, FlockArg::LockExclusive)
    }

    /// Fail right away if someone else holds the lock.
    pub fn try_acquire(path: &Path) -> Result<ProcessingLock, Box<dyn Error>> {
        Self::lock(path, FlockArg::LockExclusiveNonblock)
    }

    fn lock(path: &Path, arg: FlockArg) -> Result<ProcessingLock, Box<dyn Error>> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(|e| format!("{}: {e}", path.display()))?;
        let flock = Flock::lock(file, arg)
            .map_err(|(_, errno)| format!("{}: lock: {errno}", path.display()))?;
        tracing::debug!(path = %path.display(), "processing lock acquired");
        Ok(ProcessingLock { _flock: flock })
    }
}

#[test]
fn test_lock_excludes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(".lock");
    let held = ProcessingLock::acquire(&path).unwrap();
    // flock locks belong to the open file description, so a second open
    // conflicts even within one process.
    ProcessingLock::try_acquire(&path).err().unwrap();
    drop(held);
    ProcessingLock::try_acquire(&path).unwrap();
}
