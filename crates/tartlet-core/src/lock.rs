//! Advisory file locks.
//!
//! Two lock scopes exist in the engine: the *home lock* (the VM home
//! directory, held briefly around collision checks) and the *VM lock* (the
//! VM's `config.json`, held for the VM's whole lifetime).
//!
//! Ordering matters on both counts:
//!
//! - `flock` locks belong to the open file description. Re-opening a path
//!   that is already locked through another descriptor and closing that
//!   descriptor drops the lock. The engine therefore reads the configuration
//!   document into memory *first* and acquires the VM lock on a descriptor
//!   it keeps open afterwards.
//! - The home lock is released only once the VM lock is secured, so a peer
//!   can never observe a window where neither lock covers the MAC collision
//!   check.

use std::fs::File;
use std::path::Path;

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use tracing::warn;

use crate::error::{EngineError, Result};

/// An exclusive advisory lock over an open file.
///
/// The lock is released when the value is dropped (or the process exits).
pub struct FileLock {
    inner: Flock<File>,
}

impl FileLock {
    /// Attempts to take an exclusive lock without blocking.
    ///
    /// Returns `Ok(None)` when another process already holds the lock.
    pub fn try_exclusive(file: File) -> Result<Option<Self>> {
        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(inner) => Ok(Some(Self { inner })),
            Err((_, Errno::EWOULDBLOCK)) => Ok(None),
            Err((_, errno)) => Err(EngineError::internal(format!("flock failed: {errno}"))),
        }
    }

    /// Takes an exclusive lock, blocking until it is available.
    pub fn exclusive(file: File) -> Result<Self> {
        Flock::lock(file, FlockArg::LockExclusive)
            .map(|inner| Self { inner })
            .map_err(|(_, errno)| EngineError::internal(format!("flock failed: {errno}")))
    }

    /// The locked file.
    #[must_use]
    pub fn file(&self) -> &File {
        &self.inner
    }

    /// Releases the lock, returning the still-open file.
    pub fn unlock(self) -> Result<File> {
        self.inner
            .unlock()
            .map_err(|(_, errno)| EngineError::internal(format!("funlock failed: {errno}")))
    }
}

/// Probes whether some other process holds an exclusive lock on `path`.
///
/// The probe takes (and immediately releases) a non-blocking exclusive lock
/// on a private descriptor, so it can never interfere with a lock this
/// process holds on a *different* descriptor. Probe failures are reported as
/// "not locked" since the caller only uses this as a liveness hint.
#[must_use]
pub fn is_locked_elsewhere(path: &Path) -> bool {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "lock probe open failed");
            return false;
        }
    };
    match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
        // Acquired: nobody else holds it. Dropping the guard releases it.
        Ok(_guard) => false,
        Err((_, Errno::EWOULDBLOCK)) => true,
        Err((_, errno)) => {
            warn!(path = %path.display(), error = %errno, "lock probe failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_file() -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut file = File::create(&path).unwrap();
        writeln!(file, "{{}}").unwrap();
        (dir, path)
    }

    #[test]
    fn test_try_exclusive_then_conflict() {
        let (_dir, path) = temp_file();
        let first = FileLock::try_exclusive(File::open(&path).unwrap())
            .unwrap()
            .expect("first lock should succeed");

        // A second descriptor must observe the conflict.
        let second = FileLock::try_exclusive(File::open(&path).unwrap()).unwrap();
        assert!(second.is_none());

        drop(first);
        let third = FileLock::try_exclusive(File::open(&path).unwrap()).unwrap();
        assert!(third.is_some());
    }

    #[test]
    fn test_unlock_releases() {
        let (_dir, path) = temp_file();
        let lock = FileLock::try_exclusive(File::open(&path).unwrap())
            .unwrap()
            .unwrap();
        let _file = lock.unlock().unwrap();

        assert!(
            FileLock::try_exclusive(File::open(&path).unwrap())
                .unwrap()
                .is_some()
        );
    }

    #[test]
    fn test_probe_reports_held_lock() {
        let (_dir, path) = temp_file();
        assert!(!is_locked_elsewhere(&path));

        let _lock = FileLock::try_exclusive(File::open(&path).unwrap())
            .unwrap()
            .unwrap();
        assert!(is_locked_elsewhere(&path));
    }

    #[test]
    fn test_probe_missing_path_is_not_locked() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!is_locked_elsewhere(&dir.path().join("nope")));
    }

    #[test]
    fn test_probe_does_not_steal_the_lock() {
        let (_dir, path) = temp_file();
        let _lock = FileLock::try_exclusive(File::open(&path).unwrap())
            .unwrap()
            .unwrap();
        // Repeated probes must keep seeing the holder.
        assert!(is_locked_elsewhere(&path));
        assert!(is_locked_elsewhere(&path));
    }

    #[test]
    fn test_reading_through_another_descriptor_keeps_the_lock() {
        // A held lock must survive reads through other descriptors:
        // closing a second fd for the same path must not release it.
        // POSIX record locks fail this; flock does not.
        let (_dir, path) = temp_file();
        let _lock = FileLock::try_exclusive(File::open(&path).unwrap())
            .unwrap()
            .unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(!contents.is_empty());

        assert!(is_locked_elsewhere(&path), "lock must survive the read");
    }

    #[test]
    fn test_lock_on_directory() {
        let dir = tempfile::tempdir().unwrap();
        let lock = FileLock::try_exclusive(File::open(dir.path()).unwrap()).unwrap();
        assert!(lock.is_some());
    }
}
