/// Singleton enforcement via an advisory `flock` on a well-known path.
///
/// The lock is held for the whole process lifetime; the kernel releases it
/// when the file descriptor closes, so a crash never leaves a stale lock.
/// A second instance observing contention is expected to exit successfully:
/// supervisors on the image may launch the daemon redundantly.
use anyhow::{Context, Result};
use std::fs::File;
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::path::Path;

pub struct SingletonLock {
    // Held only to keep the descriptor (and thus the flock) alive.
    _file: File,
}

/// Tries to take the exclusive non-blocking lock on `path`.
///
/// Returns `Ok(Some(lock))` on acquisition (with our pid written into the
/// file for observability), `Ok(None)` when another instance already holds
/// it, and `Err` for real I/O failures.
pub fn acquire(path: &Path) -> Result<Option<SingletonLock>> {
    let mut file = File::create(path)
        .with_context(|| format!("Failed to create lock file: {}", path.display()))?;

    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
            return Ok(None);
        }
        return Err(err).with_context(|| format!("flock failed on {}", path.display()));
    }

    // Best effort: the pid is diagnostic only.
    let _ = write!(file, "{}", std::process::id());
    let _ = file.flush();

    Ok(Some(SingletonLock { _file: file }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_writes_pid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hotplugd.lock");

        let lock = acquire(&path).unwrap();
        assert!(lock.is_some());

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, std::process::id().to_string());
    }

    #[test]
    fn contended_acquire_returns_none() {
        // flock is per open file description, so a second independent open
        // of the same path conflicts even within one process.
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hotplugd.lock");

        let first = acquire(&path).unwrap();
        assert!(first.is_some());
        assert!(acquire(&path).unwrap().is_none());

        drop(first);
        assert!(acquire(&path).unwrap().is_some());
    }

    #[test]
    fn unwritable_path_is_an_error() {
        let path = Path::new("/nonexistent-dir-for-test/hotplugd.lock");
        assert!(acquire(path).is_err());
    }
}
