//! Cross-process commit lock.
//!
//! The lock is an exclusive `flock` on the lock file, so the kernel releases
//! it when the holder exits, however it exits. The holder writes its PID into
//! the file for diagnostics and unlinks the file when the guard drops. Waiters
//! poll until the configured timeout and then fail hard.

use crate::core::config::LockConfig;
use crate::core::error::CommitError;
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Instant;

/// Held for the duration of a commit, bootstrap, merge, migrate or snapshot.
#[derive(Debug)]
pub struct CommitLock {
    path: PathBuf,
    guard: Flock<File>,
}

impl CommitLock {
    pub fn acquire(path: &Path, config: &LockConfig) -> Result<Self, CommitError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let deadline = Instant::now() + config.timeout();
        let mut announced = false;
        loop {
            if let Some(lock) = try_acquire(path)? {
                tracing::debug!(path = %path.display(), "commit lock acquired");
                return Ok(lock);
            }
            if Instant::now() >= deadline {
                return Err(CommitError::LockError(format!(
                    "timed out after {}s waiting for {} (held by {})",
                    config.timeout_secs,
                    path.display(),
                    holder(path).map_or_else(|| "unknown".to_string(), |p| format!("pid {}", p))
                )));
            }
            if !announced {
                tracing::info!(path = %path.display(), "waiting for another commit to finish");
                announced = true;
            }
            thread::sleep(config.poll_interval());
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for CommitLock {
    fn drop(&mut self) {
        // unlink while still locked; the flock goes with the guard
        let _ = fs::remove_file(&self.path);
    }
}

fn try_acquire(path: &Path) -> Result<Option<CommitLock>, CommitError> {
    loop {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;
        let mut guard = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(guard) => guard,
            Err((_, errno)) if errno == Errno::EWOULDBLOCK => return Ok(None),
            Err((_, errno)) => {
                return Err(CommitError::LockError(format!(
                    "cannot lock {}: {}",
                    path.display(),
                    errno
                )));
            }
        };
        // the previous holder may have unlinked the file between our open
        // and our flock; a lock on an orphaned inode excludes nobody
        if !still_linked(&guard, path)? {
            continue;
        }
        guard.set_len(0)?;
        writeln!(&mut *guard, "{}", std::process::id())?;
        guard.sync_all()?;
        return Ok(Some(CommitLock {
            path: path.to_path_buf(),
            guard,
        }));
    }
}

fn still_linked(file: &File, path: &Path) -> Result<bool, CommitError> {
    let held = file.metadata()?;
    match fs::metadata(path) {
        Ok(current) => Ok(current.dev() == held.dev() && current.ino() == held.ino()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(CommitError::IoError(err)),
    }
}

fn holder(path: &Path) -> Option<i32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}
