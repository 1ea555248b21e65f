//! Host-wide execution guard.
//!
//! Exactly one orchestrator instance may run per host. The guard is an
//! exclusive advisory lock on a well-known file holding the owner's PID,
//! with an optional bounded wait-and-retry for callers (like the renewal
//! scheduler) that prefer waiting briefly over failing outright.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use fs2::FileExt;

use crate::error::StageError;

pub const DEFAULT_LOCK_PATH: &str = "/run/lock/pki-setup.lock";
pub const LOCK_RETRY_DELAY: Duration = Duration::from_secs(3);

/// RAII guard: unlocks and removes the lock file on drop.
#[derive(Debug)]
pub struct ExecutionGuard {
    _file: File,
    path: PathBuf,
}

impl ExecutionGuard {
    /// Acquire the lock, retrying up to `wait_attempts` extra times with a
    /// fixed delay. `wait_attempts == 0` fails immediately on contention.
    pub fn acquire(path: &Path, wait_attempts: u32) -> Result<Self, StageError> {
        for attempt in 0..=wait_attempts {
            if attempt > 0 {
                println!(
                    "Waiting {}s before retrying the lock ({attempt}/{wait_attempts})...",
                    LOCK_RETRY_DELAY.as_secs()
                );
                thread::sleep(LOCK_RETRY_DELAY);
            }
            if let Some(guard) = Self::try_acquire(path)? {
                if attempt > 0 {
                    println!("Lock acquired.");
                }
                return Ok(guard);
            }
            match holder_pid(path) {
                Some(pid) => println!("Another pki-setup instance is running (pid {pid})."),
                None => println!("Another pki-setup instance is running."),
            }
        }
        Err(StageError::LockContention {
            holder: holder_pid(path),
        })
    }

    fn try_acquire(path: &Path) -> Result<Option<Self>> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating lock directory '{}'", parent.display()))?;
        }

        // Never unlink a "stale" lock file: a second process could create a
        // fresh file at the same path and take a separate exclusive lock.
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("opening lock file '{}'", path.display()))?;

        if file.try_lock_exclusive().is_err() {
            return Ok(None);
        }

        file.set_len(0)
            .and_then(|_| write!(file, "{}", std::process::id()))
            .with_context(|| format!("recording pid in '{}'", path.display()))?;

        Ok(Some(Self {
            _file: file,
            path: path.to_path_buf(),
        }))
    }
}

impl Drop for ExecutionGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Best-effort read of the lock holder's PID.
fn holder_pid(path: &Path) -> Option<u32> {
    let mut text = String::new();
    File::open(path).ok()?.read_to_string(&mut text).ok()?;
    text.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_immediately_without_wait() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("guard.lock");

        let guard = ExecutionGuard::acquire(&path, 0).unwrap();
        match ExecutionGuard::acquire(&path, 0) {
            Err(StageError::LockContention { holder }) => {
                assert_eq!(holder, Some(std::process::id()));
            }
            other => panic!("expected lock contention, got {other:?}"),
        }
        drop(guard);
    }

    #[test]
    fn lock_is_reacquirable_after_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("guard.lock");

        drop(ExecutionGuard::acquire(&path, 0).unwrap());
        assert!(!path.exists());
        let again = ExecutionGuard::acquire(&path, 0).unwrap();
        drop(again);
    }

    #[test]
    fn lock_file_records_holder_pid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("guard.lock");

        let _guard = ExecutionGuard::acquire(&path, 0).unwrap();
        assert_eq!(holder_pid(&path), Some(std::process::id()));
    }
}
