//! Single-writer lock for the data directory
//!
//! The worker is the only writer of window, cumulative and dwell state, and
//! sled refuses concurrent opens anyway. A PID file makes the second
//! instance fail with an actionable message instead of a database error.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// PID lock held for the lifetime of the worker. Released on drop.
#[derive(Debug)]
pub struct ProcessLock {
    lock_path: PathBuf,
    held: bool,
}

impl ProcessLock {
    const LOCK_FILE_NAME: &'static str = ".batchline.lock";

    /// Take the lock in `data_dir`, creating the directory if needed.
    ///
    /// A lock left by a process that no longer runs is removed.
    pub fn acquire<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        fs::create_dir_all(data_dir)
            .with_context(|| format!("Failed to create data directory: {:?}", data_dir))?;

        let lock_path = data_dir.join(Self::LOCK_FILE_NAME);

        if lock_path.exists() {
            match Self::holder_pid(&lock_path) {
                Ok(Some(pid)) => {
                    bail!(
                        "Another batchline worker is already using {:?} (PID: {})\n\
                         \n\
                         Stop that worker first. If it is not running, remove the lock:\n\
                            rm {:?}",
                        data_dir,
                        pid,
                        lock_path
                    );
                }
                Ok(None) => {
                    tracing::info!("[Lock] Removing stale lock file {:?}", lock_path);
                    fs::remove_file(&lock_path).context("Failed to remove stale lock file")?;
                }
                Err(e) => {
                    tracing::warn!("[Lock] Unreadable lock file ({}), replacing it", e);
                    fs::remove_file(&lock_path).context("Failed to remove unreadable lock file")?;
                }
            }
        }

        let pid = std::process::id();
        fs::write(&lock_path, format!("{pid}\n"))
            .with_context(|| format!("Failed to write lock file: {:?}", lock_path))?;
        tracing::debug!("[Lock] Acquired (PID: {}) at {:?}", pid, lock_path);

        Ok(Self {
            lock_path,
            held: true,
        })
    }

    /// PID recorded in the lock file if that process is still alive.
    fn holder_pid(lock_path: &Path) -> Result<Option<u32>> {
        let contents = fs::read_to_string(lock_path).context("Failed to read lock file")?;
        let pid: u32 = contents
            .trim()
            .parse()
            .context("Lock file does not contain a PID")?;
        Ok(Self::is_worker_alive(pid).then_some(pid))
    }

    #[cfg(unix)]
    fn is_worker_alive(pid: u32) -> bool {
        // A recycled PID that belongs to another program does not count.
        fs::read_to_string(format!("/proc/{pid}/cmdline"))
            .map(|cmdline| cmdline.contains("batchline"))
            .unwrap_or(false)
    }

    #[cfg(not(unix))]
    fn is_worker_alive(_pid: u32) -> bool {
        true
    }

    pub fn path(&self) -> &Path {
        &self.lock_path
    }

    /// Remove the lock file. Idempotent.
    pub fn release(&mut self) {
        if !self.held {
            return;
        }
        match fs::remove_file(&self.lock_path) {
            Ok(()) => tracing::debug!("[Lock] Released {:?}", self.lock_path),
            Err(e) => tracing::warn!("[Lock] Failed to remove lock file: {}", e),
        }
        self.held = false;
    }
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        self.release();
    }
}
