//! Two-level stage locking.
//!
//! In-process: a keyed mutex map hands out the same async mutex for the same
//! digest, serializing calculate+build+publish within this process.
//!
//! Cross-process: a [`LockManager`] serializes the publish window for a
//! `(project, digest)` pair across builder processes. The in-process mutex is
//! always acquired first; the cross-process lock is taken only between
//! "newly built" and "stored to cache".

use crate::error::{Result, StratumError};
use async_trait::async_trait;
use std::any::Any;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::warn;

/// Keyed mutex map: one async mutex per stage digest, shared by every task
/// of this process that handles the digest.
#[derive(Debug, Default)]
pub struct StageDigestMutexMap {
    inner: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl StageDigestMutexMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the mutex for `digest`, creating it on first use. The same
    /// digest always maps to the same mutex for the lifetime of the build.
    pub fn get(&self, digest: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = self.inner.lock().unwrap();
        Arc::clone(map.entry(digest.to_string()).or_default())
    }
}

/// Handle for a held cross-process stage lock.
pub struct StageLock {
    pub project: String,
    pub digest: String,
    token: Option<Box<dyn Any + Send>>,
}

impl StageLock {
    pub fn new(project: &str, digest: &str, token: Option<Box<dyn Any + Send>>) -> Self {
        Self { project: project.to_string(), digest: digest.to_string(), token }
    }

    pub fn take_token(&mut self) -> Option<Box<dyn Any + Send>> {
        self.token.take()
    }
}

/// Cross-process lock manager for stage publication.
#[async_trait]
pub trait LockManager: Send + Sync {
    /// Acquire the publish lock for `(project, digest)`.
    async fn lock_stage(&self, project: &str, digest: &str) -> Result<StageLock>;

    /// Release a previously acquired lock.
    async fn unlock(&self, lock: StageLock) -> Result<()>;
}

/// Advisory file-lock manager: one lock file per `(project, digest)` under a
/// shared directory, locked with `flock`.
pub struct FileLockManager {
    locks_dir: PathBuf,
    timeout: Duration,
}

/// How long a contended stage lock is polled before the wait is logged.
const CONTENTION_WARN_AFTER: Duration = Duration::from_millis(500);
const POLL_INTERVAL: Duration = Duration::from_millis(50);

impl FileLockManager {
    /// Default acquisition timeout. Publication is short; a holder alive
    /// this long is stuck.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

    pub fn new(locks_dir: impl Into<PathBuf>) -> Self {
        Self { locks_dir: locks_dir.into(), timeout: Self::DEFAULT_TIMEOUT }
    }

    pub fn with_timeout(locks_dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self { locks_dir: locks_dir.into(), timeout }
    }

    fn lock_path(&self, project: &str, digest: &str) -> PathBuf {
        self.locks_dir.join(format!("{}.{}.lock", project, digest))
    }

    /// Try a non-blocking exclusive lock on the file.
    #[cfg(unix)]
    fn try_acquire_exclusive(lock_path: &Path) -> io::Result<File> {
        use std::os::unix::io::AsRawFd;

        let file = OpenOptions::new().write(true).create(true).truncate(false).open(lock_path)?;

        let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if result == 0 {
            Ok(file)
        } else {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
                Err(io::Error::new(io::ErrorKind::WouldBlock, "lock held"))
            } else {
                Err(err)
            }
        }
    }

    #[cfg(not(unix))]
    fn try_acquire_exclusive(lock_path: &Path) -> io::Result<File> {
        match OpenOptions::new().write(true).create_new(true).open(lock_path) {
            Ok(file) => Ok(file),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                Err(io::Error::new(io::ErrorKind::WouldBlock, "lock held"))
            }
            Err(e) => Err(e),
        }
    }

    fn acquire_blocking(lock_path: PathBuf, timeout: Duration) -> io::Result<File> {
        let start = Instant::now();
        let mut warned = false;

        loop {
            match Self::try_acquire_exclusive(&lock_path) {
                Ok(file) => return Ok(file),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if !warned && start.elapsed() > CONTENTION_WARN_AFTER {
                        warn!(lock = %lock_path.display(), "stage lock contention, waiting");
                        warned = true;
                    }
                }
                Err(e) => return Err(e),
            }

            if start.elapsed() >= timeout {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("lock timeout after {:?}", timeout),
                ));
            }

            std::thread::sleep(POLL_INTERVAL);
        }
    }
}

#[async_trait]
impl LockManager for FileLockManager {
    async fn lock_stage(&self, project: &str, digest: &str) -> Result<StageLock> {
        fs::create_dir_all(&self.locks_dir).map_err(|e| StratumError::Lock {
            project: project.to_string(),
            digest: digest.to_string(),
            reason: e.to_string(),
        })?;

        let lock_path = self.lock_path(project, digest);
        let timeout = self.timeout;
        let file = tokio::task::spawn_blocking(move || Self::acquire_blocking(lock_path, timeout))
            .await
            .map_err(|e| StratumError::Internal(format!("lock task failed: {}", e)))?
            .map_err(|e| StratumError::Lock {
                project: project.to_string(),
                digest: digest.to_string(),
                reason: e.to_string(),
            })?;

        Ok(StageLock::new(project, digest, Some(Box::new(file))))
    }

    async fn unlock(&self, mut lock: StageLock) -> Result<()> {
        if let Some(token) = lock.take_token() {
            // flock is released when the descriptor is closed; do it off the
            // async workers in case close blocks on a network filesystem.
            tokio::task::spawn_blocking(move || drop(token))
                .await
                .map_err(|e| StratumError::Internal(format!("unlock task failed: {}", e)))?;
        }
        Ok(())
    }
}
