//! ---
//! sfm_section: "02-fleet-engine"
//! sfm_subsection: "module"
//! sfm_type: "source"
//! sfm_scope: "code"
//! sfm_description: "Fleet orchestration engine: locks, shutdown, updates, backup, scheduling."
//! sfm_version: "v0.0.0-prealpha"
//! sfm_owner: "tbd"
//! ---
//! Cross-process named mutual exclusion keyed by a path hash.
//!
//! The key is the hex digest of the normalized target path, so the same
//! directory maps to the same lock file across processes and restarts. A
//! guard holds an exclusive advisory lock on that file and releases it on
//! drop, which keeps release unconditional on every exit path.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;

use fs2::FileExt;
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{EngineError, Result};

/// Result of a lock acquisition attempt.
#[derive(Debug)]
pub enum LockAcquisition {
    Acquired(PathLock),
    /// Another holder kept the lock for the whole wait. Callers must treat
    /// this as "already running" and skip the unit of work.
    Busy,
}

impl LockAcquisition {
    pub fn is_busy(&self) -> bool {
        matches!(self, LockAcquisition::Busy)
    }
}

/// Exclusive advisory lock on a target directory. Released on drop.
#[derive(Debug)]
pub struct PathLock {
    file: File,
    lock_path: PathBuf,
}

impl Drop for PathLock {
    fn drop(&mut self) {
        if let Err(err) = self.file.unlock() {
            warn!(lock = %self.lock_path.display(), error = %err, "failed to release path lock");
        }
        debug!(lock = %self.lock_path.display(), "path lock released");
    }
}

/// Deterministic lock key for a target path.
///
/// Normalization is textual (lowercased absolute-ish form), not
/// `canonicalize`, because the target directory may not exist yet when the
/// first run locks it.
pub fn lock_key(target: &Path) -> String {
    let normalized = target
        .to_string_lossy()
        .replace('\\', "/")
        .to_lowercase();
    let digest = Sha256::digest(normalized.as_bytes());
    hex::encode(digest)
}

/// Acquire the lock for `target`, waiting up to `timeout`.
///
/// The first attempt is immediate; afterwards the holder is polled every
/// `attempt_delay` until `timeout` elapses, which yields `Busy`. The wait
/// honours `cancel`.
pub async fn acquire(
    lock_dir: &Path,
    target: &Path,
    timeout: Duration,
    attempt_delay: Duration,
    cancel: &CancellationToken,
) -> Result<LockAcquisition> {
    fs::create_dir_all(lock_dir)?;
    let lock_path = lock_dir.join(format!("{}.lock", lock_key(target)));
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(&lock_path)?;

    let deadline = Instant::now() + timeout;
    loop {
        match file.try_lock_exclusive() {
            Ok(()) => {
                debug!(target = %target.display(), lock = %lock_path.display(), "path lock acquired");
                return Ok(LockAcquisition::Acquired(PathLock { file, lock_path }));
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(err) => return Err(EngineError::Io(err)),
        }

        if Instant::now() >= deadline {
            debug!(target = %target.display(), "path lock busy after timeout");
            return Ok(LockAcquisition::Busy);
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            _ = tokio::time::sleep(attempt_delay) => {}
        }
    }
}
