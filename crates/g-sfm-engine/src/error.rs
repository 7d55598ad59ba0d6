//! ---
//! sfm_section: "02-fleet-engine"
//! sfm_subsection: "module"
//! sfm_type: "source"
//! sfm_scope: "code"
//! sfm_description: "Fleet orchestration engine: locks, shutdown, updates, backup, scheduling."
//! sfm_version: "v0.0.0-prealpha"
//! sfm_owner: "tbd"
//! ---
use std::path::PathBuf;

use g_sfm_common::RunOutcome;
use thiserror::Error;

/// Failure families of the orchestration engine.
///
/// Configuration errors abort a unit immediately; contention and transient
/// errors are degraded to per-unit outcomes by the fleet scheduler.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("profile '{0}' not found")]
    ProfileNotFound(String),

    #[error("invalid profile: {0}")]
    BadProfile(String),

    #[error("invalid data directory {}", .0.display())]
    InvalidDataDirectory(PathBuf),

    #[error("invalid cache directory {}", .0.display())]
    InvalidCacheDirectory(PathBuf),

    #[error("cache not found at {}", .0.display())]
    CacheNotFound(PathBuf),

    #[error("package tool not found at {}", .0.display())]
    PackageToolNotFound(PathBuf),

    /// Lock contention. Callers report "already running" and skip the unit.
    #[error("resource busy: {}", .0.display())]
    Busy(PathBuf),

    /// Retry bound exhausted on a remote download.
    #[error("download failed after {attempts} attempts: {detail}")]
    DownloadFailed { attempts: u32, detail: String },

    #[error("mod metadata download failed: {0}")]
    ModMetadataFailed(String),

    /// The termination escalation ladder was exhausted.
    #[error("shutdown timed out for {0}")]
    ShutdownTimedOut(String),

    #[error("restart failed: {0}")]
    RestartFailed(String),

    #[error("backup failed: {0}")]
    BackupFailed(String),

    /// The run's cancellation signal fired.
    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("archive error: {0}")]
    Archive(String),

    #[error("store error: {0}")]
    Store(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    /// Map a failure onto the outcome code reported for the unit of work.
    pub fn outcome(&self) -> RunOutcome {
        match self {
            EngineError::ProfileNotFound(_) => RunOutcome::ProfileNotFound,
            EngineError::BadProfile(_) => RunOutcome::BadProfile,
            EngineError::InvalidDataDirectory(_) => RunOutcome::InvalidDataDirectory,
            EngineError::InvalidCacheDirectory(_) => RunOutcome::InvalidCacheDirectory,
            EngineError::CacheNotFound(_) => RunOutcome::CacheNotFound,
            EngineError::PackageToolNotFound(_) => RunOutcome::PackageToolNotFound,
            EngineError::Busy(_) => RunOutcome::AlreadyRunning,
            EngineError::DownloadFailed { .. } => RunOutcome::BranchCacheUpdateFailed,
            EngineError::ModMetadataFailed(_) => RunOutcome::ModMetadataDownloadFailed,
            EngineError::ShutdownTimedOut(_) => RunOutcome::ShutdownTimedOut,
            EngineError::RestartFailed(_) => RunOutcome::RestartFailed,
            EngineError::BackupFailed(_) => RunOutcome::BackupFailed,
            EngineError::Cancelled => RunOutcome::Cancelled,
            EngineError::Io(_) | EngineError::Archive(_) | EngineError::Store(_) => {
                RunOutcome::UnknownError
            }
        }
    }
}
