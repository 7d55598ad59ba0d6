//! ---
//! sfm_section: "01-shared-runtime"
//! sfm_subsection: "module"
//! sfm_type: "source"
//! sfm_scope: "code"
//! sfm_description: "Shared primitives and utilities for the fleet manager."
//! sfm_version: "v0.0.0-prealpha"
//! sfm_owner: "tbd"
//! ---
//! Run outcome classification shared by every engine entry point.
//!
//! Each unit of work (profile, branch, or fleet) finishes with exactly one
//! [`RunOutcome`]. The numeric codes are a stable external contract: the
//! control CLI exits with them and downstream tooling matches on them.

use serde::{Deserialize, Serialize};
use strum::Display;

/// Numeric exit codes for every [`RunOutcome`] variant.
///
/// The values are grouped by failure family: 9xx for argument/profile
/// problems, 10xx for configuration gates, 2xxx for cache refresh, 3xxx for
/// distribution, 4xxx for backup/shutdown, and 5xxx for restart.
pub mod exit_codes {
    pub const NORMAL: i32 = 0;
    pub const COMPLETED_WITH_ERRORS: i32 = 98;
    pub const CANCELLED: i32 = 99;

    pub const UNKNOWN_ERROR: i32 = 991;
    pub const UNKNOWN_WORKER_ERROR: i32 = 992;
    pub const BAD_PROFILE: i32 = 993;
    pub const PROFILE_NOT_FOUND: i32 = 994;
    pub const BAD_ARGUMENT: i32 = 995;

    pub const AUTO_UPDATE_NOT_ENABLED: i32 = 1001;
    pub const AUTO_SHUTDOWN_NOT_ENABLED: i32 = 1002;
    pub const AUTO_BACKUP_NOT_ENABLED: i32 = 1003;
    pub const CACHE_NOT_FOUND: i32 = 1005;
    pub const PACKAGE_TOOL_NOT_FOUND: i32 = 1006;
    pub const PROCESS_SKIPPED: i32 = 1010;
    pub const ALREADY_RUNNING: i32 = 1011;
    pub const INVALID_DATA_DIRECTORY: i32 = 1012;
    pub const INVALID_CACHE_DIRECTORY: i32 = 1013;

    pub const BRANCH_CACHE_UPDATE_FAILED: i32 = 2001;
    pub const MOD_CACHE_UPDATE_FAILED: i32 = 2101;
    pub const MOD_METADATA_DOWNLOAD_FAILED: i32 = 2102;

    pub const SERVER_UPDATE_FAILED: i32 = 3001;
    pub const MOD_UPDATE_FAILED: i32 = 3002;

    pub const BACKUP_FAILED: i32 = 4001;
    pub const SHUTDOWN_TIMED_OUT: i32 = 4002;

    pub const RESTART_FAILED: i32 = 5001;
}

/// One deterministic result per unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum RunOutcome {
    Normal,
    /// Fleet-level aggregate: some units failed but the run itself completed.
    CompletedWithErrors,
    Cancelled,
    UnknownError,
    UnknownWorkerError,
    BadProfile,
    ProfileNotFound,
    BadArgument,
    AutoUpdateNotEnabled,
    AutoShutdownNotEnabled,
    AutoBackupNotEnabled,
    CacheNotFound,
    PackageToolNotFound,
    /// The profile was inside its restart grace period and was not touched.
    ProcessSkipped,
    /// Lock contention: another run already owns this unit.
    AlreadyRunning,
    InvalidDataDirectory,
    InvalidCacheDirectory,
    BranchCacheUpdateFailed,
    ModCacheUpdateFailed,
    ModMetadataDownloadFailed,
    ServerUpdateFailed,
    ModUpdateFailed,
    BackupFailed,
    ShutdownTimedOut,
    RestartFailed,
}

impl RunOutcome {
    /// Stable numeric code suitable as a process exit code.
    pub fn code(self) -> i32 {
        use exit_codes::*;
        match self {
            RunOutcome::Normal => NORMAL,
            RunOutcome::CompletedWithErrors => COMPLETED_WITH_ERRORS,
            RunOutcome::Cancelled => CANCELLED,
            RunOutcome::UnknownError => UNKNOWN_ERROR,
            RunOutcome::UnknownWorkerError => UNKNOWN_WORKER_ERROR,
            RunOutcome::BadProfile => BAD_PROFILE,
            RunOutcome::ProfileNotFound => PROFILE_NOT_FOUND,
            RunOutcome::BadArgument => BAD_ARGUMENT,
            RunOutcome::AutoUpdateNotEnabled => AUTO_UPDATE_NOT_ENABLED,
            RunOutcome::AutoShutdownNotEnabled => AUTO_SHUTDOWN_NOT_ENABLED,
            RunOutcome::AutoBackupNotEnabled => AUTO_BACKUP_NOT_ENABLED,
            RunOutcome::CacheNotFound => CACHE_NOT_FOUND,
            RunOutcome::PackageToolNotFound => PACKAGE_TOOL_NOT_FOUND,
            RunOutcome::ProcessSkipped => PROCESS_SKIPPED,
            RunOutcome::AlreadyRunning => ALREADY_RUNNING,
            RunOutcome::InvalidDataDirectory => INVALID_DATA_DIRECTORY,
            RunOutcome::InvalidCacheDirectory => INVALID_CACHE_DIRECTORY,
            RunOutcome::BranchCacheUpdateFailed => BRANCH_CACHE_UPDATE_FAILED,
            RunOutcome::ModCacheUpdateFailed => MOD_CACHE_UPDATE_FAILED,
            RunOutcome::ModMetadataDownloadFailed => MOD_METADATA_DOWNLOAD_FAILED,
            RunOutcome::ServerUpdateFailed => SERVER_UPDATE_FAILED,
            RunOutcome::ModUpdateFailed => MOD_UPDATE_FAILED,
            RunOutcome::BackupFailed => BACKUP_FAILED,
            RunOutcome::ShutdownTimedOut => SHUTDOWN_TIMED_OUT,
            RunOutcome::RestartFailed => RESTART_FAILED,
        }
    }

    pub fn is_normal(self) -> bool {
        matches!(self, RunOutcome::Normal)
    }

    /// Fold a set of unit outcomes into one fleet-level outcome.
    ///
    /// All-normal folds to `Normal`; anything else folds to
    /// `CompletedWithErrors`, deliberately distinct from every individual
    /// failure code so callers can tell "some work failed" from "this run
    /// failed outright."
    pub fn aggregate<I>(outcomes: I) -> RunOutcome
    where
        I: IntoIterator<Item = RunOutcome>,
    {
        let mut all_normal = true;
        for outcome in outcomes {
            if !outcome.is_normal() {
                all_normal = false;
            }
        }
        if all_normal {
            RunOutcome::Normal
        } else {
            RunOutcome::CompletedWithErrors
        }
    }
}
