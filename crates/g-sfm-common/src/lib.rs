//! ---
//! sfm_section: "01-shared-runtime"
//! sfm_subsection: "module"
//! sfm_type: "source"
//! sfm_scope: "code"
//! sfm_description: "Shared primitives and utilities for the fleet manager."
//! sfm_version: "v0.0.0-prealpha"
//! sfm_owner: "tbd"
//! ---
//! Core shared primitives for the G-SFM fleet manager workspace.
//! This crate exposes configuration loading, logging, outcome codes,
//! and time helpers consumed across the workspace.

pub mod config;
pub mod logging;
pub mod outcome;
pub mod time;

pub use config::{
    BackupSettings, DepotSettings, GlobalConfig, LockSettings, LoggingConfig, NotifySettings,
    PathsConfig, ShutdownMessages, ShutdownSettings, UpdateSettings,
};
pub use logging::{init_tracing, LogFormat};
pub use outcome::RunOutcome;
