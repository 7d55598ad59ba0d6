//! ---
//! sfm_section: "02-fleet-engine"
//! sfm_subsection: "module"
//! sfm_type: "source"
//! sfm_scope: "code"
//! sfm_description: "Fleet orchestration engine: locks, shutdown, updates, backup, scheduling."
//! sfm_version: "v0.0.0-prealpha"
//! sfm_owner: "tbd"
//! ---
//! Version ledger: plain-text marker files deciding skip-vs-update.
//!
//! Two marker flavours are kept distinct: server build markers persist an
//! RFC 3339 timestamp, mod markers persist an integer Unix timestamp.
//! Absence, empty content, or garbage always reads as "unversioned" and
//! forces an update; it is never a hard error. A marker is only written
//! after the corresponding artifact has been fully materialized.

use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use g_sfm_common::time;
use tracing::debug;

use crate::error::Result;

/// Build marker file name, inside a branch cache or a profile install.
pub const BUILD_MARKER_FILE: &str = ".build-stamp";

/// Mod marker file name, inside a mod cache or a distributed mod directory.
pub const MOD_MARKER_FILE: &str = ".mod-stamp";

/// Read a server build marker. Anything unreadable is unversioned.
pub fn read_build_marker(path: &Path) -> DateTime<Utc> {
    match fs::read_to_string(path) {
        Ok(raw) => time::parse_marker(&raw),
        Err(_) => time::unversioned(),
    }
}

/// Persist a server build marker.
pub fn write_build_marker(path: &Path, value: DateTime<Utc>) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, time::format_marker(value))?;
    debug!(marker = %path.display(), value = %value, "build marker advanced");
    Ok(())
}

/// Read a mod marker as Unix seconds. Absence or garbage reads as 0.
pub fn read_mod_marker(path: &Path) -> i64 {
    fs::read_to_string(path)
        .ok()
        .and_then(|raw| raw.trim().parse::<i64>().ok())
        .unwrap_or(0)
}

/// Persist a mod marker.
pub fn write_mod_marker(path: &Path, value: i64) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, value.to_string())?;
    debug!(marker = %path.display(), value, "mod marker advanced");
    Ok(())
}

/// A mod marker value of zero or less carries no version information.
pub fn mod_marker_is_unversioned(value: i64) -> bool {
    value <= 0
}

/// Distribution gate: act iff the cache is strictly newer, or the installed
/// side carries no version information at all.
pub fn build_is_stale(cache: DateTime<Utc>, installed: DateTime<Utc>) -> bool {
    time::is_unversioned(installed) || cache > installed
}

/// Same gate for mod markers.
pub fn mod_is_stale(cache: i64, installed: i64) -> bool {
    mod_marker_is_unversioned(installed) || cache > installed
}
