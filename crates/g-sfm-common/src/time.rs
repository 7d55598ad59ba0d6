//! ---
//! sfm_section: "01-shared-runtime"
//! sfm_subsection: "module"
//! sfm_type: "source"
//! sfm_scope: "code"
//! sfm_description: "Shared primitives and utilities for the fleet manager."
//! sfm_version: "v0.0.0-prealpha"
//! sfm_owner: "tbd"
//! ---
use chrono::{DateTime, Utc};

/// Timestamp component used in archive file names.
pub fn archive_stamp(at: DateTime<Utc>) -> String {
    at.format("%Y%m%d_%H%M%S").to_string()
}

/// Zero timestamp: the "unversioned" sentinel for build markers.
pub fn unversioned() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

/// True when the timestamp carries no version information.
pub fn is_unversioned(at: DateTime<Utc>) -> bool {
    at <= unversioned()
}

/// Parse an RFC 3339 build marker; anything unparsable is unversioned.
pub fn parse_marker(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|at| at.with_timezone(&Utc))
        .unwrap_or_else(|_| unversioned())
}

/// Render a build marker as RFC 3339.
pub fn format_marker(at: DateTime<Utc>) -> String {
    at.to_rfc3339()
}
