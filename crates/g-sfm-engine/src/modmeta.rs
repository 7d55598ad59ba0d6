//! ---
//! sfm_section: "02-fleet-engine"
//! sfm_subsection: "module"
//! sfm_type: "source"
//! sfm_scope: "code"
//! sfm_description: "Fleet orchestration engine: locks, shutdown, updates, backup, scheduling."
//! sfm_version: "v0.0.0-prealpha"
//! sfm_owner: "tbd"
//! ---
//! Mod metadata seam.
//!
//! Fetches remote metadata (title, last-updated time) for a batch of mod
//! ids. Metadata can legitimately be missing: the workshop entry may be
//! private, or the metadata service may have no record. Both cases feed the
//! force-update rules of the update pipeline rather than failing the run.

use std::collections::HashMap;

use async_trait::async_trait;

/// Remote metadata for one mod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModMetadata {
    pub id: String,
    pub title: String,
    /// Remote-reported last update, Unix seconds.
    pub time_updated: i64,
}

/// Per-mod metadata lookup result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModMetadataStatus {
    Known(ModMetadata),
    /// The entry exists but its details are hidden.
    Private,
    /// No metadata could be retrieved.
    Unavailable,
}

impl ModMetadataStatus {
    /// Display title for notifications; falls back to the id.
    pub fn title_or<'a>(&'a self, id: &'a str) -> &'a str {
        match self {
            ModMetadataStatus::Known(meta) if !meta.title.is_empty() => &meta.title,
            _ => id,
        }
    }

    pub fn time_updated(&self) -> Option<i64> {
        match self {
            ModMetadataStatus::Known(meta) => Some(meta.time_updated),
            _ => None,
        }
    }
}

/// Batch metadata provider for mod ids.
#[async_trait]
pub trait ModMetadataProvider: Send + Sync {
    async fn fetch(&self, ids: &[String]) -> anyhow::Result<HashMap<String, ModMetadataStatus>>;
}

/// Default provider for installs without a metadata service credential:
/// every mod reads as unavailable, which routes through the
/// force-update-if-no-metadata configuration.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoMetadata;

#[async_trait]
impl ModMetadataProvider for NoMetadata {
    async fn fetch(&self, ids: &[String]) -> anyhow::Result<HashMap<String, ModMetadataStatus>> {
        Ok(ids
            .iter()
            .map(|id| (id.clone(), ModMetadataStatus::Unavailable))
            .collect())
    }
}
