//! ---
//! sfm_section: "02-fleet-engine"
//! sfm_subsection: "module"
//! sfm_type: "source"
//! sfm_scope: "code"
//! sfm_description: "Fleet orchestration engine: locks, shutdown, updates, backup, scheduling."
//! sfm_version: "v0.0.0-prealpha"
//! sfm_owner: "tbd"
//! ---
//! Profile records and the on-disk fleet store.
//!
//! A run takes a full snapshot of the store up front, so concurrent edits
//! from outside cannot corrupt an in-flight run. Profiles are mutated only
//! by the run that owns them and written back only when their `updated`
//! flag is set.

use std::fs;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use g_sfm_common::config::PathsConfig;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{EngineError, Result};

fn default_true() -> bool {
    true
}

/// A named upstream release channel; unit of shared cache granularity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Branch {
    pub name: String,
    #[serde(default)]
    pub password: Option<String>,
}

impl Branch {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            password: None,
        }
    }

    pub fn cache_dir(&self, paths: &PathsConfig) -> PathBuf {
        paths.branch_cache_dir(&self.name)
    }
}

// Branch identity is the name, case-insensitively: "Beta" and "beta" share
// one cache directory and must never be treated as two channels.
impl PartialEq for Branch {
    fn eq(&self, other: &Self) -> bool {
        self.name.eq_ignore_ascii_case(&other.name)
    }
}

impl Eq for Branch {}

impl Hash for Branch {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.to_ascii_lowercase().hash(state);
    }
}

/// One configured game-server instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    /// Stable identity; doubles as the store file name.
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub install_directory: PathBuf,
    #[serde(default)]
    pub map: String,
    #[serde(default)]
    pub branch: Branch,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub query_port: u16,
    #[serde(default)]
    pub control_port: u16,
    #[serde(default)]
    pub control_password: Option<String>,
    #[serde(default)]
    pub control_enabled: bool,
    #[serde(default)]
    pub mod_ids: Vec<String>,
    #[serde(default = "default_true")]
    pub enable_auto_backup: bool,
    #[serde(default = "default_true")]
    pub enable_auto_update: bool,
    #[serde(default = "default_true")]
    pub enable_auto_shutdown: bool,
    /// Restart the server after a shutdown even when it was not running.
    #[serde(default)]
    pub restart_if_shutdown: bool,
    #[serde(default = "default_true")]
    pub check_for_online_players: bool,
    /// Server types without a world save opt out of the save step.
    #[serde(default)]
    pub world_save_opt_out: bool,
    #[serde(default)]
    pub shutdown_grace_minutes: Option<u32>,
    #[serde(default)]
    pub last_started: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_installed_version: Option<String>,
    /// Dirty flag: set when a run mutates persisted fields. Never stored.
    #[serde(skip)]
    pub updated: bool,
}

impl Profile {
    pub fn server_executable(&self, paths: &PathsConfig) -> PathBuf {
        self.install_directory.join(&paths.server_executable)
    }

    pub fn launcher_executable(&self, paths: &PathsConfig) -> PathBuf {
        self.install_directory.join(&paths.launcher_executable)
    }

    pub fn config_dir(&self, paths: &PathsConfig) -> PathBuf {
        self.install_directory.join(&paths.config_subdirectory)
    }

    pub fn save_dir(&self, paths: &PathsConfig) -> PathBuf {
        self.install_directory.join(&paths.save_subdirectory)
    }

    pub fn mods_dir(&self, paths: &PathsConfig) -> PathBuf {
        self.install_directory.join(&paths.mods_subdirectory)
    }

    pub fn world_file(&self, paths: &PathsConfig) -> PathBuf {
        self.save_dir(paths)
            .join(format!("{}{}", self.map, paths.world_extension))
    }

    pub fn world_temp_file(&self, paths: &PathsConfig) -> PathBuf {
        self.save_dir(paths)
            .join(format!("{}{}", self.map, paths.world_temp_extension))
    }

    /// Record the start time and mark the profile dirty.
    pub fn record_started(&mut self, at: DateTime<Utc>) {
        self.last_started = Some(at);
        self.updated = true;
    }

    /// Record the installed server version and mark the profile dirty.
    pub fn record_installed_version(&mut self, version: impl Into<String>) {
        self.last_installed_version = Some(version.into());
        self.updated = true;
    }

    fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(EngineError::BadProfile("empty profile id".to_owned()));
        }
        if self.install_directory.as_os_str().is_empty() {
            return Err(EngineError::BadProfile(format!(
                "profile '{}' has no install directory",
                self.id
            )));
        }
        if self.branch.name.trim().is_empty() {
            return Err(EngineError::BadProfile(format!(
                "profile '{}' has no branch",
                self.id
            )));
        }
        Ok(())
    }
}

/// Directory-of-TOML store of profile records.
#[derive(Debug, Clone)]
pub struct FleetStore {
    root: PathBuf,
}

impl FleetStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Snapshot every profile record in the store.
    ///
    /// Unreadable records are skipped with a warning rather than failing the
    /// whole snapshot; a run over the rest of the fleet is worth more than a
    /// hard stop on one corrupt file.
    pub fn snapshot(&self) -> Result<Vec<Profile>> {
        if !self.root.is_dir() {
            return Err(EngineError::InvalidDataDirectory(self.root.clone()));
        }
        let mut profiles = Vec::new();
        let mut entries: Vec<_> = fs::read_dir(&self.root)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "toml"))
            .collect();
        entries.sort();
        for path in entries {
            match Self::load_file(&path) {
                Ok(profile) => profiles.push(profile),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "skipping unreadable profile record");
                }
            }
        }
        debug!(count = profiles.len(), root = %self.root.display(), "fleet snapshot loaded");
        Ok(profiles)
    }

    /// Look up one profile by id.
    pub fn load(&self, id: &str) -> Result<Profile> {
        let path = self.profile_path(id);
        if !path.is_file() {
            return Err(EngineError::ProfileNotFound(id.to_owned()));
        }
        Self::load_file(&path)
    }

    /// Write a profile record back, atomically via a temp rename.
    pub fn save(&self, profile: &Profile) -> Result<()> {
        profile.validate()?;
        fs::create_dir_all(&self.root)?;
        let path = self.profile_path(&profile.id);
        let rendered = toml::to_string_pretty(profile)
            .map_err(|err| EngineError::Store(err.to_string()))?;
        let tmp = path.with_extension("toml.tmp");
        fs::write(&tmp, rendered)?;
        fs::rename(&tmp, &path)?;
        debug!(profile = %profile.id, path = %path.display(), "profile record saved");
        Ok(())
    }

    fn profile_path(&self, id: &str) -> PathBuf {
        self.root.join(format!("{id}.toml"))
    }

    fn load_file(path: &Path) -> Result<Profile> {
        let raw = fs::read_to_string(path)?;
        let profile: Profile =
            toml::from_str(&raw).map_err(|err| EngineError::Store(err.to_string()))?;
        profile.validate()?;
        Ok(profile)
    }
}
