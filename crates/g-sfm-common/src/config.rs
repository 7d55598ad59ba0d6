//! ---
//! sfm_section: "01-shared-runtime"
//! sfm_subsection: "module"
//! sfm_type: "source"
//! sfm_scope: "code"
//! sfm_description: "Shared primitives and utilities for the fleet manager."
//! sfm_version: "v0.0.0-prealpha"
//! sfm_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};
use tracing::debug;

use crate::logging::LogFormat;

fn default_data_directory() -> PathBuf {
    PathBuf::from("data")
}

fn default_cache_directory() -> PathBuf {
    PathBuf::from("cache")
}

fn default_lock_directory() -> PathBuf {
    PathBuf::from("locks")
}

fn default_backup_directory() -> PathBuf {
    PathBuf::from("data/backups")
}

fn default_server_executable() -> PathBuf {
    PathBuf::from("bin/gameserver")
}

fn default_launcher_executable() -> PathBuf {
    PathBuf::from("bin/launcher")
}

fn default_config_subdirectory() -> PathBuf {
    PathBuf::from("config")
}

fn default_save_subdirectory() -> PathBuf {
    PathBuf::from("saved")
}

fn default_mods_subdirectory() -> PathBuf {
    PathBuf::from("mods")
}

fn default_world_extension() -> String {
    ".world".to_owned()
}

fn default_world_temp_extension() -> String {
    ".world.tmp".to_owned()
}

fn default_world_companion_extensions() -> Vec<String> {
    vec![".player".to_owned(), ".tribe".to_owned(), ".tribute".to_owned()]
}

fn default_lock_timeout() -> Duration {
    // 5 minutes, matching the original mutex wait
    Duration::from_secs(300)
}

fn default_lock_attempt_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_max_retries() -> u32 {
    10
}

fn default_retry_on_fail() -> bool {
    true
}

fn default_retry_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_sequential_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_copy_retries() -> u32 {
    3
}

fn default_copy_retry_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_smart_copy() -> bool {
    true
}

fn default_restart_grace() -> Duration {
    Duration::from_secs(15 * 60)
}

fn default_grace_minutes() -> u32 {
    10
}

fn default_countdown_tick() -> Duration {
    Duration::from_secs(60)
}

fn default_send_message_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_enable_world_save() -> bool {
    true
}

fn default_world_save_delay() -> Duration {
    Duration::from_secs(15)
}

fn default_use_shutdown_command() -> bool {
    true
}

fn default_shutdown_command() -> String {
    "DoExit".to_owned()
}

fn default_save_command() -> String {
    "SaveWorld".to_owned()
}

fn default_broadcast_template() -> String {
    "Broadcast {message}".to_owned()
}

fn default_command_settle_delay() -> Duration {
    Duration::from_secs(10)
}

fn default_step_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_grace_message() -> String {
    "This server will shut down in {minutes} minutes.".to_owned()
}

fn default_final_grace_message() -> String {
    "This server will shut down in 1 minute. Please log out now.".to_owned()
}

fn default_world_save_message() -> String {
    "Saving the world before shutdown.".to_owned()
}

fn default_cancel_message() -> String {
    "The server shutdown has been cancelled.".to_owned()
}

fn default_stopping_message() -> String {
    "The server is shutting down now.".to_owned()
}

fn default_delete_interval_days() -> u32 {
    7
}

fn default_tool_path() -> PathBuf {
    PathBuf::from("tools/steamcmd/steamcmd.sh")
}

fn default_capture_output() -> bool {
    true
}

fn default_server_sentinel() -> String {
    "Success!".to_owned()
}

fn default_mod_sentinel() -> String {
    "Success.".to_owned()
}

fn default_progress_sentinel() -> String {
    "downloading,".to_owned()
}

fn default_server_args() -> String {
    "+force_install_dir {cache_dir} +login anonymous +app_update {branch}{validate} +quit".to_owned()
}

fn default_mod_args() -> String {
    "+force_install_dir {cache_dir} +login anonymous +workshop_download_item {mod_id} +quit".to_owned()
}

fn default_scan_exclude() -> PathBuf {
    PathBuf::from("steamapps")
}

fn default_mod_metadata_file() -> PathBuf {
    PathBuf::from("appworkshop.acf")
}

fn default_alerts_enabled() -> bool {
    true
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

/// Primary configuration object for the fleet manager.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalConfig {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub locks: LockSettings,
    #[serde(default)]
    pub updates: UpdateSettings,
    #[serde(default)]
    pub shutdown: ShutdownSettings,
    #[serde(default)]
    pub backup: BackupSettings,
    #[serde(default)]
    pub depot: DepotSettings,
    #[serde(default)]
    pub notify: NotifySettings,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Metadata describing where a [`GlobalConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedGlobalConfig {
    pub config: GlobalConfig,
    pub source: PathBuf,
}

impl GlobalConfig {
    pub const ENV_CONFIG_PATH: &'static str = "G_SFM_CONFIG";

    /// Load configuration from disk, respecting the `G_SFM_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedGlobalConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(path.clone())?;
                return Ok(LoadedGlobalConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(path.clone())?;
                return Ok(LoadedGlobalConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    fn from_path(path: PathBuf) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<GlobalConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        if self.updates.max_retries == 0 {
            return Err(anyhow!("updates.max_retries must be at least 1"));
        }
        if self.updates.copy_retries == 0 {
            return Err(anyhow!("updates.copy_retries must be at least 1"));
        }
        if self.depot.tool_path.as_os_str().is_empty() {
            return Err(anyhow!("depot.tool_path must not be empty"));
        }
        if self.locks.timeout.is_zero() || self.locks.attempt_delay.is_zero() {
            return Err(anyhow!("lock timeout and attempt delay must be non-zero"));
        }
        if self.shutdown.tick.is_zero() {
            return Err(anyhow!("shutdown.tick must be non-zero"));
        }
        Ok(())
    }
}

impl std::str::FromStr for GlobalConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: GlobalConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Filesystem layout shared by every profile and branch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "default_data_directory")]
    pub data_directory: PathBuf,
    #[serde(default = "default_cache_directory")]
    pub cache_directory: PathBuf,
    #[serde(default = "default_lock_directory")]
    pub lock_directory: PathBuf,
    #[serde(default = "default_backup_directory")]
    pub backup_directory: PathBuf,
    /// Server executable, relative to a profile's install directory.
    #[serde(default = "default_server_executable")]
    pub server_executable: PathBuf,
    /// Launcher executable, relative to a profile's install directory.
    #[serde(default = "default_launcher_executable")]
    pub launcher_executable: PathBuf,
    #[serde(default = "default_config_subdirectory")]
    pub config_subdirectory: PathBuf,
    #[serde(default = "default_save_subdirectory")]
    pub save_subdirectory: PathBuf,
    /// Where distributed mods land inside a profile's install directory.
    #[serde(default = "default_mods_subdirectory")]
    pub mods_subdirectory: PathBuf,
    #[serde(default = "default_world_extension")]
    pub world_extension: String,
    #[serde(default = "default_world_temp_extension")]
    pub world_temp_extension: String,
    /// Extensions of per-player files archived next to the world save.
    #[serde(default = "default_world_companion_extensions")]
    pub world_companion_extensions: Vec<String>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_directory: default_data_directory(),
            cache_directory: default_cache_directory(),
            lock_directory: default_lock_directory(),
            backup_directory: default_backup_directory(),
            server_executable: default_server_executable(),
            launcher_executable: default_launcher_executable(),
            config_subdirectory: default_config_subdirectory(),
            save_subdirectory: default_save_subdirectory(),
            mods_subdirectory: default_mods_subdirectory(),
            world_extension: default_world_extension(),
            world_temp_extension: default_world_temp_extension(),
            world_companion_extensions: default_world_companion_extensions(),
        }
    }
}

impl PathsConfig {
    /// Shared download cache for one release branch.
    pub fn branch_cache_dir(&self, branch: &str) -> PathBuf {
        self.cache_directory.join(branch.to_lowercase())
    }

    /// Shared download cache for one mod.
    pub fn mod_cache_dir(&self, mod_id: &str) -> PathBuf {
        self.cache_directory.join("mods").join(mod_id)
    }

    pub fn profiles_dir(&self) -> PathBuf {
        self.data_directory.join("profiles")
    }
}

/// Cross-process lock acquisition tuning.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockSettings {
    #[serde(default = "default_lock_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub timeout: Duration,
    #[serde(default = "default_lock_attempt_delay")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub attempt_delay: Duration,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            timeout: default_lock_timeout(),
            attempt_delay: default_lock_attempt_delay(),
        }
    }
}

/// Update pipeline and fleet scheduler tuning.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateSettings {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_on_fail")]
    pub retry_on_fail: bool,
    #[serde(default = "default_retry_delay")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub retry_delay: Duration,
    /// Run profiles of a branch one at a time instead of concurrently.
    #[serde(default)]
    pub update_sequentially: bool,
    #[serde(default = "default_sequential_delay")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub sequential_delay: Duration,
    /// Pass the package tool's validation flag on cache refresh.
    #[serde(default)]
    pub validate: bool,
    /// Leave servers stopped after an update; never start a stopped one.
    #[serde(default)]
    pub override_server_startup: bool,
    #[serde(default)]
    pub force_update_mods: bool,
    #[serde(default)]
    pub force_update_mods_if_no_metadata: bool,
    #[serde(default)]
    pub force_copy_mods: bool,
    #[serde(default = "default_smart_copy")]
    pub smart_copy: bool,
    #[serde(default = "default_copy_retries")]
    pub copy_retries: u32,
    #[serde(default = "default_copy_retry_delay")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub copy_retry_delay: Duration,
    /// A profile started more recently than this is skipped by shutdown runs.
    #[serde(default = "default_restart_grace")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub restart_grace: Duration,
}

impl Default for UpdateSettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_on_fail: default_retry_on_fail(),
            retry_delay: default_retry_delay(),
            update_sequentially: false,
            sequential_delay: default_sequential_delay(),
            validate: false,
            override_server_startup: false,
            force_update_mods: false,
            force_update_mods_if_no_metadata: false,
            force_copy_mods: false,
            smart_copy: default_smart_copy(),
            copy_retries: default_copy_retries(),
            copy_retry_delay: default_copy_retry_delay(),
            restart_grace: default_restart_grace(),
        }
    }
}

impl UpdateSettings {
    /// Download attempts for one cache refresh: 1 when retry is disabled.
    pub fn effective_retries(&self) -> u32 {
        if self.retry_on_fail {
            self.max_retries.max(1)
        } else {
            1
        }
    }
}

/// Shutdown sequencer tuning and message bodies.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownSettings {
    #[serde(default = "default_grace_minutes")]
    pub grace_minutes: u32,
    /// Countdown tick length. Production keeps 60s; tests shrink it.
    #[serde(default = "default_countdown_tick")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub tick: Duration,
    /// Time budgeted for a broadcast, subtracted from the tick sleep.
    #[serde(default = "default_send_message_delay")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub send_message_delay: Duration,
    #[serde(default = "default_enable_world_save")]
    pub enable_world_save: bool,
    #[serde(default = "default_world_save_delay")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub world_save_delay: Duration,
    /// Append the shutdown reason to every message instead of sending it once.
    #[serde(default)]
    pub all_messages_show_reason: bool,
    #[serde(default = "default_use_shutdown_command")]
    pub use_shutdown_command: bool,
    #[serde(default = "default_shutdown_command")]
    pub shutdown_command: String,
    #[serde(default = "default_save_command")]
    pub save_command: String,
    #[serde(default = "default_broadcast_template")]
    pub broadcast_template: String,
    /// Wait after a graceful shutdown command before watching for exit.
    #[serde(default = "default_command_settle_delay")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub command_settle_delay: Duration,
    /// Per-step wait bound in the termination escalation ladder.
    #[serde(default = "default_step_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub step_timeout: Duration,
    #[serde(default)]
    pub messages: ShutdownMessages,
}

impl Default for ShutdownSettings {
    fn default() -> Self {
        Self {
            grace_minutes: default_grace_minutes(),
            tick: default_countdown_tick(),
            send_message_delay: default_send_message_delay(),
            enable_world_save: default_enable_world_save(),
            world_save_delay: default_world_save_delay(),
            all_messages_show_reason: false,
            use_shutdown_command: default_use_shutdown_command(),
            shutdown_command: default_shutdown_command(),
            save_command: default_save_command(),
            broadcast_template: default_broadcast_template(),
            command_settle_delay: default_command_settle_delay(),
            step_timeout: default_step_timeout(),
            messages: ShutdownMessages::default(),
        }
    }
}

/// Broadcast bodies. Localized catalogs live outside the engine; these are
/// the headless defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownMessages {
    #[serde(default = "default_grace_message")]
    pub grace: String,
    #[serde(default = "default_final_grace_message")]
    pub final_grace: String,
    #[serde(default = "default_world_save_message")]
    pub world_save: String,
    #[serde(default = "default_cancel_message")]
    pub cancel: String,
    #[serde(default = "default_stopping_message")]
    pub stopping: String,
}

impl Default for ShutdownMessages {
    fn default() -> Self {
        Self {
            grace: default_grace_message(),
            final_grace: default_final_grace_message(),
            world_save: default_world_save_message(),
            cancel: default_cancel_message(),
            stopping: default_stopping_message(),
        }
    }
}

/// Backup engine tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupSettings {
    /// Archives of the same category older than this are pruned.
    #[serde(default = "default_delete_interval_days")]
    pub delete_interval_days: u32,
    #[serde(default)]
    pub sequential: bool,
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            delete_interval_days: default_delete_interval_days(),
            sequential: false,
        }
    }
}

/// External package tool invocation and output classification.
///
/// The sentinel strings are load-bearing: the tool's exit code alone is not
/// proof of success, so a captured run is only successful when the sentinel
/// appeared on stdout. They are configuration, with the tool's documented
/// literals as defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepotSettings {
    #[serde(default = "default_tool_path")]
    pub tool_path: PathBuf,
    #[serde(default = "default_capture_output")]
    pub capture_output: bool,
    #[serde(default = "default_server_sentinel")]
    pub server_success_sentinel: String,
    #[serde(default = "default_mod_sentinel")]
    pub mod_success_sentinel: String,
    #[serde(default = "default_progress_sentinel")]
    pub progress_sentinel: String,
    /// Argument template for a branch cache refresh. Placeholders:
    /// `{cache_dir}`, `{branch}`, `{branch_password}`, `{validate}`.
    #[serde(default = "default_server_args")]
    pub server_install_args: String,
    /// Argument template for a mod download. Placeholders: `{cache_dir}`,
    /// `{mod_id}`.
    #[serde(default = "default_mod_args")]
    pub mod_install_args: String,
    /// Subtree the new-version scan ignores (tool bookkeeping churn).
    #[serde(default = "default_scan_exclude")]
    pub scan_exclude: PathBuf,
    /// Tool metadata file inside a mod cache, used as a marker fallback
    /// when the remote update time is unknown.
    #[serde(default = "default_mod_metadata_file")]
    pub mod_metadata_file: PathBuf,
}

impl Default for DepotSettings {
    fn default() -> Self {
        Self {
            tool_path: default_tool_path(),
            capture_output: default_capture_output(),
            server_success_sentinel: default_server_sentinel(),
            mod_success_sentinel: default_mod_sentinel(),
            progress_sentinel: default_progress_sentinel(),
            server_install_args: default_server_args(),
            mod_install_args: default_mod_args(),
            scan_exclude: default_scan_exclude(),
            mod_metadata_file: default_mod_metadata_file(),
        }
    }
}

/// Notification sink switches. Transports live behind the engine's seams.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifySettings {
    #[serde(default = "default_alerts_enabled")]
    pub alerts_enabled: bool,
    #[serde(default)]
    pub email_enabled: bool,
    #[serde(default)]
    pub email_to: Option<String>,
    #[serde(default)]
    pub email_from: Option<String>,
    #[serde(default)]
    pub attach_log: bool,
}

impl Default for NotifySettings {
    fn default() -> Self {
        Self {
            alerts_enabled: default_alerts_enabled(),
            email_enabled: false,
            email_to: None,
            email_from: None,
            attach_log: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config: GlobalConfig = "".parse().expect("defaults parse");
        assert_eq!(config.updates.max_retries, 10);
        assert_eq!(config.updates.effective_retries(), 10);
        assert_eq!(config.locks.timeout, Duration::from_secs(300));
        assert_eq!(config.depot.server_success_sentinel, "Success!");
        assert_eq!(config.depot.mod_success_sentinel, "Success.");
        assert_eq!(config.shutdown.grace_minutes, 10);
    }

    #[test]
    fn retry_disabled_collapses_to_single_attempt() {
        let config: GlobalConfig = "[updates]\nretry_on_fail = false\n"
            .parse()
            .expect("config parses");
        assert_eq!(config.updates.effective_retries(), 1);
    }

    #[test]
    fn zero_retries_rejected() {
        let result = "[updates]\nmax_retries = 0\n".parse::<GlobalConfig>();
        assert!(result.is_err());
    }

    #[test]
    fn durations_deserialize_from_seconds() {
        let config: GlobalConfig = "[shutdown]\ntick = 1\nworld_save_delay = 2\n"
            .parse()
            .expect("config parses");
        assert_eq!(config.shutdown.tick, Duration::from_secs(1));
        assert_eq!(config.shutdown.world_save_delay, Duration::from_secs(2));
    }

    #[test]
    fn branch_cache_dir_is_case_insensitive() {
        let paths = PathsConfig::default();
        assert_eq!(
            paths.branch_cache_dir("Beta"),
            paths.branch_cache_dir("beta")
        );
    }
}
