//! ---
//! sfm_section: "02-fleet-engine"
//! sfm_subsection: "module"
//! sfm_type: "source"
//! sfm_scope: "code"
//! sfm_description: "Fleet orchestration engine: locks, shutdown, updates, backup, scheduling."
//! sfm_version: "v0.0.0-prealpha"
//! sfm_owner: "tbd"
//! ---
//! Update pipeline: cache refresh and distribution.
//!
//! Downloads go to shared per-branch and per-mod caches; installs then pull
//! from a cache, gated by version markers. A cache is only distributed when
//! it is strictly newer than the installed side or the installed side is
//! unversioned, so re-running the pipeline is idempotent.

use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use g_sfm_common::config::GlobalConfig;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::copy::{copy_tree, copy_tree_excluding};
use crate::depot::DepotRunner;
use crate::error::{EngineError, Result};
use crate::ledger::{
    build_is_stale, mod_is_stale, mod_marker_is_unversioned, read_build_marker, read_mod_marker,
    write_build_marker, write_mod_marker, BUILD_MARKER_FILE, MOD_MARKER_FILE,
};
use crate::lock::{self, LockAcquisition};
use crate::modmeta::ModMetadataStatus;
use crate::profile::{Branch, Profile};

/// Longest list of mod titles spelled out in a composed update reason.
const REASON_MOD_LIMIT: usize = 5;

/// Outcome of distributing one profile's mods.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ModDistribution {
    pub updated: Vec<String>,
    pub failed: Vec<String>,
}

impl ModDistribution {
    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Cache refresh and distribution steps, shared by fleet runs and single
/// profile commands.
pub struct UpdatePipeline<'a> {
    config: &'a GlobalConfig,
    runner: DepotRunner,
}

impl<'a> UpdatePipeline<'a> {
    pub fn new(config: &'a GlobalConfig) -> Self {
        Self {
            runner: DepotRunner::new(config.depot.clone()),
            config,
        }
    }

    pub fn runner(&self) -> &DepotRunner {
        &self.runner
    }

    /// Refresh the shared download cache of one release branch.
    ///
    /// On success the cache's build marker is advanced iff the tool reported
    /// download progress or the scan found files newer than the run start.
    /// Returns the cache's build stamp after the refresh.
    pub async fn refresh_branch_cache(
        &self,
        branch: &Branch,
        cancel: &CancellationToken,
    ) -> Result<DateTime<Utc>> {
        let depot = &self.config.depot;
        let updates = &self.config.updates;
        let cache_dir = self.config.paths.branch_cache_dir(&branch.name);
        fs::create_dir_all(&cache_dir)?;

        let args = DepotRunner::render_args(
            &depot.server_install_args,
            &[
                ("{cache_dir}", &cache_dir.to_string_lossy()),
                ("{branch}", &branch.name),
                (
                    "{branch_password}",
                    branch.password.as_deref().unwrap_or(""),
                ),
                ("{validate}", if updates.validate { " validate" } else { "" }),
            ],
        );

        let run_started = Utc::now();
        let run = self
            .runner
            .run_with_retry(
                &args,
                &cache_dir,
                &depot.server_success_sentinel,
                updates.effective_retries(),
                updates.retry_delay,
                cancel,
            )
            .await?;

        let marker = cache_dir.join(BUILD_MARKER_FILE);
        if run.downloaded || self.cache_has_newer_files(&cache_dir, run_started) {
            // The marker carries the refresh's start time, never a later
            // wall-clock read, so it stays below every downloaded mtime.
            write_build_marker(&marker, run_started)?;
            info!(branch = %branch.name, "branch cache holds a new build");
        } else {
            debug!(branch = %branch.name, "branch cache already current");
        }
        Ok(read_build_marker(&marker))
    }

    /// Any regular file in the cache modified at or after `since`, outside
    /// the tool's bookkeeping subtree, means a new build landed.
    fn cache_has_newer_files(&self, cache_dir: &Path, since: DateTime<Utc>) -> bool {
        let exclude = cache_dir.join(&self.config.depot.scan_exclude);
        WalkDir::new(cache_dir)
            .into_iter()
            .filter_entry(|entry| entry.path() != exclude)
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .filter(|entry| entry.file_name().to_str() != Some(BUILD_MARKER_FILE))
            .any(|entry| {
                entry
                    .metadata()
                    .ok()
                    .and_then(|meta| meta.modified().ok())
                    .map(DateTime::<Utc>::from)
                    .is_some_and(|mtime| mtime >= since)
            })
    }

    /// Refresh the shared cache of one mod, honoring the force rules.
    ///
    /// Skip is only legal when nothing forces a download, the remote update
    /// time is known and the cache marker already covers it. Returns the
    /// cache's marker value after the refresh.
    pub async fn refresh_mod_cache(
        &self,
        mod_id: &str,
        status: &ModMetadataStatus,
        cancel: &CancellationToken,
    ) -> Result<i64> {
        let depot = &self.config.depot;
        let updates = &self.config.updates;
        let cache_dir = self.config.paths.mod_cache_dir(mod_id);
        fs::create_dir_all(&cache_dir)?;

        let marker = cache_dir.join(MOD_MARKER_FILE);
        let cached = read_mod_marker(&marker);
        let latest = status.time_updated();

        let metadata_missing = matches!(
            status,
            ModMetadataStatus::Private | ModMetadataStatus::Unavailable
        );
        let forced = updates.force_update_mods
            || (metadata_missing && updates.force_update_mods_if_no_metadata)
            || mod_marker_is_unversioned(cached);
        if !forced {
            if let Some(latest) = latest {
                if cached >= latest {
                    debug!(mod_id, cached, latest, "mod cache already current");
                    return Ok(cached);
                }
            }
        }

        let args = DepotRunner::render_args(
            &depot.mod_install_args,
            &[
                ("{cache_dir}", &cache_dir.to_string_lossy()),
                ("{mod_id}", mod_id),
            ],
        );
        self.runner
            .run_with_retry(
                &args,
                &cache_dir,
                &depot.mod_success_sentinel,
                updates.effective_retries(),
                updates.retry_delay,
                cancel,
            )
            .await?;

        let value = latest
            .or_else(|| self.mod_metadata_mtime(&cache_dir))
            .unwrap_or_else(|| Utc::now().timestamp());
        write_mod_marker(&marker, value)?;
        info!(mod_id, marker = value, "mod cache refreshed");
        Ok(value)
    }

    /// Marker fallback: the tool's own metadata file mtime, when present.
    fn mod_metadata_mtime(&self, cache_dir: &Path) -> Option<i64> {
        fs::metadata(cache_dir.join(&self.config.depot.mod_metadata_file))
            .ok()
            .and_then(|meta| meta.modified().ok())
            .map(|mtime| DateTime::<Utc>::from(mtime).timestamp())
    }

    /// True when the branch cache holds a build the profile does not.
    pub fn server_update_pending(&self, profile: &Profile) -> bool {
        let cache = self
            .config
            .paths
            .branch_cache_dir(&profile.branch.name)
            .join(BUILD_MARKER_FILE);
        let installed = profile.install_directory.join(BUILD_MARKER_FILE);
        build_is_stale(read_build_marker(&cache), read_build_marker(&installed))
    }

    /// Mod ids whose cache is newer than the profile's installed copy.
    pub fn mods_update_pending(&self, profile: &Profile) -> Vec<String> {
        profile
            .mod_ids
            .iter()
            .filter(|mod_id| {
                let cache = self
                    .config
                    .paths
                    .mod_cache_dir(mod_id)
                    .join(MOD_MARKER_FILE);
                let installed = profile
                    .mods_dir(&self.config.paths)
                    .join(mod_id.as_str())
                    .join(MOD_MARKER_FILE);
                self.config.updates.force_copy_mods
                    || mod_is_stale(read_mod_marker(&cache), read_mod_marker(&installed))
            })
            .cloned()
            .collect()
    }

    /// Distribute the branch cache into a profile's install directory.
    ///
    /// No-op when the install is already at the cache's build. Returns true
    /// when files were distributed.
    pub async fn distribute_server(&self, profile: &mut Profile) -> Result<bool> {
        let updates = &self.config.updates;
        let cache_dir = self.config.paths.branch_cache_dir(&profile.branch.name);
        if !cache_dir.is_dir() {
            return Err(EngineError::CacheNotFound(cache_dir));
        }
        let cache_stamp = read_build_marker(&cache_dir.join(BUILD_MARKER_FILE));
        let install_marker = profile.install_directory.join(BUILD_MARKER_FILE);
        if !build_is_stale(cache_stamp, read_build_marker(&install_marker)) {
            debug!(profile = %profile.id, "server install already current");
            return Ok(false);
        }

        let exclude_dir = self.config.depot.scan_exclude.to_string_lossy();
        let stats = copy_tree_excluding(
            &cache_dir,
            &profile.install_directory,
            &[exclude_dir.as_ref(), BUILD_MARKER_FILE],
            updates.smart_copy,
            updates.copy_retries,
            updates.copy_retry_delay,
        )
        .await?;
        write_build_marker(&install_marker, cache_stamp)?;
        profile.record_installed_version(cache_stamp.to_rfc3339());
        info!(
            profile = %profile.id,
            copied = stats.copied,
            skipped = stats.skipped,
            build = %cache_stamp,
            "server build distributed"
        );
        Ok(true)
    }

    /// Distribute cached mods into a profile. Per-mod failures are
    /// collected, not fatal: one broken mod must not block the rest.
    ///
    /// Each copy runs under the same per-mod lock the cache refresh takes,
    /// so a pull never reads a cache mid-write.
    pub async fn distribute_mods(
        &self,
        profile: &Profile,
        cancel: &CancellationToken,
    ) -> ModDistribution {
        let updates = &self.config.updates;
        let mods_dir = profile.mods_dir(&self.config.paths);
        let mut distribution = ModDistribution::default();
        for mod_id in &profile.mod_ids {
            let cache_dir = self.config.paths.mod_cache_dir(mod_id);
            let cache_marker = read_mod_marker(&cache_dir.join(MOD_MARKER_FILE));
            let dest = mods_dir.join(mod_id.as_str());
            let installed = read_mod_marker(&dest.join(MOD_MARKER_FILE));
            if !updates.force_copy_mods && !mod_is_stale(cache_marker, installed) {
                debug!(profile = %profile.id, mod_id, "mod already current");
                continue;
            }
            if !cache_dir.is_dir() {
                warn!(profile = %profile.id, mod_id, "mod cache missing, mod skipped");
                distribution.failed.push(mod_id.clone());
                continue;
            }
            let _guard = match lock::acquire(
                &self.config.paths.lock_directory,
                &cache_dir,
                self.config.locks.timeout,
                self.config.locks.attempt_delay,
                cancel,
            )
            .await
            {
                Ok(LockAcquisition::Acquired(guard)) => guard,
                Ok(LockAcquisition::Busy) => {
                    warn!(profile = %profile.id, mod_id, "mod cache lock busy, mod skipped");
                    distribution.failed.push(mod_id.clone());
                    continue;
                }
                Err(err) => {
                    warn!(profile = %profile.id, mod_id, error = %err, "mod cache lock failed");
                    distribution.failed.push(mod_id.clone());
                    continue;
                }
            };
            // the marker may have advanced while we waited on the lock
            let cache_marker = read_mod_marker(&cache_dir.join(MOD_MARKER_FILE));
            let copied = copy_tree(
                &cache_dir,
                &dest,
                updates.smart_copy,
                updates.copy_retries,
                updates.copy_retry_delay,
            )
            .await
            .and_then(|_| write_mod_marker(&dest.join(MOD_MARKER_FILE), cache_marker));
            match copied {
                Ok(()) => {
                    info!(profile = %profile.id, mod_id, marker = cache_marker, "mod distributed");
                    distribution.updated.push(mod_id.clone());
                }
                Err(err) => {
                    warn!(profile = %profile.id, mod_id, error = %err, "mod distribution failed");
                    distribution.failed.push(mod_id.clone());
                }
            }
        }
        distribution
    }
}

/// Human-readable summary of what an update run is about to change,
/// appended to shutdown countdown messages.
pub fn compose_update_reason(server_updated: bool, mod_titles: &[String]) -> Option<String> {
    let mut parts = Vec::new();
    if server_updated {
        parts.push("server update".to_owned());
    }
    for title in mod_titles.iter().take(REASON_MOD_LIMIT) {
        parts.push(title.clone());
    }
    if mod_titles.len() > REASON_MOD_LIMIT {
        parts.push("…".to_owned());
    }
    if parts.is_empty() {
        None
    } else {
        Some(format!("Updates: {}", parts.join(", ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use g_sfm_common::time;
    use tempfile::tempdir;

    fn config_at(root: &Path) -> GlobalConfig {
        let mut config = GlobalConfig::default();
        config.paths.data_directory = root.join("data");
        config.paths.cache_directory = root.join("cache");
        config.paths.lock_directory = root.join("locks");
        config.locks.timeout = std::time::Duration::from_millis(30);
        config.locks.attempt_delay = std::time::Duration::from_millis(5);
        config
    }

    fn profile_at(root: &Path) -> Profile {
        Profile {
            id: "alpha".to_owned(),
            name: "Alpha".to_owned(),
            install_directory: root.join("servers/alpha"),
            map: "island".to_owned(),
            branch: Branch::new("public"),
            ip: None,
            query_port: 0,
            control_port: 0,
            control_password: None,
            control_enabled: false,
            mod_ids: vec!["111".to_owned()],
            enable_auto_backup: true,
            enable_auto_update: true,
            enable_auto_shutdown: true,
            restart_if_shutdown: false,
            check_for_online_players: false,
            world_save_opt_out: false,
            shutdown_grace_minutes: None,
            last_started: None,
            last_installed_version: None,
            updated: false,
        }
    }

    #[tokio::test]
    async fn distribution_is_gated_by_the_build_marker() {
        let dir = tempdir().unwrap();
        let config = config_at(dir.path());
        let mut profile = profile_at(dir.path());
        let cache = config.paths.branch_cache_dir("public");
        std::fs::create_dir_all(cache.join("bin")).unwrap();
        std::fs::write(cache.join("bin/server"), "build-1").unwrap();
        let stamp = Utc::now();
        write_build_marker(&cache.join(BUILD_MARKER_FILE), stamp).unwrap();

        let pipeline = UpdatePipeline::new(&config);
        assert!(pipeline.server_update_pending(&profile));
        assert!(pipeline.distribute_server(&mut profile).await.unwrap());
        assert_eq!(
            std::fs::read_to_string(profile.install_directory.join("bin/server")).unwrap(),
            "build-1"
        );
        assert!(profile.updated);

        // same build again: the gate closes
        assert!(!pipeline.server_update_pending(&profile));
        assert!(!pipeline.distribute_server(&mut profile).await.unwrap());
    }

    #[tokio::test]
    async fn bookkeeping_subtree_is_not_distributed() {
        let dir = tempdir().unwrap();
        let config = config_at(dir.path());
        let mut profile = profile_at(dir.path());
        let cache = config.paths.branch_cache_dir("public");
        std::fs::create_dir_all(cache.join("steamapps")).unwrap();
        std::fs::write(cache.join("steamapps/appmanifest.acf"), "state").unwrap();
        std::fs::write(cache.join("server"), "build").unwrap();
        write_build_marker(&cache.join(BUILD_MARKER_FILE), Utc::now()).unwrap();

        let pipeline = UpdatePipeline::new(&config);
        pipeline.distribute_server(&mut profile).await.unwrap();
        assert!(profile.install_directory.join("server").is_file());
        assert!(!profile.install_directory.join("steamapps").exists());
    }

    #[tokio::test]
    async fn unversioned_install_forces_distribution() {
        let dir = tempdir().unwrap();
        let config = config_at(dir.path());
        let profile = profile_at(dir.path());
        let cache = config.paths.branch_cache_dir("public");
        std::fs::create_dir_all(&cache).unwrap();
        // cache marker present but unversioned: still stale vs unversioned install
        write_build_marker(&cache.join(BUILD_MARKER_FILE), time::unversioned()).unwrap();

        let pipeline = UpdatePipeline::new(&config);
        assert!(pipeline.server_update_pending(&profile));
    }

    #[tokio::test]
    async fn stale_mod_is_listed_and_distributed() {
        let dir = tempdir().unwrap();
        let config = config_at(dir.path());
        let profile = profile_at(dir.path());
        let cache = config.paths.mod_cache_dir("111");
        std::fs::create_dir_all(&cache).unwrap();
        std::fs::write(cache.join("mod.pak"), "content").unwrap();
        write_mod_marker(&cache.join(MOD_MARKER_FILE), 1_700_000_000).unwrap();

        let pipeline = UpdatePipeline::new(&config);
        assert_eq!(pipeline.mods_update_pending(&profile), vec!["111"]);

        let distribution = pipeline
            .distribute_mods(&profile, &CancellationToken::new())
            .await;
        assert_eq!(distribution.updated, vec!["111"]);
        assert!(distribution.all_succeeded());
        let dest = profile.mods_dir(&config.paths).join("111");
        assert!(dest.join("mod.pak").is_file());
        assert_eq!(read_mod_marker(&dest.join(MOD_MARKER_FILE)), 1_700_000_000);
        assert!(pipeline.mods_update_pending(&profile).is_empty());
    }

    #[tokio::test]
    async fn missing_mod_cache_fails_only_that_mod() {
        let dir = tempdir().unwrap();
        let config = config_at(dir.path());
        let mut profile = profile_at(dir.path());
        profile.mod_ids.push("222".to_owned());
        let cache = config.paths.mod_cache_dir("222");
        std::fs::create_dir_all(&cache).unwrap();
        std::fs::write(cache.join("mod.pak"), "content").unwrap();
        write_mod_marker(&cache.join(MOD_MARKER_FILE), 42).unwrap();

        let pipeline = UpdatePipeline::new(&config);
        let distribution = pipeline
            .distribute_mods(&profile, &CancellationToken::new())
            .await;
        assert_eq!(distribution.updated, vec!["222"]);
        assert_eq!(distribution.failed, vec!["111"]);
    }

    #[tokio::test]
    async fn held_mod_cache_lock_fails_only_that_mod() {
        let dir = tempdir().unwrap();
        let config = config_at(dir.path());
        let profile = profile_at(dir.path());
        let cache = config.paths.mod_cache_dir("111");
        std::fs::create_dir_all(&cache).unwrap();
        std::fs::write(cache.join("mod.pak"), "content").unwrap();
        write_mod_marker(&cache.join(MOD_MARKER_FILE), 1_700_000_000).unwrap();

        let cancel = CancellationToken::new();
        let held = lock::acquire(
            &config.paths.lock_directory,
            &cache,
            config.locks.timeout,
            config.locks.attempt_delay,
            &cancel,
        )
        .await
        .unwrap();
        assert!(!held.is_busy());

        let pipeline = UpdatePipeline::new(&config);
        let distribution = pipeline.distribute_mods(&profile, &cancel).await;
        assert_eq!(distribution.failed, vec!["111"]);
        assert!(distribution.updated.is_empty());

        drop(held);
        let distribution = pipeline.distribute_mods(&profile, &cancel).await;
        assert_eq!(distribution.updated, vec!["111"]);
    }

    #[test]
    fn update_reason_caps_the_mod_list() {
        assert_eq!(compose_update_reason(false, &[]), None);
        assert_eq!(
            compose_update_reason(true, &[]).unwrap(),
            "Updates: server update"
        );
        let titles: Vec<String> = (1..=7).map(|n| format!("Mod {n}")).collect();
        let reason = compose_update_reason(true, &titles).unwrap();
        assert!(reason.contains("Mod 5"));
        assert!(!reason.contains("Mod 6"));
        assert!(reason.ends_with('…'));
    }
}
