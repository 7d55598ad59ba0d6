//! ---
//! sfm_section: "02-fleet-engine"
//! sfm_subsection: "module"
//! sfm_type: "source"
//! sfm_scope: "code"
//! sfm_description: "Fleet orchestration engine: locks, shutdown, updates, backup, scheduling."
//! sfm_version: "v0.0.0-prealpha"
//! sfm_owner: "tbd"
//! ---
//! Backup engine: snapshot archives with age-based retention.
//!
//! Two independent archive categories per profile: a configuration
//! snapshot (profile record plus config files) and a world-data snapshot
//! (save file plus player files). Each archive embeds a manifest in the
//! zip comment. Retention pruning is best-effort; deletion failures are
//! logged and swallowed.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use g_sfm_common::config::GlobalConfig;
use g_sfm_common::time::archive_stamp;
use tracing::{debug, info, warn};
use walkdir::WalkDir;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::command::OperationKind;
use crate::error::{EngineError, Result};
use crate::profile::Profile;

/// Archive categories; retention prunes within one category only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupCategory {
    Config,
    World,
}

#[derive(Debug, Clone, Default)]
pub struct BackupReport {
    pub archives: Vec<PathBuf>,
}

pub struct BackupEngine<'a> {
    config: &'a GlobalConfig,
}

impl<'a> BackupEngine<'a> {
    pub fn new(config: &'a GlobalConfig) -> Self {
        Self { config }
    }

    /// Capture both archive categories for a profile, then prune old ones.
    pub fn backup_profile(
        &self,
        profile: &Profile,
        operation: OperationKind,
        run_started: DateTime<Utc>,
    ) -> Result<BackupReport> {
        let target_dir = self.config.paths.backup_directory.join(&profile.id);
        fs::create_dir_all(&target_dir)?;
        let stamp = archive_stamp(run_started);
        let manifest = self.manifest(profile, operation);

        let mut report = BackupReport::default();

        let config_archive = target_dir.join(format!("config_{stamp}.zip"));
        self.write_config_archive(profile, &config_archive, &manifest)?;
        report.archives.push(config_archive);
        self.prune(&target_dir, "config_");

        match self.write_world_archive(profile, &target_dir, &stamp, &manifest)? {
            Some(world_archive) => {
                report.archives.push(world_archive);
                self.prune(&target_dir, &format!("{}_", profile.map));
            }
            None => {
                // Missing world data downgrades to a no-op, never an error.
                info!(profile = %profile.id, "no world save found, world snapshot skipped");
            }
        }

        Ok(report)
    }

    fn write_config_archive(
        &self,
        profile: &Profile,
        archive_path: &Path,
        manifest: &str,
    ) -> Result<()> {
        let record = toml::to_string_pretty(profile)
            .map_err(|err| EngineError::BackupFailed(err.to_string()))?;
        let mut writer = self.open_archive(archive_path, manifest)?;
        writer
            .start_file(format!("{}.toml", profile.id), Self::options())
            .map_err(|err| EngineError::Archive(err.to_string()))?;
        writer.write_all(record.as_bytes())?;

        let config_dir = profile.config_dir(&self.config.paths);
        if config_dir.is_dir() {
            for entry in WalkDir::new(&config_dir).into_iter().filter_map(|e| e.ok()) {
                if !entry.file_type().is_file() {
                    continue;
                }
                let rel = entry
                    .path()
                    .strip_prefix(&config_dir)
                    .map_err(|err| EngineError::BackupFailed(err.to_string()))?;
                Self::append_file(&mut writer, entry.path(), &format!("config/{}", rel.display()))?;
            }
        }
        writer
            .finish()
            .map_err(|err| EngineError::Archive(err.to_string()))?;
        debug!(archive = %archive_path.display(), "configuration snapshot written");
        Ok(())
    }

    fn write_world_archive(
        &self,
        profile: &Profile,
        target_dir: &Path,
        stamp: &str,
        manifest: &str,
    ) -> Result<Option<PathBuf>> {
        if profile.world_save_opt_out {
            return Ok(None);
        }
        let save_dir = profile.save_dir(&self.config.paths);
        let world_file = profile.world_file(&self.config.paths);
        if !save_dir.is_dir() || !world_file.is_file() {
            return Ok(None);
        }

        let archive_path = target_dir.join(format!("{}_{stamp}.zip", profile.map));
        let mut writer = self.open_archive(&archive_path, manifest)?;
        Self::append_file(
            &mut writer,
            &world_file,
            &world_file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "world".to_owned()),
        )?;

        for entry in WalkDir::new(&save_dir)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let companion = self
                .config
                .paths
                .world_companion_extensions
                .iter()
                .any(|ext| name.ends_with(ext.as_str()));
            if companion {
                Self::append_file(&mut writer, entry.path(), &name)?;
            }
        }
        writer
            .finish()
            .map_err(|err| EngineError::Archive(err.to_string()))?;
        debug!(archive = %archive_path.display(), "world snapshot written");
        Ok(Some(archive_path))
    }

    fn open_archive(&self, path: &Path, manifest: &str) -> Result<ZipWriter<File>> {
        let file = File::create(path)?;
        let mut writer = ZipWriter::new(file);
        writer.set_comment(manifest);
        Ok(writer)
    }

    fn append_file(writer: &mut ZipWriter<File>, src: &Path, name: &str) -> Result<()> {
        writer
            .start_file(name, Self::options())
            .map_err(|err| EngineError::Archive(err.to_string()))?;
        let mut reader = File::open(src)?;
        std::io::copy(&mut reader, writer)?;
        Ok(())
    }

    fn options() -> FileOptions {
        FileOptions::default().compression_method(CompressionMethod::Deflated)
    }

    fn manifest(&self, profile: &Profile, operation: OperationKind) -> String {
        format!(
            "environment={} tool-version={} install={} operation={}",
            std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_owned()),
            env!("CARGO_PKG_VERSION"),
            profile.install_directory.display(),
            operation
        )
    }

    /// Delete archives of one category older than the retention window.
    fn prune(&self, target_dir: &Path, prefix: &str) {
        let max_age =
            Duration::from_secs(u64::from(self.config.backup.delete_interval_days) * 86_400);
        let cutoff = SystemTime::now() - max_age;
        let Ok(entries) = fs::read_dir(target_dir) else {
            return;
        };
        for entry in entries.filter_map(|e| e.ok()) {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with(prefix) || !name.ends_with(".zip") {
                continue;
            }
            let too_old = entry
                .metadata()
                .and_then(|meta| meta.modified())
                .map(|mtime| mtime < cutoff)
                .unwrap_or(false);
            if too_old {
                if let Err(err) = fs::remove_file(entry.path()) {
                    warn!(archive = %entry.path().display(), error = %err, "failed to prune old archive");
                } else {
                    debug!(archive = %entry.path().display(), "old archive pruned");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::Branch;
    use tempfile::tempdir;

    fn profile_at(install: &Path) -> Profile {
        Profile {
            id: "alpha".to_owned(),
            name: "Alpha".to_owned(),
            install_directory: install.to_path_buf(),
            map: "island".to_owned(),
            branch: Branch::new("public"),
            ip: None,
            query_port: 0,
            control_port: 0,
            control_password: None,
            control_enabled: false,
            mod_ids: Vec::new(),
            enable_auto_backup: true,
            enable_auto_update: true,
            enable_auto_shutdown: true,
            restart_if_shutdown: false,
            check_for_online_players: true,
            world_save_opt_out: false,
            shutdown_grace_minutes: None,
            last_started: None,
            last_installed_version: None,
            updated: false,
        }
    }

    fn config_in(root: &Path) -> GlobalConfig {
        let mut config = GlobalConfig::default();
        config.paths.backup_directory = root.join("backups");
        config
    }

    #[test]
    fn config_snapshot_always_written_world_snapshot_needs_save() {
        let dir = tempdir().unwrap();
        let install = dir.path().join("install");
        fs::create_dir_all(install.join("config")).unwrap();
        fs::write(install.join("config/server.ini"), "port=7777").unwrap();

        let config = config_in(dir.path());
        let profile = profile_at(&install);
        let report = BackupEngine::new(&config)
            .backup_profile(&profile, OperationKind::Backup, Utc::now())
            .unwrap();

        assert_eq!(report.archives.len(), 1);
        assert!(report.archives[0]
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("config_"));
    }

    #[test]
    fn world_snapshot_collects_companion_files() {
        let dir = tempdir().unwrap();
        let install = dir.path().join("install");
        let config = config_in(dir.path());
        let profile = profile_at(&install);

        let save_dir = profile.save_dir(&config.paths);
        fs::create_dir_all(&save_dir).unwrap();
        fs::write(profile.world_file(&config.paths), "world").unwrap();
        fs::write(save_dir.join("123.player"), "player").unwrap();
        fs::write(save_dir.join("notes.txt"), "ignored").unwrap();

        let report = BackupEngine::new(&config)
            .backup_profile(&profile, OperationKind::Shutdown, Utc::now())
            .unwrap();
        assert_eq!(report.archives.len(), 2);

        let world_archive = File::open(&report.archives[1]).unwrap();
        let mut archive = zip::ZipArchive::new(world_archive).unwrap();
        let names: Vec<String> = (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_owned())
            .collect();
        assert!(names.contains(&"island.world".to_owned()));
        assert!(names.contains(&"123.player".to_owned()));
        assert!(!names.contains(&"notes.txt".to_owned()));
    }

    #[test]
    fn manifest_records_operation() {
        let dir = tempdir().unwrap();
        let install = dir.path().join("install");
        fs::create_dir_all(&install).unwrap();
        let config = config_in(dir.path());
        let profile = profile_at(&install);

        let report = BackupEngine::new(&config)
            .backup_profile(&profile, OperationKind::Update, Utc::now())
            .unwrap();
        let archive = zip::ZipArchive::new(File::open(&report.archives[0]).unwrap()).unwrap();
        let comment = String::from_utf8_lossy(archive.comment()).into_owned();
        assert!(comment.contains("operation=update"));
    }
}
