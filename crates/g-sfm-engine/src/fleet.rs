//! ---
//! sfm_section: "02-fleet-engine"
//! sfm_subsection: "module"
//! sfm_type: "source"
//! sfm_scope: "code"
//! sfm_description: "Fleet orchestration engine: locks, shutdown, updates, backup, scheduling."
//! sfm_version: "v0.0.0-prealpha"
//! sfm_owner: "tbd"
//! ---
//! Fleet scheduler: runs operations across the profile store.
//!
//! Every unit of work (one profile, or one branch cache) finishes with its
//! own [`RunOutcome`]; a fleet run folds them with
//! [`RunOutcome::aggregate`], so one failing profile degrades the run to
//! `CompletedWithErrors` instead of aborting the rest. Unit isolation is
//! enforced with cross-process path locks, never shared mutable state.

use std::collections::HashMap;
use std::fs;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use g_sfm_common::config::GlobalConfig;
use g_sfm_common::RunOutcome;
use indexmap::IndexMap;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backup::BackupEngine;
use crate::command::OperationKind;
use crate::control::{
    ControlChannel, ControlClientFactory, NullClient, NullClientFactory, ServerControl,
    ServerQuery,
};
use crate::error::{EngineError, Result};
use crate::lock::{self, LockAcquisition, PathLock};
use crate::modmeta::{ModMetadataProvider, ModMetadataStatus, NoMetadata};
use crate::notify::{AlertCategory, Notifier};
use crate::process::{start_server, ProcessDriver, SystemProcessDriver};
use crate::profile::{Branch, FleetStore, Profile};
use crate::shutdown::{SequencerState, ShutdownRequest, ShutdownSequencer};
use crate::update::{compose_update_reason, UpdatePipeline};

/// Progress events published to observers (UI, log tailers). Lossy by
/// design: a lagging receiver never blocks the run.
#[derive(Debug, Clone)]
pub enum FleetEvent {
    RunStarted {
        operation: OperationKind,
    },
    ProfileFinished {
        profile: String,
        operation: OperationKind,
        outcome: RunOutcome,
    },
    RunFinished {
        operation: OperationKind,
        outcome: RunOutcome,
    },
}

/// Shared state and collaborators for fleet runs.
pub struct FleetContext {
    config: Arc<GlobalConfig>,
    store: FleetStore,
    driver: Arc<dyn ProcessDriver>,
    control_factory: Arc<dyn ControlClientFactory>,
    metadata: Arc<dyn ModMetadataProvider>,
    notifier: Notifier,
    events: broadcast::Sender<FleetEvent>,
    cancel: CancellationToken,
}

impl FleetContext {
    pub fn new(config: GlobalConfig) -> Self {
        let store = FleetStore::new(config.paths.profiles_dir());
        let notifier = Notifier::new(config.notify.clone());
        let (events, _) = broadcast::channel(64);
        Self {
            config: Arc::new(config),
            store,
            driver: Arc::new(SystemProcessDriver),
            control_factory: Arc::new(NullClientFactory),
            metadata: Arc::new(NoMetadata),
            notifier,
            events,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_driver(mut self, driver: Arc<dyn ProcessDriver>) -> Self {
        self.driver = driver;
        self
    }

    pub fn with_control_factory(mut self, factory: Arc<dyn ControlClientFactory>) -> Self {
        self.control_factory = factory;
        self
    }

    pub fn with_metadata_provider(mut self, provider: Arc<dyn ModMetadataProvider>) -> Self {
        self.metadata = provider;
        self
    }

    pub fn with_notifier(mut self, notifier: Notifier) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &GlobalConfig {
        &self.config
    }

    pub fn store(&self) -> &FleetStore {
        &self.store
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.events.subscribe()
    }

    // ------------------------------------------------------------------
    // fleet runs

    /// Back up every backup-enabled profile.
    pub async fn run_auto_backup(&self) -> RunOutcome {
        self.emit(FleetEvent::RunStarted {
            operation: OperationKind::Backup,
        });
        let profiles = match self.store.snapshot() {
            Ok(profiles) => profiles,
            Err(err) => return self.run_failed(OperationKind::Backup, &err).await,
        };
        let profiles: Vec<Profile> = profiles
            .into_iter()
            .filter(|p| p.enable_auto_backup)
            .collect();
        let ids: Vec<String> = profiles.iter().map(|p| p.id.clone()).collect();
        let run_started = Utc::now();

        let outcomes = if self.config.backup.sequential {
            let mut outcomes = Vec::with_capacity(profiles.len());
            for profile in profiles {
                outcomes.push(self.backup_unit(profile, run_started).await);
            }
            outcomes
        } else {
            let units = profiles
                .into_iter()
                .map(|profile| self.guarded_unit(self.backup_unit(profile, run_started)));
            futures::future::join_all(units).await
        };

        if !ids.is_empty() {
            let summary = ids
                .iter()
                .zip(&outcomes)
                .map(|(id, outcome)| format!("{id}: {outcome}"))
                .collect::<Vec<_>>()
                .join(", ");
            self.notifier
                .alert(AlertCategory::Backup, "fleet", &summary)
                .await;
            self.notifier
                .email("auto backup finished", &summary, None)
                .await;
        }
        self.finish_run(OperationKind::Backup, outcomes)
    }

    /// Refresh all caches, then roll the update across every
    /// update-enabled profile, branch by branch.
    pub async fn run_auto_update(&self) -> RunOutcome {
        self.emit(FleetEvent::RunStarted {
            operation: OperationKind::Update,
        });
        let profiles = match self.updatable_profiles() {
            Ok(profiles) => profiles,
            Err(err) => return self.run_failed(OperationKind::Update, &err).await,
        };
        if profiles.is_empty() {
            info!("no update-enabled profiles, nothing to do");
            return self.finish_run(OperationKind::Update, Vec::new());
        }

        let mod_ids = Self::mod_id_union(&profiles);
        let metadata = self.fetch_metadata(&mod_ids).await;

        let mut outcomes = Vec::new();

        // Mod caches are shared across branches: refresh them once, up
        // front, so every profile distributes the same mod build.
        let pipeline = UpdatePipeline::new(&self.config);
        for mod_id in &mod_ids {
            if let Some(outcome) = self.refresh_mod_unit(&pipeline, mod_id, &metadata).await {
                outcomes.push(outcome);
            }
        }

        let mut by_branch: IndexMap<Branch, Vec<Profile>> = IndexMap::new();
        for profile in profiles {
            by_branch
                .entry(profile.branch.clone())
                .or_default()
                .push(profile);
        }
        for (branch, members) in by_branch {
            outcomes.extend(self.run_branch(&branch, members, &metadata).await);
        }

        self.finish_run(OperationKind::Update, outcomes)
    }

    /// Update every profile tracking one branch. Public entry for targeted
    /// branch rollouts.
    pub async fn run_branch_update(&self, branch_name: &str) -> RunOutcome {
        self.emit(FleetEvent::RunStarted {
            operation: OperationKind::Update,
        });
        let profiles = match self.updatable_profiles() {
            Ok(profiles) => profiles,
            Err(err) => return self.run_failed(OperationKind::Update, &err).await,
        };
        let branch = Branch::new(branch_name);
        let members: Vec<Profile> = profiles
            .into_iter()
            .filter(|p| p.branch == branch)
            .collect();
        if members.is_empty() {
            warn!(branch = branch_name, "no update-enabled profiles track this branch");
            self.emit(FleetEvent::RunFinished {
                operation: OperationKind::Update,
                outcome: RunOutcome::BadArgument,
            });
            return RunOutcome::BadArgument;
        }

        let mod_ids = Self::mod_id_union(&members);
        let metadata = self.fetch_metadata(&mod_ids).await;
        let mut outcomes = Vec::new();
        let pipeline = UpdatePipeline::new(&self.config);
        for mod_id in &mod_ids {
            if let Some(outcome) = self.refresh_mod_unit(&pipeline, mod_id, &metadata).await {
                outcomes.push(outcome);
            }
        }
        outcomes.extend(self.run_branch(&branch, members, &metadata).await);
        let outcome = Self::fold_targeted(&outcomes);
        self.emit(FleetEvent::RunFinished {
            operation: OperationKind::Update,
            outcome,
        });
        outcome
    }

    // ------------------------------------------------------------------
    // single profile entries

    /// Shut down (or restart, or hard stop) one profile.
    ///
    /// `check_grace` is set by scheduled runs: it honours the auto-shutdown
    /// enable flag and skips servers inside their restart grace period.
    pub async fn run_auto_shutdown(
        &self,
        profile_id: &str,
        kind: OperationKind,
        check_grace: bool,
    ) -> RunOutcome {
        let mut profile = match self.store.load(profile_id) {
            Ok(profile) => profile,
            Err(err) => return self.unit_failed(profile_id, kind, &err).await,
        };
        if check_grace {
            if !profile.enable_auto_shutdown {
                return RunOutcome::AutoShutdownNotEnabled;
            }
            if self.within_restart_grace(&profile) {
                info!(profile = %profile.id, "inside restart grace period, shutdown skipped");
                return RunOutcome::ProcessSkipped;
            }
        }

        let result = self.shutdown_profile(&mut profile, kind).await;
        self.save_back(&profile);
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(err) => return self.unit_failed(profile_id, kind, &err).await,
        };
        self.emit(FleetEvent::ProfileFinished {
            profile: profile.id.clone(),
            operation: kind,
            outcome,
        });
        outcome
    }

    /// Back up one profile on demand.
    pub async fn run_profile_backup(&self, profile_id: &str) -> RunOutcome {
        let profile = match self.store.load(profile_id) {
            Ok(profile) => profile,
            Err(err) => {
                return self
                    .unit_failed(profile_id, OperationKind::Backup, &err)
                    .await
            }
        };
        if !profile.enable_auto_backup {
            info!(profile = %profile.id, "backups are not enabled for this profile");
            return RunOutcome::AutoBackupNotEnabled;
        }
        self.backup_unit(profile, Utc::now()).await
    }

    /// Refresh the caches one profile needs, then update it.
    pub async fn run_single_profile_update(&self, profile_id: &str) -> RunOutcome {
        let profile = match self
            .validate_directories()
            .and_then(|()| self.store.load(profile_id))
        {
            Ok(profile) => profile,
            Err(err) => {
                return self
                    .unit_failed(profile_id, OperationKind::Update, &err)
                    .await
            }
        };
        if !profile.enable_auto_update {
            info!(profile = %profile.id, "updates are not enabled for this profile");
            return RunOutcome::AutoUpdateNotEnabled;
        }

        let metadata = self.fetch_metadata(&profile.mod_ids).await;
        let mut outcomes = Vec::new();
        let pipeline = UpdatePipeline::new(&self.config);
        if let Err(err) = pipeline.runner().ensure_tool() {
            return self
                .unit_failed(profile_id, OperationKind::Update, &err)
                .await;
        }
        for mod_id in &profile.mod_ids.clone() {
            if let Some(outcome) = self.refresh_mod_unit(&pipeline, mod_id, &metadata).await {
                outcomes.push(outcome);
            }
        }
        let branch = profile.branch.clone();
        outcomes.extend(self.run_branch(&branch, vec![profile], &metadata).await);
        Self::fold_targeted(&outcomes)
    }

    /// Start one profile's server if it is not already running.
    pub async fn run_profile_start(&self, profile_id: &str) -> RunOutcome {
        let mut profile = match self.store.load(profile_id) {
            Ok(profile) => profile,
            Err(err) => {
                return self
                    .unit_failed(profile_id, OperationKind::Start, &err)
                    .await
            }
        };
        let result = self.start_unit(&mut profile).await;
        self.save_back(&profile);
        match result {
            Ok(()) => {
                self.emit(FleetEvent::ProfileFinished {
                    profile: profile.id.clone(),
                    operation: OperationKind::Start,
                    outcome: RunOutcome::Normal,
                });
                RunOutcome::Normal
            }
            Err(err) => self.unit_failed(profile_id, OperationKind::Start, &err).await,
        }
    }

    // ------------------------------------------------------------------
    // units

    async fn start_unit(&self, profile: &mut Profile) -> Result<()> {
        let _lock = self.lock_path(&profile.install_directory).await?;
        start_server(self.driver.as_ref(), profile, &self.config.paths).await?;
        self.notifier
            .alert(AlertCategory::Startup, &profile.id, "server start issued")
            .await;
        Ok(())
    }

    async fn backup_unit(&self, profile: Profile, run_started: chrono::DateTime<Utc>) -> RunOutcome {
        let result: Result<()> = async {
            let _lock = self.lock_path(&profile.install_directory).await?;
            let report =
                BackupEngine::new(&self.config).backup_profile(&profile, OperationKind::Backup, run_started)?;
            debug!(profile = %profile.id, archives = report.archives.len(), "backup unit complete");
            Ok(())
        }
        .await;
        let outcome = match result {
            Ok(()) => RunOutcome::Normal,
            Err(EngineError::Busy(_)) => RunOutcome::AlreadyRunning,
            Err(EngineError::Cancelled) => RunOutcome::Cancelled,
            Err(err) => {
                self.report_error(&profile.id, &err).await;
                RunOutcome::BackupFailed
            }
        };
        self.emit(FleetEvent::ProfileFinished {
            profile: profile.id,
            operation: OperationKind::Backup,
            outcome,
        });
        outcome
    }

    /// Profile snapshot taken between a stop and any distribution or
    /// restart. Best effort: a failed archive is reported and the flow
    /// continues.
    async fn snapshot_profile(&self, profile: &Profile, operation: OperationKind) {
        match BackupEngine::new(&self.config).backup_profile(profile, operation, Utc::now()) {
            Ok(report) => {
                debug!(
                    profile = %profile.id,
                    archives = report.archives.len(),
                    "profile archived before changes"
                );
            }
            Err(err) => {
                warn!(profile = %profile.id, error = %err, "profile archive failed, continuing");
                self.report_error(&profile.id, &err).await;
            }
        }
    }

    /// Branch rollout: refresh the branch cache under its lock, then run
    /// every member profile. A failed cache refresh fails the whole branch
    /// without touching any member, never distributing a half-refreshed
    /// cache.
    async fn run_branch(
        &self,
        branch: &Branch,
        members: Vec<Profile>,
        metadata: &HashMap<String, ModMetadataStatus>,
    ) -> Vec<RunOutcome> {
        let cache_dir = self.config.paths.branch_cache_dir(&branch.name);
        let _lock = match self.lock_path(&cache_dir).await {
            Ok(lock) => lock,
            Err(err) => {
                warn!(branch = %branch.name, error = %err, "branch cache unavailable");
                return vec![err.outcome()];
            }
        };

        let pipeline = UpdatePipeline::new(&self.config);
        if let Err(err) = pipeline.refresh_branch_cache(branch, &self.cancel).await {
            warn!(branch = %branch.name, error = %err, "branch cache refresh failed, members not attempted");
            self.report_error(&branch.name, &err).await;
            return vec![match err {
                EngineError::Cancelled => RunOutcome::Cancelled,
                _ => RunOutcome::BranchCacheUpdateFailed,
            }];
        }

        if self.config.updates.update_sequentially {
            let count = members.len();
            let mut outcomes = Vec::with_capacity(count);
            for (index, profile) in members.into_iter().enumerate() {
                outcomes.push(self.update_unit(profile, metadata).await);
                if index + 1 < count {
                    tokio::select! {
                        _ = self.cancel.cancelled() => {
                            outcomes.push(RunOutcome::Cancelled);
                            break;
                        }
                        _ = tokio::time::sleep(self.config.updates.sequential_delay) => {}
                    }
                }
            }
            outcomes
        } else {
            let units = members
                .into_iter()
                .map(|profile| self.guarded_unit(self.update_unit(profile, metadata)));
            futures::future::join_all(units).await
        }
    }

    async fn update_unit(
        &self,
        mut profile: Profile,
        metadata: &HashMap<String, ModMetadataStatus>,
    ) -> RunOutcome {
        let id = profile.id.clone();
        let result = self.update_profile(&mut profile, metadata).await;
        self.save_back(&profile);
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(err) => {
                self.report_error(&id, &err).await;
                err.outcome()
            }
        };
        self.emit(FleetEvent::ProfileFinished {
            profile: id,
            operation: OperationKind::Update,
            outcome,
        });
        outcome
    }

    /// One profile's update: stop under a countdown naming what changes,
    /// distribute, restart.
    async fn update_profile(
        &self,
        profile: &mut Profile,
        metadata: &HashMap<String, ModMetadataStatus>,
    ) -> Result<RunOutcome> {
        let _lock = self.lock_path(&profile.install_directory).await?;

        let pipeline = UpdatePipeline::new(&self.config);
        let server_pending = pipeline.server_update_pending(profile);
        let pending_mods = pipeline.mods_update_pending(profile);
        if !server_pending && pending_mods.is_empty() {
            info!(profile = %profile.id, "already at the cached build, nothing to distribute");
            return Ok(RunOutcome::Normal);
        }

        let exe = profile.server_executable(&self.config.paths);
        let was_running = self.driver.find(&exe).is_some();
        if was_running {
            let titles: Vec<String> = pending_mods
                .iter()
                .map(|id| {
                    metadata
                        .get(id)
                        .map(|status| status.title_or(id))
                        .unwrap_or(id)
                        .to_owned()
                })
                .collect();
            let request = ShutdownRequest {
                operation: OperationKind::Update,
                grace_minutes: self.grace_for(profile),
                reason: None,
                update_reason: compose_update_reason(server_pending, &titles),
            };
            match self.sequencer_for(profile).run(profile, &request).await? {
                SequencerState::Stopped => {}
                SequencerState::Cancelled => return Err(EngineError::Cancelled),
                state => {
                    warn!(profile = %profile.id, state = %state, "server would not stop for update");
                    return Err(EngineError::ShutdownTimedOut(profile.id.clone()));
                }
            }
        }

        // archive while the install is quiet, before anything is overwritten
        self.snapshot_profile(profile, OperationKind::Update).await;

        let mut outcome = RunOutcome::Normal;
        if server_pending {
            if let Err(err) = pipeline.distribute_server(profile).await {
                warn!(profile = %profile.id, error = %err, "server distribution failed, install left stopped");
                self.report_error(&profile.id, &err).await;
                return Ok(RunOutcome::ServerUpdateFailed);
            }
        }
        let distribution = pipeline.distribute_mods(profile, &self.cancel).await;
        if !distribution.all_succeeded() {
            outcome = RunOutcome::ModUpdateFailed;
        }

        if server_pending || !distribution.updated.is_empty() {
            let summary = format!(
                "server updated: {server_pending}; mods updated: {}; mods failed: {}",
                distribution.updated.join(", "),
                distribution.failed.join(", ")
            );
            self.notifier
                .alert(AlertCategory::UpdateResults, &profile.id, &summary)
                .await;
            self.notifier
                .email(&format!("update results for {}", profile.id), &summary, None)
                .await;
        }

        let updates = &self.config.updates;
        if !updates.override_server_startup && (was_running || profile.restart_if_shutdown) {
            start_server(self.driver.as_ref(), profile, &self.config.paths).await?;
        }
        Ok(outcome)
    }

    async fn shutdown_profile(
        &self,
        profile: &mut Profile,
        kind: OperationKind,
    ) -> Result<RunOutcome> {
        let _lock = self.lock_path(&profile.install_directory).await?;
        let request = ShutdownRequest {
            operation: kind,
            grace_minutes: self.grace_for(profile),
            reason: None,
            update_reason: None,
        };
        match self.sequencer_for(profile).run(profile, &request).await? {
            SequencerState::Stopped => {
                self.snapshot_profile(profile, kind).await;
                if kind.restarts() && !self.config.updates.override_server_startup {
                    start_server(self.driver.as_ref(), profile, &self.config.paths).await?;
                }
                Ok(RunOutcome::Normal)
            }
            SequencerState::Cancelled => Err(EngineError::Cancelled),
            state => {
                warn!(profile = %profile.id, state = %state, "shutdown did not reach a stop");
                Err(EngineError::ShutdownTimedOut(profile.id.clone()))
            }
        }
    }

    /// Refresh one shared mod cache under its lock. `None` means the cache
    /// is current; `Some` carries a failure outcome for the aggregate.
    async fn refresh_mod_unit(
        &self,
        pipeline: &UpdatePipeline<'_>,
        mod_id: &str,
        metadata: &HashMap<String, ModMetadataStatus>,
    ) -> Option<RunOutcome> {
        let status = metadata
            .get(mod_id)
            .cloned()
            .unwrap_or(ModMetadataStatus::Unavailable);
        let cache_dir = self.config.paths.mod_cache_dir(mod_id);
        let result: Result<i64> = async {
            let _lock = self.lock_path(&cache_dir).await?;
            pipeline.refresh_mod_cache(mod_id, &status, &self.cancel).await
        }
        .await;
        match result {
            Ok(_) => None,
            Err(EngineError::Cancelled) => Some(RunOutcome::Cancelled),
            Err(err) => {
                warn!(mod_id, error = %err, "mod cache refresh failed");
                self.report_error(mod_id, &err).await;
                Some(RunOutcome::ModCacheUpdateFailed)
            }
        }
    }

    // ------------------------------------------------------------------
    // plumbing

    fn updatable_profiles(&self) -> Result<Vec<Profile>> {
        self.validate_directories()?;
        UpdatePipeline::new(&self.config).runner().ensure_tool()?;
        Ok(self
            .store
            .snapshot()?
            .into_iter()
            .filter(|p| p.enable_auto_update)
            .collect())
    }

    fn validate_directories(&self) -> Result<()> {
        let profiles_dir = self.store.root();
        if !profiles_dir.is_dir() {
            return Err(EngineError::InvalidDataDirectory(profiles_dir.to_path_buf()));
        }
        let cache_dir = &self.config.paths.cache_directory;
        fs::create_dir_all(cache_dir)
            .map_err(|_| EngineError::InvalidCacheDirectory(cache_dir.clone()))?;
        Ok(())
    }

    fn mod_id_union(profiles: &[Profile]) -> Vec<String> {
        let mut ids = Vec::new();
        for profile in profiles {
            for mod_id in &profile.mod_ids {
                if !ids.contains(mod_id) {
                    ids.push(mod_id.clone());
                }
            }
        }
        ids
    }

    /// Resolve metadata for mod ids. Lookup failures degrade every id to
    /// `Unavailable`; whether that forces a download is configuration.
    async fn fetch_metadata(&self, ids: &[String]) -> HashMap<String, ModMetadataStatus> {
        if ids.is_empty() {
            return HashMap::new();
        }
        match self.metadata.fetch(ids).await {
            Ok(found) => ids
                .iter()
                .map(|id| {
                    let status = found
                        .get(id)
                        .cloned()
                        .unwrap_or(ModMetadataStatus::Unavailable);
                    (id.clone(), status)
                })
                .collect(),
            Err(err) => {
                warn!(error = %err, "mod metadata lookup failed, treating all mods as unavailable");
                ids.iter()
                    .map(|id| (id.clone(), ModMetadataStatus::Unavailable))
                    .collect()
            }
        }
    }

    async fn lock_path(&self, target: &Path) -> Result<PathLock> {
        let acquisition = lock::acquire(
            &self.config.paths.lock_directory,
            target,
            self.config.locks.timeout,
            self.config.locks.attempt_delay,
            &self.cancel,
        )
        .await?;
        match acquisition {
            LockAcquisition::Acquired(lock) => Ok(lock),
            LockAcquisition::Busy => Err(EngineError::Busy(target.to_path_buf())),
        }
    }

    fn sequencer_for(&self, profile: &Profile) -> ShutdownSequencer {
        let (control, query): (Arc<dyn ServerControl>, Arc<dyn ServerQuery>) =
            if profile.control_enabled {
                let host = profile.ip.as_deref().unwrap_or("127.0.0.1");
                (
                    self.control_factory.control(
                        host,
                        profile.control_port,
                        profile.control_password.as_deref().unwrap_or(""),
                    ),
                    self.control_factory.query(host, profile.query_port),
                )
            } else {
                (Arc::new(NullClient), Arc::new(NullClient))
            };
        let channel = ControlChannel::new(
            control,
            self.config.shutdown.broadcast_template.clone(),
            self.config.shutdown.send_message_delay,
        );
        ShutdownSequencer::new(
            self.config.clone(),
            self.driver.clone(),
            channel,
            query,
            self.notifier.clone(),
            self.cancel.clone(),
        )
    }

    fn grace_for(&self, profile: &Profile) -> u32 {
        profile
            .shutdown_grace_minutes
            .unwrap_or(self.config.shutdown.grace_minutes)
    }

    fn within_restart_grace(&self, profile: &Profile) -> bool {
        let Some(started) = profile.last_started else {
            return false;
        };
        let grace = chrono::Duration::from_std(self.config.updates.restart_grace)
            .unwrap_or_else(|_| chrono::Duration::zero());
        Utc::now().signed_duration_since(started) < grace
    }

    /// Isolate one unit: a panicking unit degrades to a worker-error
    /// outcome instead of tearing down the run.
    async fn guarded_unit(
        &self,
        unit: impl std::future::Future<Output = RunOutcome>,
    ) -> RunOutcome {
        AssertUnwindSafe(unit)
            .catch_unwind()
            .await
            .unwrap_or(RunOutcome::UnknownWorkerError)
    }

    fn save_back(&self, profile: &Profile) {
        if !profile.updated {
            return;
        }
        if let Err(err) = self.store.save(profile) {
            warn!(profile = %profile.id, error = %err, "profile record save failed");
        }
    }

    async fn report_error(&self, unit: &str, err: &EngineError) {
        self.notifier
            .alert(AlertCategory::Error, unit, &err.to_string())
            .await;
    }

    async fn run_failed(&self, operation: OperationKind, err: &EngineError) -> RunOutcome {
        warn!(operation = %operation, error = %err, "fleet run aborted");
        self.report_error("fleet", err).await;
        let outcome = err.outcome();
        self.emit(FleetEvent::RunFinished { operation, outcome });
        outcome
    }

    async fn unit_failed(
        &self,
        profile_id: &str,
        operation: OperationKind,
        err: &EngineError,
    ) -> RunOutcome {
        warn!(profile = profile_id, operation = %operation, error = %err, "operation failed");
        self.report_error(profile_id, err).await;
        let outcome = err.outcome();
        self.emit(FleetEvent::ProfileFinished {
            profile: profile_id.to_owned(),
            operation,
            outcome,
        });
        outcome
    }

    fn finish_run(&self, operation: OperationKind, outcomes: Vec<RunOutcome>) -> RunOutcome {
        let outcome = RunOutcome::aggregate(outcomes);
        info!(operation = %operation, outcome = %outcome, "fleet run finished");
        self.emit(FleetEvent::RunFinished { operation, outcome });
        outcome
    }

    /// Fold for targeted entries (one branch, one profile): a lone failure
    /// keeps its specific code instead of blurring into the mixed-result one.
    fn fold_targeted(outcomes: &[RunOutcome]) -> RunOutcome {
        let mut abnormal = outcomes.iter().copied().filter(|o| !o.is_normal());
        match (abnormal.next(), abnormal.next()) {
            (None, _) => RunOutcome::Normal,
            (Some(single), None) => single,
            _ => RunOutcome::CompletedWithErrors,
        }
    }

    fn emit(&self, event: FleetEvent) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessHandle;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::path::PathBuf;
    use std::time::Duration;
    use tempfile::tempdir;

    fn context_at(root: &Path) -> FleetContext {
        let mut config = GlobalConfig::default();
        config.paths.data_directory = root.join("data");
        config.paths.cache_directory = root.join("cache");
        config.paths.lock_directory = root.join("locks");
        config.paths.backup_directory = root.join("backups");
        config.locks.timeout = Duration::from_millis(10);
        config.locks.attempt_delay = Duration::from_millis(1);
        FleetContext::new(config)
    }

    fn seed_profile(context: &FleetContext, id: &str) -> Profile {
        let profile = Profile {
            id: id.to_owned(),
            name: id.to_owned(),
            install_directory: context.store().root().parent().unwrap().join("servers").join(id),
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
            check_for_online_players: false,
            world_save_opt_out: false,
            shutdown_grace_minutes: None,
            last_started: None,
            last_installed_version: None,
            updated: false,
        };
        context.store().save(&profile).unwrap();
        profile
    }

    #[derive(Default)]
    struct IdleDriver {
        launches: Mutex<Vec<PathBuf>>,
    }

    #[async_trait]
    impl ProcessDriver for IdleDriver {
        fn find(&self, _expected_exe: &Path) -> Option<ProcessHandle> {
            None
        }

        async fn wait_for_exit(&self, _handle: &ProcessHandle, _timeout: Duration) -> bool {
            true
        }

        fn request_close(&self, _handle: &ProcessHandle) -> bool {
            false
        }

        fn send_interrupt(&self, _handle: &ProcessHandle) -> bool {
            false
        }

        fn kill(&self, _handle: &ProcessHandle) -> bool {
            false
        }

        async fn launch(&self, launcher: &Path, _workdir: &Path) -> Result<()> {
            self.launches.lock().push(launcher.to_path_buf());
            Ok(())
        }
    }

    #[tokio::test]
    async fn unknown_profile_reports_not_found() {
        let dir = tempdir().unwrap();
        let context = context_at(dir.path());
        std::fs::create_dir_all(context.store().root()).unwrap();

        let outcome = context
            .run_auto_shutdown("ghost", OperationKind::Shutdown, false)
            .await;
        assert_eq!(outcome, RunOutcome::ProfileNotFound);
    }

    #[tokio::test]
    async fn missing_data_directory_fails_the_update_run() {
        let dir = tempdir().unwrap();
        let context = context_at(dir.path());

        let outcome = context.run_auto_update().await;
        assert_eq!(outcome, RunOutcome::InvalidDataDirectory);
    }

    #[tokio::test]
    async fn missing_package_tool_fails_the_update_run() {
        let dir = tempdir().unwrap();
        let context = context_at(dir.path());
        std::fs::create_dir_all(context.store().root()).unwrap();
        seed_profile(&context, "alpha");

        let outcome = context.run_auto_update().await;
        assert_eq!(outcome, RunOutcome::PackageToolNotFound);
    }

    #[tokio::test]
    async fn recent_start_is_skipped_by_scheduled_shutdown() {
        let dir = tempdir().unwrap();
        let context = context_at(dir.path());
        std::fs::create_dir_all(context.store().root()).unwrap();
        let mut profile = seed_profile(&context, "alpha");
        profile.last_started = Some(Utc::now());
        context.store().save(&profile).unwrap();

        let outcome = context
            .run_auto_shutdown("alpha", OperationKind::Shutdown, true)
            .await;
        assert_eq!(outcome, RunOutcome::ProcessSkipped);

        // a manual request ignores the grace period
        let context = context.with_driver(Arc::new(IdleDriver::default()));
        let outcome = context
            .run_auto_shutdown("alpha", OperationKind::Shutdown, false)
            .await;
        assert_eq!(outcome, RunOutcome::Normal);
    }

    #[tokio::test]
    async fn restart_of_a_stopped_server_launches_it() {
        let dir = tempdir().unwrap();
        let driver = Arc::new(IdleDriver::default());
        let context = context_at(dir.path()).with_driver(driver.clone());
        std::fs::create_dir_all(context.store().root()).unwrap();
        let profile = seed_profile(&context, "alpha");

        let outcome = context
            .run_auto_shutdown("alpha", OperationKind::Restart, false)
            .await;
        assert_eq!(outcome, RunOutcome::Normal);
        assert_eq!(driver.launches.lock().len(), 1);

        // the start time was persisted
        let reloaded = context.store().load("alpha").unwrap();
        assert!(reloaded.last_started.is_some());
        assert_eq!(reloaded.id, profile.id);
    }

    #[tokio::test]
    async fn plain_shutdown_of_a_stopped_server_does_not_launch() {
        let dir = tempdir().unwrap();
        let driver = Arc::new(IdleDriver::default());
        let context = context_at(dir.path()).with_driver(driver.clone());
        std::fs::create_dir_all(context.store().root()).unwrap();
        seed_profile(&context, "alpha");

        let outcome = context
            .run_auto_shutdown("alpha", OperationKind::Shutdown, false)
            .await;
        assert_eq!(outcome, RunOutcome::Normal);
        assert!(driver.launches.lock().is_empty());
    }

    #[tokio::test]
    async fn profile_backup_produces_an_archive() {
        let dir = tempdir().unwrap();
        let context = context_at(dir.path());
        std::fs::create_dir_all(context.store().root()).unwrap();
        let profile = seed_profile(&context, "alpha");
        let config_dir = profile.config_dir(&context.config().paths);
        std::fs::create_dir_all(&config_dir).unwrap();
        std::fs::write(config_dir.join("settings.ini"), "[server]\n").unwrap();

        let outcome = context.run_profile_backup("alpha").await;
        assert_eq!(outcome, RunOutcome::Normal);
        let backups: Vec<_> = std::fs::read_dir(
            context.config().paths.backup_directory.join("alpha"),
        )
        .unwrap()
        .collect();
        assert!(!backups.is_empty());
    }

    #[tokio::test]
    async fn backup_run_aggregates_across_profiles() {
        let dir = tempdir().unwrap();
        let context = context_at(dir.path());
        std::fs::create_dir_all(context.store().root()).unwrap();
        for id in ["alpha", "bravo"] {
            let profile = seed_profile(&context, id);
            let config_dir = profile.config_dir(&context.config().paths);
            std::fs::create_dir_all(&config_dir).unwrap();
            std::fs::write(config_dir.join("settings.ini"), "[server]\n").unwrap();
        }

        let outcome = context.run_auto_backup().await;
        assert_eq!(outcome, RunOutcome::Normal);
    }

    #[tokio::test]
    async fn shutdown_archives_the_profile_before_any_restart() {
        let dir = tempdir().unwrap();
        let driver = Arc::new(IdleDriver::default());
        let context = context_at(dir.path()).with_driver(driver.clone());
        std::fs::create_dir_all(context.store().root()).unwrap();
        seed_profile(&context, "alpha");

        let outcome = context
            .run_auto_shutdown("alpha", OperationKind::Restart, false)
            .await;
        assert_eq!(outcome, RunOutcome::Normal);
        // the snapshot lands before the launch
        let archives: Vec<_> = std::fs::read_dir(
            context.config().paths.backup_directory.join("alpha"),
        )
        .unwrap()
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry
                .file_name()
                .to_string_lossy()
                .starts_with("config_")
        })
        .collect();
        assert!(!archives.is_empty());
        assert_eq!(driver.launches.lock().len(), 1);
    }

    #[tokio::test]
    async fn disabled_profile_flags_report_their_own_codes() {
        let dir = tempdir().unwrap();
        let context = context_at(dir.path());
        std::fs::create_dir_all(context.store().root()).unwrap();
        let mut profile = seed_profile(&context, "alpha");
        profile.enable_auto_backup = false;
        profile.enable_auto_update = false;
        context.store().save(&profile).unwrap();

        let outcome = context.run_profile_backup("alpha").await;
        assert_eq!(outcome, RunOutcome::AutoBackupNotEnabled);

        let outcome = context.run_single_profile_update("alpha").await;
        assert_eq!(outcome, RunOutcome::AutoUpdateNotEnabled);
    }

    #[tokio::test]
    async fn backup_run_emails_a_summary() {
        #[derive(Default)]
        struct RecordingEmail {
            seen: Mutex<Vec<(String, String)>>,
        }

        #[async_trait]
        impl crate::notify::EmailSink for RecordingEmail {
            async fn email(
                &self,
                subject: &str,
                body: &str,
                _attachment: Option<PathBuf>,
            ) -> anyhow::Result<()> {
                self.seen.lock().push((subject.to_owned(), body.to_owned()));
                Ok(())
            }
        }

        let dir = tempdir().unwrap();
        let mut config = GlobalConfig::default();
        config.paths.data_directory = dir.path().join("data");
        config.paths.cache_directory = dir.path().join("cache");
        config.paths.lock_directory = dir.path().join("locks");
        config.paths.backup_directory = dir.path().join("backups");
        config.locks.timeout = Duration::from_millis(10);
        config.locks.attempt_delay = Duration::from_millis(1);
        config.notify.email_enabled = true;
        let email = Arc::new(RecordingEmail::default());
        let notifier = Notifier::new(config.notify.clone()).with_email_sink(email.clone());
        let context = FleetContext::new(config).with_notifier(notifier);
        std::fs::create_dir_all(context.store().root()).unwrap();
        seed_profile(&context, "alpha");

        let outcome = context.run_auto_backup().await;
        assert_eq!(outcome, RunOutcome::Normal);
        let seen = email.seen.lock().clone();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "auto backup finished");
        assert!(seen[0].1.contains("alpha: normal"));
    }

    #[tokio::test]
    async fn events_are_published_for_unit_completion() {
        let dir = tempdir().unwrap();
        let context = context_at(dir.path());
        std::fs::create_dir_all(context.store().root()).unwrap();
        let mut events = context.subscribe();

        let outcome = context
            .run_auto_shutdown("ghost", OperationKind::Shutdown, false)
            .await;
        assert_eq!(outcome, RunOutcome::ProfileNotFound);
        match events.try_recv().unwrap() {
            FleetEvent::ProfileFinished {
                profile, outcome, ..
            } => {
                assert_eq!(profile, "ghost");
                assert_eq!(outcome, RunOutcome::ProfileNotFound);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}
