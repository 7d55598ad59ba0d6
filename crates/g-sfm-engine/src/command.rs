//! ---
//! sfm_section: "02-fleet-engine"
//! sfm_subsection: "module"
//! sfm_type: "source"
//! sfm_scope: "code"
//! sfm_description: "Fleet orchestration engine: locks, shutdown, updates, backup, scheduling."
//! sfm_version: "v0.0.0-prealpha"
//! sfm_owner: "tbd"
//! ---
//! Command adapter: maps inbound operation requests onto engine runs.
//!
//! The in-flight registry is the one piece of process-wide shared state
//! outside the filesystem locks. A second command against a busy profile is
//! rejected with "already running" by a single compare-and-set per profile
//! id; it never races into the engine.

use std::collections::HashMap;
use std::sync::Arc;

use g_sfm_common::RunOutcome;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use strum::Display;
use tracing::{debug, warn};

use crate::fleet::FleetContext;

/// The operation kinds a front end can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum OperationKind {
    Backup,
    Update,
    Shutdown,
    Restart,
    Stop,
    Start,
}

impl OperationKind {
    /// Whether the shutdown sequencer should run a countdown at all.
    pub fn uses_countdown(self) -> bool {
        !matches!(self, OperationKind::Stop)
    }

    /// Whether this operation implies a start after the stop.
    pub fn restarts(self) -> bool {
        matches!(self, OperationKind::Restart | OperationKind::Update)
    }
}

/// Concurrency-safe map of profile id to active operation.
#[derive(Debug, Default, Clone)]
pub struct InFlightRegistry {
    inner: Arc<Mutex<HashMap<String, OperationKind>>>,
}

impl InFlightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Single compare-and-set: claims the profile or reports the holder.
    pub fn begin(&self, profile_id: &str, kind: OperationKind) -> Option<InFlightGuard> {
        let mut inner = self.inner.lock();
        if let Some(active) = inner.get(profile_id) {
            debug!(profile = profile_id, active = %active, requested = %kind, "operation rejected, profile busy");
            return None;
        }
        inner.insert(profile_id.to_owned(), kind);
        Some(InFlightGuard {
            registry: self.inner.clone(),
            profile_id: profile_id.to_owned(),
        })
    }

    pub fn active(&self, profile_id: &str) -> Option<OperationKind> {
        self.inner.lock().get(profile_id).copied()
    }
}

/// Releases the registry slot on drop.
#[derive(Debug)]
pub struct InFlightGuard {
    registry: Arc<Mutex<HashMap<String, OperationKind>>>,
    profile_id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.profile_id);
    }
}

/// External-facing boundary translating requests into engine runs.
pub struct CommandAdapter {
    context: Arc<FleetContext>,
    registry: InFlightRegistry,
}

impl CommandAdapter {
    pub fn new(context: Arc<FleetContext>) -> Self {
        Self {
            context,
            registry: InFlightRegistry::new(),
        }
    }

    pub fn registry(&self) -> &InFlightRegistry {
        &self.registry
    }

    /// Run one operation against one profile.
    pub async fn dispatch(&self, profile_id: &str, kind: OperationKind) -> RunOutcome {
        let Some(_guard) = self.registry.begin(profile_id, kind) else {
            warn!(profile = profile_id, requested = %kind, "profile already has an operation in flight");
            return RunOutcome::AlreadyRunning;
        };
        match kind {
            OperationKind::Backup => self.context.run_profile_backup(profile_id).await,
            OperationKind::Update => self.context.run_single_profile_update(profile_id).await,
            OperationKind::Shutdown | OperationKind::Restart | OperationKind::Stop => {
                self.context
                    .run_auto_shutdown(profile_id, kind, false)
                    .await
            }
            OperationKind::Start => self.context.run_profile_start(profile_id).await,
        }
    }
}
