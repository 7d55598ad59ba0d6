//! ---
//! sfm_section: "02-fleet-engine"
//! sfm_subsection: "module"
//! sfm_type: "source"
//! sfm_scope: "code"
//! sfm_description: "Fleet orchestration engine: locks, shutdown, updates, backup, scheduling."
//! sfm_version: "v0.0.0-prealpha"
//! sfm_owner: "tbd"
//! ---
//! The G-SFM orchestration engine.
//!
//! The engine drives the lifecycle of a fleet of game-server profiles:
//! graceful shutdown with a player-aware countdown, process start, two-phase
//! binary/mod updates (cache refresh, then comparison-gated distribution),
//! archival backups, and coordinated rollout across branches. Every unit of
//! work finishes with one [`g_sfm_common::RunOutcome`], and at most one
//! mutating operation runs per shared directory, enforced by [`lock`].

pub mod backup;
pub mod command;
pub mod control;
pub mod copy;
pub mod depot;
pub mod error;
pub mod fleet;
pub mod ledger;
pub mod lock;
pub mod modmeta;
pub mod notify;
pub mod process;
pub mod profile;
pub mod shutdown;
pub mod update;

pub use command::{CommandAdapter, InFlightRegistry, OperationKind};
pub use error::{EngineError, Result};
pub use fleet::{FleetContext, FleetEvent};
pub use profile::{Branch, FleetStore, Profile};
