//! ---
//! sfm_section: "02-fleet-engine"
//! sfm_subsection: "module"
//! sfm_type: "source"
//! sfm_scope: "code"
//! sfm_description: "Fleet orchestration engine: locks, shutdown, updates, backup, scheduling."
//! sfm_version: "v0.0.0-prealpha"
//! sfm_owner: "tbd"
//! ---
//! Process controller: locate and drive the server process for a profile.
//!
//! A running server is matched by its executable path, never by PID or
//! window title; PIDs get reused and titles are not unique. The driver is a
//! trait so the shutdown escalation ladder can be exercised in tests
//! without a real process.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use g_sfm_common::config::PathsConfig;
use sysinfo::{Pid, Signal, System};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{EngineError, Result};
use crate::profile::Profile;

/// Handle onto a located server process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessHandle {
    pub pid: u32,
    pub exe: PathBuf,
}

/// Seam over the operating system's process table.
#[async_trait]
pub trait ProcessDriver: Send + Sync {
    /// Locate a running process by executable path.
    fn find(&self, expected_exe: &Path) -> Option<ProcessHandle>;

    /// Wait until the process exits, up to `timeout`. True when it exited.
    async fn wait_for_exit(&self, handle: &ProcessHandle, timeout: Duration) -> bool;

    /// Ask the process to close gracefully (window close / SIGTERM).
    fn request_close(&self, handle: &ProcessHandle) -> bool;

    /// Send an interrupt/break signal.
    fn send_interrupt(&self, handle: &ProcessHandle) -> bool;

    /// Forceful kill.
    fn kill(&self, handle: &ProcessHandle) -> bool;

    /// Launch the configured launcher executable.
    async fn launch(&self, launcher: &Path, workdir: &Path) -> Result<()>;
}

/// Production driver backed by the system process table.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcessDriver;

impl SystemProcessDriver {
    fn with_process<T>(&self, pid: u32, f: impl FnOnce(&sysinfo::Process) -> T) -> Option<T> {
        let mut system = System::new();
        system.refresh_processes();
        system.process(Pid::from_u32(pid)).map(f)
    }
}

#[async_trait]
impl ProcessDriver for SystemProcessDriver {
    fn find(&self, expected_exe: &Path) -> Option<ProcessHandle> {
        let mut system = System::new();
        system.refresh_processes();
        for (pid, process) in system.processes() {
            let Some(exe) = process.exe() else { continue };
            if exe == expected_exe {
                return Some(ProcessHandle {
                    pid: pid.as_u32(),
                    exe: exe.to_path_buf(),
                });
            }
        }
        None
    }

    async fn wait_for_exit(&self, handle: &ProcessHandle, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let mut system = System::new();
            system.refresh_processes();
            if system.process(Pid::from_u32(handle.pid)).is_none() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    fn request_close(&self, handle: &ProcessHandle) -> bool {
        self.with_process(handle.pid, |process| {
            process.kill_with(Signal::Term).unwrap_or(false)
        })
        .unwrap_or(false)
    }

    fn send_interrupt(&self, handle: &ProcessHandle) -> bool {
        self.with_process(handle.pid, |process| {
            process.kill_with(Signal::Interrupt).unwrap_or(false)
        })
        .unwrap_or(false)
    }

    fn kill(&self, handle: &ProcessHandle) -> bool {
        self.with_process(handle.pid, |process| process.kill())
            .unwrap_or(false)
    }

    async fn launch(&self, launcher: &Path, workdir: &Path) -> Result<()> {
        if !launcher.is_file() {
            return Err(EngineError::RestartFailed(format!(
                "launcher not found at {}",
                launcher.display()
            )));
        }
        let child = tokio::process::Command::new(launcher)
            .current_dir(workdir)
            .spawn()
            .map_err(|err| EngineError::RestartFailed(err.to_string()))?;
        debug!(launcher = %launcher.display(), pid = ?child.id(), "launcher started");
        Ok(())
    }
}

/// Recover from a previously interrupted world save: when the temp save
/// exists but the real save does not, rename temp to real.
pub fn verify_world_file(profile: &Profile, paths: &PathsConfig) -> Result<()> {
    if profile.world_save_opt_out {
        return Ok(());
    }
    let world = profile.world_file(paths);
    let temp = profile.world_temp_file(paths);
    if !world.exists() && temp.exists() {
        info!(
            profile = %profile.id,
            world = %world.display(),
            "restoring world save from interrupted temp file"
        );
        fs::rename(&temp, &world)?;
    }
    Ok(())
}

/// Start the server for a profile.
///
/// Returns the existing handle when the process is already running, so two
/// starts never race two processes onto one install path.
pub async fn start_server(
    driver: &dyn ProcessDriver,
    profile: &mut Profile,
    paths: &PathsConfig,
) -> Result<Option<ProcessHandle>> {
    let exe = profile.server_executable(paths);
    if let Some(existing) = driver.find(&exe) {
        warn!(profile = %profile.id, pid = existing.pid, "server start aborted, instance already running");
        return Ok(Some(existing));
    }

    verify_world_file(profile, paths)?;

    let launcher = profile.launcher_executable(paths);
    driver
        .launch(&launcher, &profile.install_directory)
        .await?;
    profile.record_started(Utc::now());
    info!(profile = %profile.id, launcher = %launcher.display(), "server start issued");
    Ok(driver.find(&exe))
}
