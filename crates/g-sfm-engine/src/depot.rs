//! ---
//! sfm_section: "02-fleet-engine"
//! sfm_subsection: "module"
//! sfm_type: "source"
//! sfm_scope: "code"
//! sfm_description: "Fleet orchestration engine: locks, shutdown, updates, backup, scheduling."
//! sfm_version: "v0.0.0-prealpha"
//! sfm_owner: "tbd"
//! ---
//! External package tool runner with sentinel-based success detection.
//!
//! The tool's exit code is not sufficient proof of success: when output
//! capture is enabled a run only counts as successful if the configured
//! success sentinel appeared on stdout. With capture disabled the sentinel
//! check is skipped entirely and the exit status alone decides.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use g_sfm_common::config::DepotSettings;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{EngineError, Result};

/// Classification of one tool invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepotRun {
    pub success: bool,
    /// The progress sentinel appeared, i.e. the tool actually downloaded.
    pub downloaded: bool,
}

/// Runs the external package tool and classifies its output.
#[derive(Debug, Clone)]
pub struct DepotRunner {
    settings: DepotSettings,
}

impl DepotRunner {
    pub fn new(settings: DepotSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &DepotSettings {
        &self.settings
    }

    /// Fail fast when the tool binary is missing.
    pub fn ensure_tool(&self) -> Result<()> {
        if !self.settings.tool_path.is_file() {
            return Err(EngineError::PackageToolNotFound(
                self.settings.tool_path.clone(),
            ));
        }
        Ok(())
    }

    /// One invocation of the tool.
    pub async fn run_once(
        &self,
        args: &[String],
        workdir: &Path,
        success_sentinel: &str,
        cancel: &CancellationToken,
    ) -> Result<DepotRun> {
        self.ensure_tool()?;
        let mut command = tokio::process::Command::new(&self.settings.tool_path);
        command.args(args).current_dir(workdir);
        if self.settings.capture_output {
            command.stdout(Stdio::piped());
        }
        let mut child = command
            .spawn()
            .map_err(|err| EngineError::Io(err))?;

        let mut saw_sentinel = false;
        let mut saw_progress = false;

        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        let _ = child.kill().await;
                        return Err(EngineError::Cancelled);
                    }
                    line = lines.next_line() => {
                        match line {
                            Ok(Some(line)) => {
                                debug!(target: "depot", line = %line);
                                if line.contains(&self.settings.progress_sentinel) {
                                    saw_progress = true;
                                }
                                if line.starts_with(success_sentinel) {
                                    saw_sentinel = true;
                                }
                            }
                            Ok(None) => break,
                            Err(err) => {
                                warn!(error = %err, "error reading package tool output");
                                break;
                            }
                        }
                    }
                }
            }
        }

        let status = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                return Err(EngineError::Cancelled);
            }
            status = child.wait() => status.map_err(EngineError::Io)?,
        };

        let success = if self.settings.capture_output {
            status.success() && saw_sentinel
        } else {
            status.success()
        };
        debug!(
            exit = ?status.code(),
            sentinel = saw_sentinel,
            downloaded = saw_progress,
            success,
            "package tool run classified"
        );
        Ok(DepotRun {
            success,
            downloaded: saw_progress,
        })
    }

    /// Invoke the tool with a bounded retry loop and fixed inter-attempt
    /// delay. Exhausting the bound is fatal for the unit.
    pub async fn run_with_retry(
        &self,
        args: &[String],
        workdir: &Path,
        success_sentinel: &str,
        max_attempts: u32,
        retry_delay: Duration,
        cancel: &CancellationToken,
    ) -> Result<DepotRun> {
        let attempts = max_attempts.max(1);
        for attempt in 1..=attempts {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            match self.run_once(args, workdir, success_sentinel, cancel).await {
                Ok(run) if run.success => {
                    if attempt > 1 {
                        info!(attempt, "package tool succeeded after retry");
                    }
                    return Ok(run);
                }
                Ok(_) => {
                    warn!(attempt, max_attempts = attempts, "package tool run failed");
                }
                Err(EngineError::Cancelled) => return Err(EngineError::Cancelled),
                Err(err) => {
                    warn!(attempt, max_attempts = attempts, error = %err, "package tool invocation error");
                }
            }
            if attempt < attempts {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                    _ = tokio::time::sleep(retry_delay) => {}
                }
            }
        }
        Err(EngineError::DownloadFailed {
            attempts,
            detail: format!("tool did not report '{success_sentinel}'"),
        })
    }

    /// Render an argument template into an argv list.
    pub fn render_args(template: &str, substitutions: &[(&str, &str)]) -> Vec<String> {
        let mut rendered = template.to_owned();
        for (placeholder, value) in substitutions {
            rendered = rendered.replace(placeholder, value);
        }
        rendered
            .split_whitespace()
            .map(str::to_owned)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_args_substitutes_placeholders() {
        let args = DepotRunner::render_args(
            "+force_install_dir {cache_dir} +app_update {branch}{validate} +quit",
            &[
                ("{cache_dir}", "/cache/public"),
                ("{branch}", "376030"),
                ("{validate}", " validate"),
            ],
        );
        assert_eq!(
            args,
            vec![
                "+force_install_dir",
                "/cache/public",
                "+app_update",
                "376030",
                "validate",
                "+quit"
            ]
        );
    }

    #[test]
    fn render_args_drops_empty_placeholders() {
        let args = DepotRunner::render_args(
            "+app_update {branch}{validate} +quit",
            &[("{branch}", "376030"), ("{validate}", "")],
        );
        assert_eq!(args, vec!["+app_update", "376030", "+quit"]);
    }
}
