//! ---
//! sfm_section: "02-fleet-engine"
//! sfm_subsection: "module"
//! sfm_type: "source"
//! sfm_scope: "code"
//! sfm_description: "Fleet orchestration engine: locks, shutdown, updates, backup, scheduling."
//! sfm_version: "v0.0.0-prealpha"
//! sfm_owner: "tbd"
//! ---
//! Shutdown sequencer: an explicit finite state machine.
//!
//! `Announcing -> Countdown -> WorldSave -> FinalWarning -> Terminating ->
//! {Stopped, TimedOut, Cancelled}`. The cancellation signal is checked
//! before every transition; firing it anywhere moves to `Cancelled` after
//! an optional cancellation broadcast. Termination escalates through a
//! ladder of bounded-wait steps; exhausting the ladder is `TimedOut`.

use std::sync::Arc;

use g_sfm_common::config::GlobalConfig;
use strum::Display;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::command::OperationKind;
use crate::control::{ControlChannel, ServerQuery};
use crate::error::Result;
use crate::notify::{AlertCategory, Notifier};
use crate::process::{verify_world_file, ProcessDriver, ProcessHandle};
use crate::profile::Profile;

/// Sequencer states; the three trailing variants are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "kebab-case")]
pub enum SequencerState {
    Announcing,
    Countdown,
    WorldSave,
    FinalWarning,
    Terminating,
    Stopped,
    TimedOut,
    Cancelled,
}

impl SequencerState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SequencerState::Stopped | SequencerState::TimedOut | SequencerState::Cancelled
        )
    }
}

/// Parameters of one shutdown run.
#[derive(Debug, Clone)]
pub struct ShutdownRequest {
    pub operation: OperationKind,
    pub grace_minutes: u32,
    /// Human-supplied reason, broadcast once up front or on every message.
    pub reason: Option<String>,
    /// Update-triggered runs append this to each countdown message.
    pub update_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MessageSlot {
    None,
    Grace,
    Final,
}

/// Long-range checkpoint interval: coarser the more time remains.
pub(crate) fn checkpoint_interval(minutes_left: u32) -> u32 {
    if minutes_left >= 30 {
        30
    } else if minutes_left >= 15 {
        15
    } else {
        5
    }
}

/// Message cadence for one countdown minute.
///
/// Above five minutes only the countdown start and the checkpoint
/// multiples message, to avoid spamming players; from five down to two
/// every minute messages; the last minute gets the distinct final notice.
pub(crate) fn scheduled_message(minutes_left: u32, grace: u32) -> MessageSlot {
    match minutes_left {
        0 => MessageSlot::None,
        1 => MessageSlot::Final,
        2..=5 => MessageSlot::Grace,
        _ => {
            if minutes_left == grace || minutes_left % checkpoint_interval(minutes_left) == 0 {
                MessageSlot::Grace
            } else {
                MessageSlot::None
            }
        }
    }
}

/// Drives one profile through the shutdown state machine.
pub struct ShutdownSequencer {
    config: Arc<GlobalConfig>,
    driver: Arc<dyn ProcessDriver>,
    channel: ControlChannel,
    query: Arc<dyn ServerQuery>,
    notifier: Notifier,
    cancel: CancellationToken,
}

impl ShutdownSequencer {
    pub fn new(
        config: Arc<GlobalConfig>,
        driver: Arc<dyn ProcessDriver>,
        channel: ControlChannel,
        query: Arc<dyn ServerQuery>,
        notifier: Notifier,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            driver,
            channel,
            query,
            notifier,
            cancel,
        }
    }

    /// Run the state machine to a terminal state.
    pub async fn run(
        &self,
        profile: &mut Profile,
        request: &ShutdownRequest,
    ) -> Result<SequencerState> {
        let exe = profile.server_executable(&self.config.paths);
        let Some(handle) = self.driver.find(&exe) else {
            info!(profile = %profile.id, "server process not found, nothing to stop");
            return Ok(SequencerState::Stopped);
        };
        info!(profile = %profile.id, pid = handle.pid, state = %SequencerState::Announcing, "shutdown sequence started");

        let mut state = SequencerState::Announcing;
        loop {
            if self.cancel.is_cancelled() {
                return Ok(self.cancelled_exit(profile).await);
            }
            debug!(profile = %profile.id, state = %state, "sequencer transition");
            state = match state {
                SequencerState::Announcing => {
                    self.announce(profile, request).await;
                    SequencerState::Countdown
                }
                SequencerState::Countdown => {
                    if self.countdown(profile, request).await {
                        return Ok(self.cancelled_exit(profile).await);
                    }
                    SequencerState::WorldSave
                }
                SequencerState::WorldSave => {
                    if self.world_save(profile).await {
                        return Ok(self.cancelled_exit(profile).await);
                    }
                    SequencerState::FinalWarning
                }
                SequencerState::FinalWarning => {
                    self.final_warning(profile, request).await;
                    SequencerState::Terminating
                }
                SequencerState::Terminating => {
                    let outcome = self.terminate(profile, &handle).await;
                    if outcome == SequencerState::Stopped {
                        self.after_stop(profile, request).await?;
                    }
                    return Ok(outcome);
                }
                terminal => return Ok(terminal),
            };
        }
    }

    async fn announce(&self, profile: &Profile, request: &ShutdownRequest) {
        let shutdown = &self.config.shutdown;
        if let Some(reason) = &request.reason {
            if !shutdown.all_messages_show_reason && !reason.trim().is_empty() {
                self.notifier
                    .alert(AlertCategory::ShutdownReason, &profile.id, reason)
                    .await;
                self.channel.broadcast(reason).await;
            }
        }
    }

    /// Countdown loop, one simulated minute per tick. Returns true when the
    /// run was cancelled mid-loop.
    async fn countdown(&self, profile: &Profile, request: &ShutdownRequest) -> bool {
        let shutdown = &self.config.shutdown;
        let grace = if request.operation.uses_countdown() {
            request.grace_minutes
        } else {
            debug!(profile = %profile.id, operation = %request.operation, "countdown skipped for stop operation");
            0
        };

        let mut minutes_left = grace;
        while minutes_left > 0 {
            if self.cancel.is_cancelled() {
                return true;
            }

            if profile.check_for_online_players {
                match self.query.player_names().await {
                    Ok(players) => {
                        let online = players.iter().filter(|p| !p.trim().is_empty()).count();
                        if online == 0 {
                            info!(profile = %profile.id, "no online players, countdown cut short");
                            break;
                        }
                        debug!(profile = %profile.id, online, "players still online");
                    }
                    Err(err) => {
                        warn!(profile = %profile.id, error = %err, "player query failed, countdown continues");
                    }
                }
            }

            let message = match scheduled_message(minutes_left, grace) {
                MessageSlot::None => None,
                MessageSlot::Grace => Some(
                    shutdown
                        .messages
                        .grace
                        .replace("{minutes}", &minutes_left.to_string()),
                ),
                MessageSlot::Final => Some(shutdown.messages.final_grace.clone()),
            };
            let message = message.map(|mut body| {
                if let Some(update_reason) = &request.update_reason {
                    body.push_str("\n\n");
                    body.push_str(update_reason);
                }
                body
            });

            let mut sent = false;
            if let Some(body) = message {
                let body = self.with_reason(&body, request);
                self.notifier
                    .alert(AlertCategory::ShutdownMessage, &profile.id, &body)
                    .await;
                sent = self.channel.broadcast(&body).await;
            }

            minutes_left -= 1;
            if minutes_left == 0 {
                break;
            }
            // Sleep the rest of the tick, minus the time budgeted for the send.
            let delay = if sent {
                shutdown
                    .tick
                    .saturating_sub(shutdown.send_message_delay)
            } else {
                shutdown.tick
            };
            tokio::select! {
                _ = self.cancel.cancelled() => return true,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        false
    }

    /// World save step. Returns true when cancelled during the settle wait.
    async fn world_save(&self, profile: &Profile) -> bool {
        let shutdown = &self.config.shutdown;
        if !shutdown.enable_world_save || profile.world_save_opt_out {
            return false;
        }
        if !shutdown.messages.world_save.is_empty() {
            self.notifier
                .alert(
                    AlertCategory::ShutdownMessage,
                    &profile.id,
                    &shutdown.messages.world_save,
                )
                .await;
            self.channel.broadcast(&shutdown.messages.world_save).await;
        }
        if self.channel.send_command(&shutdown.save_command, false).await {
            tokio::select! {
                _ = self.cancel.cancelled() => return true,
                _ = tokio::time::sleep(shutdown.world_save_delay) => {}
            }
        }
        false
    }

    async fn final_warning(&self, profile: &Profile, request: &ShutdownRequest) {
        let stopping = &self.config.shutdown.messages.stopping;
        if stopping.is_empty() {
            return;
        }
        let body = self.with_reason(stopping, request);
        self.notifier
            .alert(AlertCategory::ShutdownMessage, &profile.id, &body)
            .await;
        self.channel.broadcast(&body).await;
    }

    /// Termination escalation ladder. Each step gets one bounded wait
    /// before falling through to the next; no step is repeated.
    pub(crate) async fn terminate(
        &self,
        profile: &Profile,
        handle: &ProcessHandle,
    ) -> SequencerState {
        let shutdown = &self.config.shutdown;
        let step_timeout = shutdown.step_timeout;

        // Step 1: graceful shutdown command over the control client.
        if profile.control_enabled
            && shutdown.use_shutdown_command
            && !shutdown.shutdown_command.is_empty()
        {
            let sent = self
                .channel
                .send_command(&shutdown.shutdown_command, false)
                .await;
            if sent {
                tokio::time::sleep(shutdown.command_settle_delay).await;
                if self.driver.wait_for_exit(handle, step_timeout).await {
                    info!(profile = %profile.id, "server exited on shutdown command");
                    return SequencerState::Stopped;
                }
            }
            warn!(profile = %profile.id, "shutdown command did not stop the server, escalating");
        }

        // Step 2: graceful close request.
        if self.driver.request_close(handle)
            && self.driver.wait_for_exit(handle, step_timeout).await
        {
            info!(profile = %profile.id, "server closed gracefully");
            return SequencerState::Stopped;
        }
        warn!(profile = %profile.id, "close request did not stop the server, escalating");

        // Step 3: interrupt signal.
        if self.driver.send_interrupt(handle)
            && self.driver.wait_for_exit(handle, step_timeout).await
        {
            info!(profile = %profile.id, "server stopped on interrupt");
            return SequencerState::Stopped;
        }
        warn!(profile = %profile.id, "interrupt did not stop the server, escalating");

        // Step 4: forceful kill.
        self.driver.kill(handle);
        if self.driver.wait_for_exit(handle, step_timeout).await {
            info!(profile = %profile.id, "server killed");
            return SequencerState::Stopped;
        }

        warn!(profile = %profile.id, "killing the server timed out");
        SequencerState::TimedOut
    }

    async fn after_stop(&self, profile: &mut Profile, request: &ShutdownRequest) -> Result<()> {
        verify_world_file(profile, &self.config.paths)?;
        self.notifier
            .alert(
                AlertCategory::Shutdown,
                &profile.id,
                &format!("server stopped for {} operation", request.operation),
            )
            .await;
        Ok(())
    }

    async fn cancelled_exit(&self, profile: &Profile) -> SequencerState {
        info!(profile = %profile.id, "shutdown cancelled");
        let cancel_message = &self.config.shutdown.messages.cancel;
        if !cancel_message.is_empty() {
            self.notifier
                .alert(AlertCategory::Shutdown, &profile.id, cancel_message)
                .await;
            self.channel.broadcast(cancel_message).await;
        }
        SequencerState::Cancelled
    }

    fn with_reason(&self, body: &str, request: &ShutdownRequest) -> String {
        match &request.reason {
            Some(reason)
                if self.config.shutdown.all_messages_show_reason
                    && !reason.trim().is_empty() =>
            {
                format!("{body}\n{reason}")
            }
            _ => body.to_owned(),
        }
    }
}
