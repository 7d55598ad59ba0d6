//! ---
//! sfm_section: "04-integration-tests"
//! sfm_subsection: "integration-tests"
//! sfm_type: "source"
//! sfm_scope: "code"
//! sfm_description: "Integration and validation tests for the G-SFM stack."
//! sfm_version: "v0.0.0-prealpha"
//! sfm_owner: "tbd"
//! ---
//! Shutdown sequencer end to end against scripted process and control
//! fakes, with millisecond ticks standing in for the minute cadence.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use g_sfm_common::config::GlobalConfig;
use g_sfm_engine::command::OperationKind;
use g_sfm_engine::control::{ControlChannel, NullClient, ServerControl};
use g_sfm_engine::notify::Notifier;
use g_sfm_engine::process::{ProcessDriver, ProcessHandle};
use g_sfm_engine::profile::{Branch, Profile};
use g_sfm_engine::shutdown::{SequencerState, ShutdownRequest, ShutdownSequencer};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct RecordingControl {
    sent: Mutex<Vec<String>>,
}

#[async_trait]
impl ServerControl for RecordingControl {
    async fn send(&self, command: &str) -> anyhow::Result<String> {
        self.sent.lock().push(command.to_owned());
        Ok(String::new())
    }
}

/// Driver for a server that stops as soon as it is asked to.
struct CompliantDriver;

#[async_trait]
impl ProcessDriver for CompliantDriver {
    fn find(&self, expected_exe: &Path) -> Option<ProcessHandle> {
        Some(ProcessHandle {
            pid: 7777,
            exe: expected_exe.to_path_buf(),
        })
    }

    async fn wait_for_exit(&self, _handle: &ProcessHandle, _timeout: Duration) -> bool {
        true
    }

    fn request_close(&self, _handle: &ProcessHandle) -> bool {
        true
    }

    fn send_interrupt(&self, _handle: &ProcessHandle) -> bool {
        true
    }

    fn kill(&self, _handle: &ProcessHandle) -> bool {
        true
    }

    async fn launch(&self, _launcher: &Path, _workdir: &Path) -> g_sfm_engine::Result<()> {
        Ok(())
    }
}

fn fast_config() -> GlobalConfig {
    let mut config = GlobalConfig::default();
    config.shutdown.tick = Duration::from_millis(5);
    config.shutdown.send_message_delay = Duration::ZERO;
    config.shutdown.world_save_delay = Duration::from_millis(1);
    config.shutdown.command_settle_delay = Duration::from_millis(1);
    config.shutdown.step_timeout = Duration::from_millis(5);
    config
}

fn profile() -> Profile {
    Profile {
        id: "alpha".to_owned(),
        name: "Alpha".to_owned(),
        install_directory: PathBuf::from("/srv/alpha"),
        map: "island".to_owned(),
        branch: Branch::new("public"),
        ip: None,
        query_port: 27015,
        control_port: 27020,
        control_password: Some("secret".to_owned()),
        control_enabled: true,
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
    }
}

fn sequencer(
    config: &GlobalConfig,
    control: Arc<RecordingControl>,
    cancel: CancellationToken,
) -> ShutdownSequencer {
    let channel = ControlChannel::new(
        control,
        config.shutdown.broadcast_template.clone(),
        config.shutdown.send_message_delay,
    );
    ShutdownSequencer::new(
        Arc::new(config.clone()),
        Arc::new(CompliantDriver),
        channel,
        Arc::new(NullClient),
        Notifier::new(config.notify.clone()),
        cancel,
    )
}

#[tokio::test]
async fn full_sequence_counts_down_saves_and_stops() {
    let config = fast_config();
    let control = Arc::new(RecordingControl::default());
    let seq = sequencer(&config, control.clone(), CancellationToken::new());
    let mut profile = profile();

    let request = ShutdownRequest {
        operation: OperationKind::Shutdown,
        grace_minutes: 3,
        reason: None,
        update_reason: None,
    };
    let state = seq.run(&mut profile, &request).await.unwrap();
    assert_eq!(state, SequencerState::Stopped);

    let sent = control.sent.lock().clone();
    // three countdown broadcasts: 3 minutes, 2 minutes, final warning
    let countdowns = sent
        .iter()
        .filter(|c| c.contains("shut down in") || c.contains("shutting down"))
        .count();
    assert!(countdowns >= 3, "countdown broadcasts missing: {sent:?}");
    assert!(sent.iter().any(|c| c.contains("3 minutes")));
    // world save command was issued before termination
    let save_pos = sent.iter().position(|c| c == "SaveWorld");
    let exit_pos = sent.iter().position(|c| c == "DoExit");
    assert!(save_pos.is_some(), "save command missing: {sent:?}");
    assert!(exit_pos.is_some(), "shutdown command missing: {sent:?}");
    assert!(save_pos < exit_pos);
    assert_eq!(sent.last().map(String::as_str), Some("DoExit"));
}

#[tokio::test]
async fn update_reason_rides_along_with_countdown_messages() {
    let config = fast_config();
    let control = Arc::new(RecordingControl::default());
    let seq = sequencer(&config, control.clone(), CancellationToken::new());
    let mut profile = profile();

    let request = ShutdownRequest {
        operation: OperationKind::Update,
        grace_minutes: 2,
        reason: None,
        update_reason: Some("Updates: server update, Better Maps".to_owned()),
    };
    let state = seq.run(&mut profile, &request).await.unwrap();
    assert_eq!(state, SequencerState::Stopped);

    let sent = control.sent.lock().clone();
    assert!(
        sent.iter()
            .any(|c| c.contains("shut down in") && c.contains("Better Maps")),
        "update reason not appended: {sent:?}"
    );
}

#[tokio::test]
async fn stop_operation_skips_the_countdown() {
    let config = fast_config();
    let control = Arc::new(RecordingControl::default());
    let seq = sequencer(&config, control.clone(), CancellationToken::new());
    let mut profile = profile();

    let request = ShutdownRequest {
        operation: OperationKind::Stop,
        grace_minutes: 10,
        reason: None,
        update_reason: None,
    };
    let state = seq.run(&mut profile, &request).await.unwrap();
    assert_eq!(state, SequencerState::Stopped);

    let sent = control.sent.lock().clone();
    assert!(
        !sent.iter().any(|c| c.contains("shut down in")),
        "stop must not count down: {sent:?}"
    );
}

#[tokio::test]
async fn cancellation_broadcasts_the_cancel_notice() {
    let config = fast_config();
    let control = Arc::new(RecordingControl::default());
    let cancel = CancellationToken::new();
    cancel.cancel();
    let seq = sequencer(&config, control.clone(), cancel);
    let mut profile = profile();

    let request = ShutdownRequest {
        operation: OperationKind::Shutdown,
        grace_minutes: 5,
        reason: None,
        update_reason: None,
    };
    let state = seq.run(&mut profile, &request).await.unwrap();
    assert_eq!(state, SequencerState::Cancelled);

    let sent = control.sent.lock().clone();
    assert_eq!(sent.len(), 1, "only the cancel notice goes out: {sent:?}");
}

#[tokio::test]
async fn shutdown_reason_is_announced_once_up_front() {
    let config = fast_config();
    let control = Arc::new(RecordingControl::default());
    let seq = sequencer(&config, control.clone(), CancellationToken::new());
    let mut profile = profile();

    let request = ShutdownRequest {
        operation: OperationKind::Shutdown,
        grace_minutes: 10,
        reason: Some("maintenance".to_owned()),
        update_reason: None,
    };
    let state = seq.run(&mut profile, &request).await.unwrap();
    assert_eq!(state, SequencerState::Stopped);

    let sent = control.sent.lock().clone();
    let with_reason = sent.iter().filter(|c| c.contains("maintenance")).count();
    assert_eq!(with_reason, 1, "reason not announced exactly once: {sent:?}");
    // checkpoint at the full grace, then every minute from 5 down
    assert!(sent.iter().any(|c| c.contains("10 minutes")));
    for minute in ["5 minutes", "4 minutes", "3 minutes", "2 minutes"] {
        assert!(sent.iter().any(|c| c.contains(minute)), "missing {minute}: {sent:?}");
    }
    // minutes between the grace checkpoint and 5 are silent
    assert!(!sent.iter().any(|c| c.contains("9 minutes") || c.contains("8 minutes")));
}

#[tokio::test]
async fn reason_rides_on_every_message_when_configured() {
    let mut config = fast_config();
    config.shutdown.all_messages_show_reason = true;
    let control = Arc::new(RecordingControl::default());
    let seq = sequencer(&config, control.clone(), CancellationToken::new());
    let mut profile = profile();

    let request = ShutdownRequest {
        operation: OperationKind::Shutdown,
        grace_minutes: 10,
        reason: Some("maintenance".to_owned()),
        update_reason: None,
    };
    let state = seq.run(&mut profile, &request).await.unwrap();
    assert_eq!(state, SequencerState::Stopped);

    let sent = control.sent.lock().clone();
    assert!(
        sent.iter()
            .any(|c| c.contains("10 minutes") && c.contains("maintenance")),
        "grace checkpoint missing the reason: {sent:?}"
    );
}
