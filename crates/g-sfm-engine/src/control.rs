//! ---
//! sfm_section: "02-fleet-engine"
//! sfm_subsection: "module"
//! sfm_type: "source"
//! sfm_scope: "code"
//! sfm_description: "Fleet orchestration engine: locks, shutdown, updates, backup, scheduling."
//! sfm_version: "v0.0.0-prealpha"
//! sfm_owner: "tbd"
//! ---
//! Query/control client seams.
//!
//! The wire protocol is an external collaborator; the engine only defines
//! the traits and the degradation rules. Connection or send failures never
//! propagate past [`ControlChannel`], they degrade to "command not sent."

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

/// Maximum send attempts when a retry was requested.
pub const CONTROL_MAX_ATTEMPTS: u32 = 3;

/// Remote text-command transport for one server instance.
#[async_trait]
pub trait ServerControl: Send + Sync {
    /// Send a command and return its response line, if any.
    async fn send(&self, command: &str) -> anyhow::Result<String>;
}

/// Player/server info query transport for one server instance.
#[async_trait]
pub trait ServerQuery: Send + Sync {
    /// Names of players currently online, blank names already filtered.
    async fn player_names(&self) -> anyhow::Result<Vec<String>>;
}

/// Disconnected default: every command fails, every query sees nobody.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullClient;

#[async_trait]
impl ServerControl for NullClient {
    async fn send(&self, command: &str) -> anyhow::Result<String> {
        anyhow::bail!("no control transport configured (command '{command}' dropped)")
    }
}

#[async_trait]
impl ServerQuery for NullClient {
    async fn player_names(&self) -> anyhow::Result<Vec<String>> {
        Ok(Vec::new())
    }
}

/// Builds control/query clients for one server endpoint. The engine asks
/// for fresh clients per run; pooling is the factory's business.
pub trait ControlClientFactory: Send + Sync {
    fn control(&self, host: &str, port: u16, password: &str) -> Arc<dyn ServerControl>;
    fn query(&self, host: &str, port: u16) -> Arc<dyn ServerQuery>;
}

/// Factory for installs without a control transport.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullClientFactory;

impl ControlClientFactory for NullClientFactory {
    fn control(&self, _host: &str, _port: u16, _password: &str) -> Arc<dyn ServerControl> {
        Arc::new(NullClient)
    }

    fn query(&self, _host: &str, _port: u16) -> Arc<dyn ServerQuery> {
        Arc::new(NullClient)
    }
}

/// Fallibility wrapper around a [`ServerControl`] transport.
#[derive(Clone)]
pub struct ControlChannel {
    control: Arc<dyn ServerControl>,
    broadcast_template: String,
    send_message_delay: Duration,
}

impl ControlChannel {
    pub fn new(
        control: Arc<dyn ServerControl>,
        broadcast_template: String,
        send_message_delay: Duration,
    ) -> Self {
        Self {
            control,
            broadcast_template,
            send_message_delay,
        }
    }

    /// Send a command; `retry` allows up to [`CONTROL_MAX_ATTEMPTS`] tries.
    /// All failures degrade to `false`.
    pub async fn send_command(&self, command: &str, retry: bool) -> bool {
        let attempts = if retry { CONTROL_MAX_ATTEMPTS } else { 1 };
        for attempt in 1..=attempts {
            match self.control.send(command).await {
                Ok(_) => {
                    debug!(command, attempt, "control command sent");
                    return true;
                }
                Err(err) => {
                    warn!(command, attempt, error = %err, "control command failed");
                }
            }
        }
        false
    }

    /// Broadcast a message to players: a single-attempt command followed by
    /// the configured settle delay when it was accepted.
    pub async fn broadcast(&self, message: &str) -> bool {
        let command = self.broadcast_template.replace("{message}", message);
        let sent = self.send_command(&command, false).await;
        if sent {
            tokio::time::sleep(self.send_message_delay).await;
        }
        sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct FlakyControl {
        calls: Mutex<u32>,
        fail_first: u32,
    }

    #[async_trait]
    impl ServerControl for FlakyControl {
        async fn send(&self, _command: &str) -> anyhow::Result<String> {
            let mut calls = self.calls.lock();
            *calls += 1;
            if *calls <= self.fail_first {
                anyhow::bail!("connection refused");
            }
            Ok(String::new())
        }
    }

    fn channel(control: Arc<dyn ServerControl>) -> ControlChannel {
        ControlChannel::new(control, "Broadcast {message}".to_owned(), Duration::ZERO)
    }

    #[tokio::test]
    async fn retry_recovers_from_transient_failures() {
        let control = Arc::new(FlakyControl {
            fail_first: 2,
            ..Default::default()
        });
        let sent = channel(control.clone()).send_command("SaveWorld", true).await;
        assert!(sent);
        assert_eq!(*control.calls.lock(), 3);
    }

    #[tokio::test]
    async fn no_retry_means_single_attempt() {
        let control = Arc::new(FlakyControl {
            fail_first: 1,
            ..Default::default()
        });
        let sent = channel(control.clone()).send_command("SaveWorld", false).await;
        assert!(!sent);
        assert_eq!(*control.calls.lock(), 1);
    }

    #[tokio::test]
    async fn null_client_degrades_to_not_sent() {
        let sent = channel(Arc::new(NullClient)).broadcast("hello").await;
        assert!(!sent);
    }
}
