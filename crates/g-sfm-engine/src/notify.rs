//! ---
//! sfm_section: "02-fleet-engine"
//! sfm_subsection: "module"
//! sfm_type: "source"
//! sfm_scope: "code"
//! sfm_description: "Fleet orchestration engine: locks, shutdown, updates, backup, scheduling."
//! sfm_version: "v0.0.0-prealpha"
//! sfm_owner: "tbd"
//! ---
//! Notification sinks.
//!
//! Alerts and emails are fire-and-forget from the engine's perspective:
//! sink failures are logged and swallowed, never escalated into the
//! outcome of the unit of work that raised them.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use g_sfm_common::config::NotifySettings;
use strum::Display;
use tracing::{info, warn};

/// Alert routing categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "kebab-case")]
pub enum AlertCategory {
    Startup,
    Shutdown,
    ShutdownReason,
    ShutdownMessage,
    UpdateResults,
    Backup,
    Error,
}

/// Categorized alert destination (chat webhooks, dashboards, ...).
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn alert(&self, category: AlertCategory, profile: &str, message: &str)
        -> anyhow::Result<()>;
}

/// Summary email destination.
#[async_trait]
pub trait EmailSink: Send + Sync {
    async fn email(
        &self,
        subject: &str,
        body: &str,
        attachment: Option<PathBuf>,
    ) -> anyhow::Result<()>;
}

/// Default sink: structured log lines only.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

#[async_trait]
impl AlertSink for TracingSink {
    async fn alert(
        &self,
        category: AlertCategory,
        profile: &str,
        message: &str,
    ) -> anyhow::Result<()> {
        info!(category = %category, profile, message, "alert");
        Ok(())
    }
}

#[async_trait]
impl EmailSink for TracingSink {
    async fn email(
        &self,
        subject: &str,
        body: &str,
        attachment: Option<PathBuf>,
    ) -> anyhow::Result<()> {
        info!(subject, body, attachment = ?attachment, "email");
        Ok(())
    }
}

/// Fire-and-forget wrapper owned by the fleet context.
#[derive(Clone)]
pub struct Notifier {
    settings: NotifySettings,
    alerts: Arc<dyn AlertSink>,
    email: Arc<dyn EmailSink>,
}

impl Notifier {
    pub fn new(settings: NotifySettings) -> Self {
        Self {
            settings,
            alerts: Arc::new(TracingSink),
            email: Arc::new(TracingSink),
        }
    }

    pub fn with_alert_sink(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.alerts = sink;
        self
    }

    pub fn with_email_sink(mut self, sink: Arc<dyn EmailSink>) -> Self {
        self.email = sink;
        self
    }

    pub async fn alert(&self, category: AlertCategory, profile: &str, message: &str) {
        if !self.settings.alerts_enabled {
            return;
        }
        if let Err(err) = self.alerts.alert(category, profile, message).await {
            warn!(category = %category, profile, error = %err, "alert sink failed");
        }
    }

    pub async fn email(&self, subject: &str, body: &str, attachment: Option<PathBuf>) {
        if !self.settings.email_enabled {
            return;
        }
        let attachment = if self.settings.attach_log {
            attachment
        } else {
            None
        };
        if let Err(err) = self.email.email(subject, body, attachment).await {
            warn!(subject, error = %err, "email sink failed");
        }
    }
}
