//! Notification delivery.
//!
//! The daemon never talks to a push service itself. When a stage fires it
//! hands a [`Notification`] to a [`Notifier`]; whatever that does, its
//! failures are logged by the caller and never touch daemon state.

mod command;

pub use command::CommandNotifier;

use crate::config::NotifyConfig;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Priority at and above which the urgent title is used.
pub const URGENT_PRIORITY: i8 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub escalation_id: String,
    pub title: String,
    pub message: String,
    pub priority: i8,
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("notifier command not found: {0}")]
    NotFound(String),
    #[error("failed to run notifier: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("notifier timed out after {0:?}")]
    TimedOut(Duration),
    #[error("notifier exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },
    #[error("{0}")]
    Other(String),
}

/// Performs the actual push for a fired stage.
pub trait Notifier: Send + Sync {
    fn deliver(&self, notification: &Notification) -> Result<(), DeliveryError>;
}

impl<F> Notifier for F
where
    F: Fn(&Notification) -> Result<(), DeliveryError> + Send + Sync,
{
    fn deliver(&self, notification: &Notification) -> Result<(), DeliveryError> {
        self(notification)
    }
}

/// Fallback when no notifier command is configured: record the notification
/// in the diagnostic log and report success.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn deliver(&self, notification: &Notification) -> Result<(), DeliveryError> {
        info!(
            escalation_id = %notification.escalation_id,
            priority = notification.priority,
            title = %notification.title,
            "Notification (no notifier command configured): {}",
            notification.message
        );
        Ok(())
    }
}

/// Titles used for normal and urgent stages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Titles {
    pub normal: String,
    pub urgent: String,
}

impl Titles {
    pub fn from_config(config: &NotifyConfig) -> Self {
        Self {
            normal: config.title.clone(),
            urgent: config.urgent_title.clone(),
        }
    }

    pub fn for_priority(&self, priority: i8) -> &str {
        if priority >= URGENT_PRIORITY {
            &self.urgent
        } else {
            &self.normal
        }
    }
}

impl Default for Titles {
    fn default() -> Self {
        Self::from_config(&NotifyConfig::default())
    }
}

/// Build the notifier described by `config`.
pub fn from_config(config: &NotifyConfig) -> Arc<dyn Notifier> {
    match &config.command {
        Some(program) => Arc::new(CommandNotifier::from_config(program, config)),
        None => Arc::new(LogNotifier),
    }
}
