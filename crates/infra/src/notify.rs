//! Outbound notification delivery.
//!
//! Delivery is best effort. Callers log a failed trigger and move on; a
//! notification is never a reason to roll back or retry the work that caused
//! it.

use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::info;

use civitas_core::UserId;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NotifyError {
    #[error("notification provider unavailable: {0}")]
    Unavailable(String),

    #[error("notification rejected: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecipientStatus {
    pub recipient: UserId,
    pub delivered: bool,
}

pub trait NotificationProvider: Send + Sync {
    /// Trigger workflow `key` for every recipient with the same payload.
    fn trigger_workflow(
        &self,
        key: &str,
        recipients: &[UserId],
        data: &JsonValue,
    ) -> Result<Vec<RecipientStatus>, NotifyError>;
}

impl<P> NotificationProvider for Arc<P>
where
    P: NotificationProvider + ?Sized,
{
    fn trigger_workflow(
        &self,
        key: &str,
        recipients: &[UserId],
        data: &JsonValue,
    ) -> Result<Vec<RecipientStatus>, NotifyError> {
        (**self).trigger_workflow(key, recipients, data)
    }
}

/// Writes each trigger to the log. Used by the worker when no provider is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingNotificationProvider;

impl NotificationProvider for LoggingNotificationProvider {
    fn trigger_workflow(
        &self,
        key: &str,
        recipients: &[UserId],
        data: &JsonValue,
    ) -> Result<Vec<RecipientStatus>, NotifyError> {
        info!(workflow = key, recipients = recipients.len(), %data, "notification triggered");
        Ok(recipients
            .iter()
            .map(|&recipient| RecipientStatus {
                recipient,
                delivered: true,
            })
            .collect())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TriggeredWorkflow {
    pub key: String,
    pub recipients: Vec<UserId>,
    pub data: JsonValue,
}

/// Keeps every trigger in memory; can be switched to fail.
#[derive(Debug, Default)]
pub struct RecordingNotificationProvider {
    triggered: Mutex<Vec<TriggeredWorkflow>>,
    failing: bool,
}

impl RecordingNotificationProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call returns [`NotifyError::Unavailable`] and records nothing.
    pub fn failing() -> Self {
        Self {
            triggered: Mutex::default(),
            failing: true,
        }
    }

    pub fn triggered(&self) -> Vec<TriggeredWorkflow> {
        self.triggered
            .lock()
            .map(|triggered| triggered.clone())
            .unwrap_or_default()
    }
}

impl NotificationProvider for RecordingNotificationProvider {
    fn trigger_workflow(
        &self,
        key: &str,
        recipients: &[UserId],
        data: &JsonValue,
    ) -> Result<Vec<RecipientStatus>, NotifyError> {
        if self.failing {
            return Err(NotifyError::Unavailable("provider offline".into()));
        }
        let mut triggered = self
            .triggered
            .lock()
            .map_err(|_| NotifyError::Unavailable("recorder lock poisoned".into()))?;
        triggered.push(TriggeredWorkflow {
            key: key.to_string(),
            recipients: recipients.to_vec(),
            data: data.clone(),
        });
        Ok(recipients
            .iter()
            .map(|&recipient| RecipientStatus {
                recipient,
                delivered: true,
            })
            .collect())
    }
}
