//! Notification sink.
//!
//! Delivery (push, SMS, email) lives outside this crate. The lifecycle
//! service hands each recipient's notification to a [`NotificationSink`]
//! after state is committed; a failed send is logged and counted, never
//! propagated.

use std::collections::HashSet;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

/// What happened, from the recipient's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationEvent {
    /// A guardian's ward raised an SOS.
    SosAlert,
    /// A helper is asked to respond.
    HelperRequested,
    /// A helper accepted (to the owner).
    HelperAccepted,
    /// A helper is on the way (to the owner).
    HelperArriving,
    /// A helper arrived (to the owner).
    HelperArrived,
    /// The emergency was resolved.
    EmergencyResolved,
    /// The emergency timed out without a response.
    EmergencyExpired,
}

impl NotificationEvent {
    /// Returns the wire identifier.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::SosAlert => "sos_alert",
            Self::HelperRequested => "helper_requested",
            Self::HelperAccepted => "helper_accepted",
            Self::HelperArriving => "helper_arriving",
            Self::HelperArrived => "helper_arrived",
            Self::EmergencyResolved => "emergency_resolved",
            Self::EmergencyExpired => "emergency_expired",
        }
    }
}

impl fmt::Display for NotificationEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Send failures.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum NotifyError {
    /// The recipient could not be reached.
    #[error("notification to {recipient_id} rejected: {reason}")]
    Rejected {
        /// Recipient.
        recipient_id: String,
        /// Failure detail.
        reason: String,
    },

    /// The delivery backend is down.
    #[error("notification backend unavailable: {reason}")]
    Unavailable {
        /// Failure detail.
        reason: String,
    },
}

/// Destination for lifecycle notifications.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Sends one notification.
    ///
    /// # Errors
    ///
    /// Returns `NotifyError` if the notification was not accepted for
    /// delivery.
    async fn notify(
        &self,
        recipient_id: &str,
        event: NotificationEvent,
        payload: &serde_json::Value,
    ) -> Result<(), NotifyError>;
}

/// Writes every notification to the log. Production default while delivery
/// is handled by a separate service tailing these events.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotificationSink;

#[async_trait]
impl NotificationSink for LogNotificationSink {
    async fn notify(
        &self,
        recipient_id: &str,
        event: NotificationEvent,
        payload: &serde_json::Value,
    ) -> Result<(), NotifyError> {
        tracing::info!(
            recipient_id,
            event = %event,
            payload = %payload,
            "notification emitted"
        );
        Ok(())
    }
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotificationSink;

#[async_trait]
impl NotificationSink for NoopNotificationSink {
    async fn notify(
        &self,
        _recipient_id: &str,
        _event: NotificationEvent,
        _payload: &serde_json::Value,
    ) -> Result<(), NotifyError> {
        Ok(())
    }
}

/// A notification captured by [`RecordingNotificationSink`].
#[derive(Debug, Clone, PartialEq)]
pub struct SentNotification {
    /// Recipient.
    pub recipient_id: String,
    /// Event.
    pub event: NotificationEvent,
    /// Payload.
    pub payload: serde_json::Value,
}

/// Test double that records successful sends and fails for chosen
/// recipients.
#[derive(Debug, Default)]
pub struct RecordingNotificationSink {
    sent: Mutex<Vec<SentNotification>>,
    failing: HashSet<String>,
    delay: Option<Duration>,
}

impl RecordingNotificationSink {
    /// Creates a sink that accepts everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes sends to `recipient_id` fail.
    #[must_use]
    pub fn failing_for(mut self, recipient_id: impl Into<String>) -> Self {
        self.failing.insert(recipient_id.into());
        self
    }

    /// Sleeps this long before each send.
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Returns every successful send, in order.
    #[must_use]
    pub fn sent(&self) -> Vec<SentNotification> {
        self.sent
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Returns the events delivered to `recipient_id`, in order.
    #[must_use]
    pub fn events_for(&self, recipient_id: &str) -> Vec<NotificationEvent> {
        self.sent()
            .into_iter()
            .filter(|n| n.recipient_id == recipient_id)
            .map(|n| n.event)
            .collect()
    }
}

#[async_trait]
impl NotificationSink for RecordingNotificationSink {
    async fn notify(
        &self,
        recipient_id: &str,
        event: NotificationEvent,
        payload: &serde_json::Value,
    ) -> Result<(), NotifyError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.contains(recipient_id) {
            return Err(NotifyError::Rejected {
                recipient_id: recipient_id.to_string(),
                reason: "recipient configured to fail".to_string(),
            });
        }
        self.sent
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(SentNotification {
                recipient_id: recipient_id.to_string(),
                event,
                payload: payload.clone(),
            });
        Ok(())
    }
}
