//! Lifecycle notifications.
//!
//! A [`Notifier`] fans each [`NotificationEvent`] out to every configured
//! [`NotificationSink`] on its own task. Delivery is best effort: failures
//! are logged and dropped.

pub mod slack;
pub mod webhook;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{AgiPaths, IngestSources, NotifierConfig};
use crate::error::NotifyError;
use crate::status::StatusSnapshot;

pub use self::slack::SlackSink;
pub use self::webhook::WebhookSink;

/// What happened to the instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    InactivityShutdown,
    MaxAgeShutdown,
    SpotInterruption,
    ServiceDown,
    ServiceUp,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InactivityShutdown => "INACTIVITY_SHUTDOWN",
            Self::MaxAgeShutdown => "MAX_AGE_SHUTDOWN",
            Self::SpotInterruption => "SPOT_INTERRUPTION",
            Self::ServiceDown => "SERVICE_DOWN",
            Self::ServiceUp => "SERVICE_UP",
        }
    }

    /// Closing line of the chat summary.
    pub fn sentence(self) -> &'static str {
        match self {
            Self::InactivityShutdown => "Max inactivity reached, shutting instance down",
            Self::MaxAgeShutdown => "Max age reached, shutting down",
            Self::SpotInterruption => {
                "AWS Shutting spot instance down due to capacity restrictions"
            }
            Self::ServiceDown => {
                "A required service has quit unexpectedly, check: aerolab agi status"
            }
            Self::ServiceUp => {
                "A required service has started back up, check: aerolab agi status"
            }
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One notification, shared read-only by every sink.
///
/// Serializes to the webhook payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationEvent {
    #[serde(rename = "event")]
    pub kind: EventKind,
    pub agi_name: String,
    pub is_data_in_memory: bool,
    pub ingest_status: StatusSnapshot,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_detail: Option<String>,
}

/// A destination for notifications.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    async fn send(&self, event: &NotificationEvent) -> Result<(), NotifyError>;
}

/// Fire-and-forget dispatcher.
#[derive(Clone)]
pub struct Notifier {
    agi_name: String,
    data_in_memory: bool,
    sinks: Vec<Arc<dyn NotificationSink>>,
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("agi_name", &self.agi_name)
            .field("data_in_memory", &self.data_in_memory)
            .field(
                "sinks",
                &self.sinks.iter().map(|s| s.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl Notifier {
    pub fn new(agi_name: impl Into<String>, data_in_memory: bool) -> Self {
        Self {
            agi_name: agi_name.into(),
            data_in_memory,
            sinks: Vec::new(),
        }
    }

    /// A notifier with no sinks; every dispatch is a no-op.
    pub fn disabled() -> Self {
        Self::new("", false)
    }

    pub fn with_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Build sinks from the instance's notifier file.
    ///
    /// A sink that cannot be constructed is logged and left out. The
    /// pipeline source description is only read when a chat sink exists.
    pub fn from_config(
        agi_name: &str,
        config: &NotifierConfig,
        paths: &AgiPaths,
        data_in_memory: bool,
    ) -> Self {
        let mut notifier = Self::new(agi_name, data_in_memory);

        if let Some(endpoint) = config.webhook_endpoint() {
            match WebhookSink::new(endpoint, &config.headers) {
                Ok(sink) => notifier = notifier.with_sink(Arc::new(sink)),
                Err(e) => tracing::error!(error = %e, "Webhook notifications disabled"),
            }
        }

        if config.slack_enabled() {
            let sources = match IngestSources::load(&paths.ingest_config) {
                Ok(sources) => sources.summary_lines(),
                Err(e) => {
                    tracing::warn!(error = %e, "Could not load ingest config for chat notifications");
                    Vec::new()
                }
            };
            let owner = std::fs::read_to_string(&paths.owner).unwrap_or_default();
            match SlackSink::from_config(config, agi_name, paths.label.clone(), owner, sources) {
                Ok(sink) => notifier = notifier.with_sink(Arc::new(sink)),
                Err(e) => tracing::error!(error = %e, "Chat notifications disabled"),
            }
        }

        notifier
    }

    pub fn agi_name(&self) -> &str {
        &self.agi_name
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    pub fn event(
        &self,
        kind: EventKind,
        status: StatusSnapshot,
        detail: Option<String>,
    ) -> NotificationEvent {
        NotificationEvent {
            kind,
            agi_name: self.agi_name.clone(),
            is_data_in_memory: self.data_in_memory,
            ingest_status: status,
            event_detail: detail,
        }
    }

    /// Build an event and dispatch it.
    pub fn notify(&self, kind: EventKind, status: StatusSnapshot, detail: Option<String>) {
        self.dispatch(self.event(kind, status, detail));
    }

    /// Send `event` to every sink on its own task. Never blocks, never fails.
    pub fn dispatch(&self, event: NotificationEvent) {
        if self.sinks.is_empty() {
            return;
        }
        tracing::info!(event = %event.kind, sinks = self.sinks.len(), "Dispatching notification");
        let event = Arc::new(event);
        for sink in &self.sinks {
            let sink = sink.clone();
            let event = event.clone();
            tokio::spawn(async move {
                match sink.send(&event).await {
                    Ok(()) => tracing::debug!(sink = sink.name(), event = %event.kind, "Notification sent"),
                    Err(e) => tracing::warn!(
                        sink = sink.name(),
                        event = %event.kind,
                        error = %e,
                        "Notification failed"
                    ),
                }
            });
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use tokio::sync::mpsc;

    use super::*;

    /// Sink that forwards every event into a channel.
    pub struct RecordingSink {
        tx: mpsc::UnboundedSender<NotificationEvent>,
    }

    impl RecordingSink {
        pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<NotificationEvent>) {
            let (tx, rx) = mpsc::unbounded_channel();
            (Arc::new(Self { tx }), rx)
        }
    }

    #[async_trait]
    impl NotificationSink for RecordingSink {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn send(&self, event: &NotificationEvent) -> Result<(), NotifyError> {
            let _ = self.tx.send(event.clone());
            Ok(())
        }
    }
}
