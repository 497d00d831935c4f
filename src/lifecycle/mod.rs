//! Lifecycle supervision: the monitors that decide when the instance has
//! outlived its usefulness, and the shutdown action they trigger.
//!
//! Each monitor is a single long-running task. They share the
//! [`SharedState`] cells and coordinate only through the shutdown flag.

pub mod inactivity;
pub mod spot;
pub mod uptime;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::config::LifecycleConfig;
use crate::error::LifecycleError;
use crate::notifier::{EventKind, Notifier};
use crate::state::SharedState;
use crate::status::StatusAggregator;

pub use self::inactivity::InactivityMonitor;
pub use self::spot::SpotMonitor;
pub use self::uptime::UptimeMonitor;

/// Intervals used by the monitors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    /// Inactivity check period.
    pub activity_tick: Duration,
    /// Wait between the inactivity notification and the shutdown action.
    pub inactivity_grace: Duration,
    /// Lead time of the max-uptime notification before the shutdown action.
    pub uptime_warning: Duration,
    pub spot_poll: Duration,
    /// How long the flag stays set after an interruption notice.
    pub spot_cooldown: Duration,
    pub spot_request_timeout: Duration,
    /// Service health check period.
    pub health_tick: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            activity_tick: Duration::from_secs(60),
            inactivity_grace: Duration::from_secs(60),
            uptime_warning: Duration::from_secs(60),
            spot_poll: Duration::from_secs(30),
            spot_cooldown: Duration::from_secs(120),
            spot_request_timeout: Duration::from_secs(30),
            health_tick: Duration::from_secs(60),
        }
    }
}

/// The terminal action run when the instance must go away.
#[async_trait]
pub trait ShutdownAction: Send + Sync {
    /// Run the action and return its combined output.
    async fn execute(&self) -> Result<String, LifecycleError>;
}

/// Runs an external command, split on whitespace into program and args.
#[derive(Debug, Clone)]
pub struct CommandShutdown {
    command: String,
}

impl CommandShutdown {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl ShutdownAction for CommandShutdown {
    async fn execute(&self) -> Result<String, LifecycleError> {
        let mut parts = self.command.split_whitespace();
        let program = parts.next().ok_or(LifecycleError::EmptyCommand)?;
        let output = tokio::process::Command::new(program)
            .args(parts)
            .output()
            .await
            .map_err(|e| LifecycleError::CommandFailed {
                command: self.command.clone(),
                reason: e.to_string(),
            })?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        if output.status.success() {
            Ok(combined)
        } else {
            Err(LifecycleError::CommandExit {
                command: self.command.clone(),
                status: output.status.to_string(),
                output: combined,
            })
        }
    }
}

/// Everything a monitor needs, cloned into each monitor task.
#[derive(Clone)]
pub struct Supervisor {
    pub state: Arc<SharedState>,
    pub status: Arc<StatusAggregator>,
    pub notifier: Notifier,
    pub action: Arc<dyn ShutdownAction>,
    pub timing: Timing,
}

impl Supervisor {
    /// Collect a fresh snapshot and dispatch an event, without waiting.
    pub fn notify_async(&self, kind: EventKind, detail: Option<String>) {
        if self.notifier.is_empty() {
            return;
        }
        let status = self.status.clone();
        let notifier = self.notifier.clone();
        tokio::spawn(async move {
            let snapshot = status.collect().await;
            notifier.notify(kind, snapshot, detail);
        });
    }

    /// Run the shutdown action once and log the outcome. Never retried.
    pub async fn shutdown_now(&self) {
        match self.action.execute().await {
            Ok(output) => {
                tracing::info!(output = %output.trim(), "Shutdown command issued")
            }
            Err(e) => tracing::error!(error = %e, "Could not shut the instance down"),
        }
    }

    /// Spawn the monitors enabled by `config`.
    ///
    /// The spot monitor only runs when `spot_enabled`, since its only
    /// effects are a notification and a transient flag.
    pub fn spawn_monitors(
        &self,
        config: &LifecycleConfig,
        spot_enabled: bool,
    ) -> Result<Vec<JoinHandle<()>>, LifecycleError> {
        let mut handles = Vec::new();
        if let Some(max) = config.max_inactivity {
            let monitor = InactivityMonitor::new(self.clone(), max)
                .with_debug(config.debug_activity)
                .with_shell_names(config.shell_names.clone());
            handles.push(tokio::spawn(monitor.run()));
        }
        if let Some(max) = config.max_uptime {
            handles.push(tokio::spawn(UptimeMonitor::new(self.clone(), max).run()));
        }
        if spot_enabled {
            let monitor = SpotMonitor::new(self.clone(), &config.spot_endpoint)?;
            handles.push(tokio::spawn(monitor.run()));
        }
        Ok(handles)
    }
}
