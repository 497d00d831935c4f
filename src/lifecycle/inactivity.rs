//! Inactivity monitor.

use std::path::Path;
use std::time::Duration;

use super::Supervisor;
use crate::notifier::EventKind;
use crate::status::process::ProcessTable;

/// What kept the instance busy on a given tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivitySource {
    IngestRunning,
    TerminalConnections(u64),
    Shell { pid: u32 },
}

/// Powers the instance off after a period with no activity.
pub struct InactivityMonitor {
    sup: Supervisor,
    max_inactivity: Duration,
    debug: bool,
    shell_names: Vec<String>,
}

impl InactivityMonitor {
    pub fn new(sup: Supervisor, max_inactivity: Duration) -> Self {
        Self {
            sup,
            max_inactivity,
            debug: false,
            shell_names: vec!["bash".to_string()],
        }
    }

    /// Log every tick at info level.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_shell_names(mut self, names: Vec<String>) -> Self {
        self.shell_names = names;
        self
    }

    /// Check the activity signals in order, returning the first one found.
    pub fn detect_activity(&self) -> Option<ActivitySource> {
        probe(
            &self.sup.status.paths().ingest_pid,
            self.sup.state.connections.get(),
            self.sup.status.processes().as_ref(),
            &self.shell_names,
        )
    }

    /// Run until the shutdown action has been invoked.
    pub async fn run(self) {
        tracing::info!(
            max_inactivity = %humantime::format_duration(self.max_inactivity),
            "Inactivity monitor started"
        );
        let mut last_seen = None;
        loop {
            tokio::time::sleep(self.sup.timing.activity_tick).await;

            if let Some(source) = self.detect().await {
                self.sup.state.activity.touch();
                if self.debug {
                    tracing::info!(?source, "Activity detected");
                }
                continue;
            }

            let last = self.sup.state.activity.get();
            let idle = last.elapsed();
            if self.debug {
                tracing::info!(
                    idle = %humantime::format_duration(truncate(idle)),
                    max_inactivity = %humantime::format_duration(self.max_inactivity),
                    "No activity detected"
                );
            }
            if idle > self.max_inactivity {
                self.shut_down().await;
                return;
            }
            if last_seen != Some(last) {
                last_seen = Some(last);
                let remaining = self.max_inactivity.saturating_sub(idle);
                tracing::debug!(
                    shutdown_in = %humantime::format_duration(truncate(remaining)),
                    "Inactivity shutdown rescheduled"
                );
            }
        }
    }

    async fn shut_down(&self) {
        tracing::warn!(
            max_inactivity = %humantime::format_duration(self.max_inactivity),
            "Max inactivity reached, shutting instance down"
        );
        if self.sup.state.shutdown.is_set() {
            tracing::info!("Shutdown already announced, skipping inactivity notification");
        } else {
            self.sup.notify_async(EventKind::InactivityShutdown, None);
        }
        tokio::time::sleep(self.sup.timing.inactivity_grace).await;
        self.sup.state.shutdown.set();
        self.sup.shutdown_now().await;
    }

    async fn detect(&self) -> Option<ActivitySource> {
        // The process table walk and file probe are blocking.
        let ingest_pid = self.sup.status.paths().ingest_pid.clone();
        let connections = self.sup.state.connections.get();
        let processes = self.sup.status.processes().clone();
        let shells = self.shell_names.clone();
        let task = tokio::task::spawn_blocking(move || {
            probe(&ingest_pid, connections, processes.as_ref(), &shells)
        });
        match task.await {
            Ok(source) => source,
            Err(e) => {
                tracing::error!(error = %e, "Activity probe failed");
                None
            }
        }
    }
}

fn probe(
    ingest_pid: &Path,
    connections: u64,
    table: &dyn ProcessTable,
    shells: &[String],
) -> Option<ActivitySource> {
    if ingest_pid.exists() {
        return Some(ActivitySource::IngestRunning);
    }
    if connections != 0 {
        return Some(ActivitySource::TerminalConnections(connections));
    }
    find_shell(table, shells).map(|pid| ActivitySource::Shell { pid })
}

/// First interactive shell other than PID 1.
fn find_shell(table: &dyn ProcessTable, names: &[String]) -> Option<u32> {
    table
        .list()
        .into_iter()
        .find(|p| p.pid != 1 && names.iter().any(|n| *n == p.name))
        .map(|p| p.pid)
}

fn truncate(duration: Duration) -> Duration {
    Duration::from_secs(duration.as_secs())
}
