//! Service health monitor.
//!
//! Re-derives status once per tick and reports up/down edges of the
//! required services as a single aggregate notification.

use crate::lifecycle::Supervisor;
use crate::notifier::EventKind;
use crate::status::StatusSnapshot;

/// Services watched for transitions, in signal order.
pub const SERVICES: [&str; 4] = ["database", "helper", "plugin", "ingest"];

/// Edge reported for one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Down,
    Up,
}

impl Transition {
    pub fn event_kind(self) -> EventKind {
        match self {
            Self::Down => EventKind::ServiceDown,
            Self::Up => EventKind::ServiceUp,
        }
    }
}

/// "Is down" signals derived from a snapshot.
///
/// The pipeline only counts as down when it is not running and has not
/// finished both log processing and collect-info processing.
pub fn down_signals(status: &StatusSnapshot) -> [bool; 4] {
    let steps = &status.ingest.complete_steps;
    [
        !status.database_running,
        !status.helper_running,
        !status.plugin_running,
        !status.ingest.running && !(steps.process_logs && steps.process_collect_info),
    ]
}

/// Last known running state of each service. Starts as all running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceHistory {
    running: [bool; 4],
}

impl Default for ServiceHistory {
    fn default() -> Self {
        Self {
            running: [true; 4],
        }
    }
}

impl ServiceHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn running(&self) -> [bool; 4] {
        self.running
    }

    /// Fold in a snapshot. A down edge on any service wins over up edges.
    pub fn observe(&mut self, status: &StatusSnapshot) -> Option<Transition> {
        let mut down = false;
        let mut up = false;
        for (i, stopped) in down_signals(status).into_iter().enumerate() {
            if stopped && self.running[i] {
                tracing::warn!(service = SERVICES[i], "Service stopped");
                down = true;
            } else if !stopped && !self.running[i] {
                tracing::info!(service = SERVICES[i], "Service started");
                up = true;
            }
            self.running[i] = !stopped;
        }
        if down {
            Some(Transition::Down)
        } else if up {
            Some(Transition::Up)
        } else {
            None
        }
    }
}

pub struct HealthMonitor {
    sup: Supervisor,
    history: ServiceHistory,
}

impl HealthMonitor {
    pub fn new(sup: Supervisor) -> Self {
        Self {
            sup,
            history: ServiceHistory::new(),
        }
    }

    pub async fn run(mut self) {
        tracing::info!("Service health monitor started");
        loop {
            tokio::time::sleep(self.sup.timing.health_tick).await;
            if self.sup.state.shutdown.is_set() {
                tracing::debug!("Shutting down, skipping service health check");
                continue;
            }
            let snapshot = self.sup.status.collect().await;
            if let Some(transition) = self.history.observe(&snapshot) {
                self.sup
                    .notifier
                    .notify(transition.event_kind(), snapshot, None);
            }
        }
    }
}
