//! Spot interruption monitor.
//!
//! Polls the instance metadata service for a pending interruption. The
//! cloud provider terminates the instance itself, so this monitor only
//! announces the notice and holds the shutdown flag for a cooldown window.
//! If the instance is still alive afterwards the notice is treated as
//! cancelled and polling resumes.

use super::Supervisor;
use crate::error::LifecycleError;
use crate::notifier::EventKind;

const BODY_READ_ERROR: &str = "<ERROR:BODY READ ERROR>";

pub struct SpotMonitor {
    sup: Supervisor,
    endpoint: String,
    client: reqwest::Client,
}

impl SpotMonitor {
    pub fn new(sup: Supervisor, endpoint: &str) -> Result<Self, LifecycleError> {
        let client = reqwest::Client::builder()
            .timeout(sup.timing.spot_request_timeout)
            .pool_max_idle_per_host(0)
            .build()
            .map_err(|e| LifecycleError::HttpClient(e.to_string()))?;
        Ok(Self {
            sup,
            endpoint: endpoint.to_string(),
            client,
        })
    }

    /// One metadata request. `Some(body)` when an interruption is pending.
    pub async fn poll(&self) -> Option<String> {
        let response = match self.client.get(&self.endpoint).send().await {
            Ok(response) => response,
            Err(e) => {
                tracing::trace!(error = %e, "Spot metadata request failed");
                return None;
            }
        };
        if !response.status().is_success() {
            return None;
        }
        Some(
            response
                .text()
                .await
                .unwrap_or_else(|_| BODY_READ_ERROR.to_string()),
        )
    }

    pub async fn run(self) {
        tracing::info!(endpoint = %self.endpoint, "Spot interruption monitor started");
        loop {
            tokio::time::sleep(self.sup.timing.spot_poll).await;
            let Some(notice) = self.poll().await else {
                continue;
            };

            tracing::warn!(notice = %notice, "Spot interruption notice received");
            // Another monitor's teardown keeps the flag after the cooldown.
            let owned = self.sup.state.shutdown.try_set();
            let snapshot = self.sup.status.collect().await;
            self.sup
                .notifier
                .notify(EventKind::SpotInterruption, snapshot, Some(notice));

            tokio::time::sleep(self.sup.timing.spot_cooldown).await;
            if owned {
                self.sup.state.shutdown.clear();
            }
            tracing::info!(released = owned, "Spot interruption cooldown elapsed, resuming polling");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use axum::{Router, extract::State, http::StatusCode, routing::get};

    use super::*;
    use crate::config::AgiPaths;
    use crate::lifecycle::Timing;
    use crate::lifecycle::testing::RecordingAction;
    use crate::notifier::Notifier;
    use crate::notifier::testing::RecordingSink;
    use crate::state::SharedState;
    use crate::status::StatusAggregator;
    use crate::status::process::StaticProcessTable;

    const NOTICE: &str = r#"{"action":"terminate","time":"2024-03-05T14:09:00Z"}"#;

    async fn instance_action(State(pending): State<Arc<AtomicBool>>) -> (StatusCode, &'static str) {
        if pending.load(Ordering::SeqCst) {
            (StatusCode::OK, NOTICE)
        } else {
            (StatusCode::NOT_FOUND, "")
        }
    }

    async fn metadata_server(pending: Arc<AtomicBool>) -> String {
        let app = Router::new()
            .route("/latest/meta-data/spot/instance-action", get(instance_action))
            .with_state(pending);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{addr}/latest/meta-data/spot/instance-action")
    }

    #[tokio::test]
    async fn notice_sets_flag_until_cooldown_elapses() {
        let pending = Arc::new(AtomicBool::new(true));
        let endpoint = metadata_server(pending.clone()).await;

        let dir = tempfile::tempdir().expect("tempdir");
        let state = Arc::new(SharedState::new());
        let action = RecordingAction::new(state.clone());
        let (sink, mut events) = RecordingSink::new();
        let sup = Supervisor {
            state: state.clone(),
            status: Arc::new(StatusAggregator::new(
                AgiPaths::under(dir.path()),
                Arc::new(StaticProcessTable::new()),
                "asd",
            )),
            notifier: Notifier::new("agi-1", true).with_sink(sink),
            action: action.clone(),
            timing: Timing {
                spot_poll: Duration::from_millis(20),
                spot_cooldown: Duration::from_millis(400),
                spot_request_timeout: Duration::from_secs(2),
                ..Timing::default()
            },
        };
        let monitor = SpotMonitor::new(sup, &endpoint).expect("monitor");
        let handle = tokio::spawn(monitor.run());

        let event = tokio::time::timeout(Duration::from_secs(3), events.recv())
            .await
            .expect("notified")
            .expect("event");
        assert_eq!(event.kind, EventKind::SpotInterruption);
        assert_eq!(event.event_detail.as_deref(), Some(NOTICE));
        assert!(state.shutdown.is_set());

        pending.store(false, Ordering::SeqCst);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        while state.shutdown.is_set() {
            assert!(tokio::time::Instant::now() < deadline, "flag never cleared");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        // Polling resumed: a fresh notice sets the flag again.
        pending.store(true, Ordering::SeqCst);
        let event = tokio::time::timeout(Duration::from_secs(3), events.recv())
            .await
            .expect("notified again")
            .expect("event");
        assert_eq!(event.kind, EventKind::SpotInterruption);

        assert!(action.calls().is_empty());
        handle.abort();
    }

    #[tokio::test]
    async fn flag_held_by_another_monitor_survives_cooldown() {
        let pending = Arc::new(AtomicBool::new(true));
        let endpoint = metadata_server(pending.clone()).await;

        let dir = tempfile::tempdir().expect("tempdir");
        let state = Arc::new(SharedState::new());
        state.shutdown.set();
        let (sink, mut events) = RecordingSink::new();
        let sup = Supervisor {
            state: state.clone(),
            status: Arc::new(StatusAggregator::new(
                AgiPaths::under(dir.path()),
                Arc::new(StaticProcessTable::new()),
                "asd",
            )),
            notifier: Notifier::new("agi-1", true).with_sink(sink),
            action: RecordingAction::new(state.clone()),
            timing: Timing {
                spot_poll: Duration::from_millis(20),
                spot_cooldown: Duration::from_millis(50),
                spot_request_timeout: Duration::from_secs(2),
                ..Timing::default()
            },
        };
        let handle = tokio::spawn(SpotMonitor::new(sup, &endpoint).expect("monitor").run());

        let event = tokio::time::timeout(Duration::from_secs(3), events.recv())
            .await
            .expect("notified")
            .expect("event");
        assert_eq!(event.kind, EventKind::SpotInterruption);
        pending.store(false, Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(state.shutdown.is_set());
        handle.abort();
    }

    #[tokio::test]
    async fn non_success_and_unreachable_mean_no_notice() {
        let pending = Arc::new(AtomicBool::new(false));
        let endpoint = metadata_server(pending).await;
        let dir = tempfile::tempdir().expect("tempdir");
        let state = Arc::new(SharedState::new());
        let sup = Supervisor {
            state: state.clone(),
            status: Arc::new(StatusAggregator::new(
                AgiPaths::under(dir.path()),
                Arc::new(StaticProcessTable::new()),
                "asd",
            )),
            notifier: Notifier::disabled(),
            action: RecordingAction::new(state),
            timing: Timing::default(),
        };
        let monitor = SpotMonitor::new(sup.clone(), &endpoint).expect("monitor");
        assert_eq!(monitor.poll().await, None);

        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);
        let monitor = SpotMonitor::new(sup, &format!("http://{addr}/")).expect("monitor");
        assert_eq!(monitor.poll().await, None);
    }
}
