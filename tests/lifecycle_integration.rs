//! End-to-end lifecycle tests: monitors started through
//! `Supervisor::spawn_monitors`, notifications delivered to a real webhook
//! listener, and the shutdown action replaced by a recorder.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::{get, post},
};
use pretty_assertions::assert_eq;
use serde_json::Value;
use tokio::sync::mpsc;

use agi_proxy::config::{AgiPaths, LifecycleConfig};
use agi_proxy::error::LifecycleError;
use agi_proxy::lifecycle::{ShutdownAction, Supervisor, Timing};
use agi_proxy::notifier::Notifier;
use agi_proxy::notifier::webhook::WebhookSink;
use agi_proxy::state::SharedState;
use agi_proxy::status::StatusAggregator;
use agi_proxy::status::process::StaticProcessTable;

const TIMEOUT: Duration = Duration::from_secs(5);

/// Records the shutdown flag value seen at each invocation.
struct RecordingAction {
    state: Arc<SharedState>,
    calls: Mutex<Vec<bool>>,
}

impl RecordingAction {
    fn calls(&self) -> Vec<bool> {
        self.calls.lock().expect("lock").clone()
    }
}

#[async_trait]
impl ShutdownAction for RecordingAction {
    async fn execute(&self) -> Result<String, LifecycleError> {
        let flag = self.state.shutdown.is_set();
        self.calls.lock().expect("lock").push(flag);
        Ok(String::new())
    }
}

type Hooks = mpsc::UnboundedReceiver<(HeaderMap, Value)>;

async fn hook(
    State(tx): State<mpsc::UnboundedSender<(HeaderMap, Value)>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> StatusCode {
    let _ = tx.send((headers, body));
    StatusCode::OK
}

async fn webhook_listener() -> (String, Hooks) {
    let (tx, rx) = mpsc::unbounded_channel();
    let app = Router::new().route("/hook", post(hook)).with_state(tx);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}/hook"), rx)
}

struct Instance {
    supervisor: Supervisor,
    action: Arc<RecordingAction>,
    hooks: Hooks,
    paths: AgiPaths,
    _dir: tempfile::TempDir,
}

async fn instance(timing: Timing) -> Instance {
    let dir = tempfile::tempdir().expect("tempdir");
    let paths = AgiPaths::under(dir.path());
    let (endpoint, hooks) = webhook_listener().await;
    let sink = WebhookSink::new(&endpoint, &["X-Agi-Instance: agi-it".to_string()])
        .expect("webhook sink");

    let state = Arc::new(SharedState::new());
    let action = Arc::new(RecordingAction {
        state: state.clone(),
        calls: Mutex::new(Vec::new()),
    });
    let supervisor = Supervisor {
        state,
        status: Arc::new(StatusAggregator::new(
            paths.clone(),
            Arc::new(StaticProcessTable::new()),
            "asd",
        )),
        notifier: Notifier::new("agi-it", true).with_sink(Arc::new(sink)),
        action: action.clone(),
        timing,
    };
    Instance {
        supervisor,
        action,
        hooks,
        paths,
        _dir: dir,
    }
}

fn lifecycle(max_inactivity: Option<Duration>, max_uptime: Option<Duration>) -> LifecycleConfig {
    LifecycleConfig {
        max_inactivity,
        max_uptime,
        shutdown_command: "/sbin/poweroff".to_string(),
        spot_endpoint: "http://127.0.0.1:9/unused".to_string(),
        debug_activity: true,
        shell_names: vec!["bash".to_string()],
        database_process_suffix: "asd".to_string(),
    }
}

async fn next_hook(hooks: &mut Hooks) -> (HeaderMap, Value) {
    tokio::time::timeout(TIMEOUT, hooks.recv())
        .await
        .expect("webhook timeout")
        .expect("webhook delivered")
}

async fn wait_for_calls(action: &RecordingAction, count: usize) {
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while action.calls().len() < count {
        assert!(tokio::time::Instant::now() < deadline, "shutdown action not invoked");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn idle_instance_is_shut_down_exactly_once() {
    let mut it = instance(Timing {
        activity_tick: Duration::from_millis(20),
        inactivity_grace: Duration::from_millis(100),
        ..Timing::default()
    })
    .await;
    // Three minutes without activity against a two minute limit.
    it.supervisor
        .state
        .activity
        .set(Instant::now() - Duration::from_secs(180));
    let handles = it
        .supervisor
        .spawn_monitors(&lifecycle(Some(Duration::from_secs(120)), None), false)
        .expect("monitors");
    assert_eq!(handles.len(), 1);

    let (headers, body) = next_hook(&mut it.hooks).await;
    assert_eq!(headers["x-agi-instance"], "agi-it");
    assert_eq!(body["event"], "INACTIVITY_SHUTDOWN");
    assert_eq!(body["agi_name"], "agi-it");
    assert_eq!(body["is_data_in_memory"], true);
    assert!(body.get("event_detail").is_none());

    wait_for_calls(&it.action, 1).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(it.action.calls(), vec![true]);
    assert!(it.supervisor.state.shutdown.is_set());
}

#[tokio::test]
async fn running_pipeline_counts_as_activity() {
    let mut it = instance(Timing {
        activity_tick: Duration::from_millis(20),
        inactivity_grace: Duration::from_millis(20),
        ..Timing::default()
    })
    .await;
    std::fs::write(&it.paths.ingest_pid, "4242").expect("pid file");
    it.supervisor
        .state
        .activity
        .set(Instant::now() - Duration::from_secs(180));
    let handles = it
        .supervisor
        .spawn_monitors(&lifecycle(Some(Duration::from_secs(120)), None), false)
        .expect("monitors");

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(it.action.calls().is_empty());
    assert!(it.hooks.try_recv().is_err());
    assert!(it.supervisor.state.activity.idle_for() < Duration::from_secs(5));
    for handle in handles {
        handle.abort();
    }
}

#[tokio::test]
async fn max_uptime_warns_then_powers_off() {
    let mut it = instance(Timing {
        uptime_warning: Duration::from_millis(150),
        ..Timing::default()
    })
    .await;
    let started = Instant::now();
    it.supervisor
        .spawn_monitors(&lifecycle(None, Some(Duration::from_millis(300))), false)
        .expect("monitors");

    let (_, body) = next_hook(&mut it.hooks).await;
    assert_eq!(body["event"], "MAX_AGE_SHUTDOWN");
    assert_eq!(body["ingest_status"]["database_running"], false);
    assert!(it.supervisor.state.shutdown.is_set());

    wait_for_calls(&it.action, 1).await;
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert_eq!(it.action.calls(), vec![true]);
}

async fn instance_action(State(body): State<&'static str>) -> (StatusCode, &'static str) {
    (StatusCode::OK, body)
}

#[tokio::test]
async fn spot_notice_is_announced_and_flag_released() {
    const NOTICE: &str = r#"{"action":"stop","time":"2024-03-05T14:09:00Z"}"#;
    let app = Router::new()
        .route("/latest/meta-data/spot/instance-action", get(instance_action))
        .with_state(NOTICE);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    let mut it = instance(Timing {
        spot_poll: Duration::from_millis(20),
        spot_cooldown: Duration::from_millis(300),
        spot_request_timeout: Duration::from_secs(2),
        ..Timing::default()
    })
    .await;
    let mut config = lifecycle(None, None);
    config.spot_endpoint = format!("http://{addr}/latest/meta-data/spot/instance-action");
    let handles = it
        .supervisor
        .spawn_monitors(&config, true)
        .expect("monitors");

    let (_, body) = next_hook(&mut it.hooks).await;
    assert_eq!(body["event"], "SPOT_INTERRUPTION");
    assert_eq!(body["event_detail"], NOTICE);
    assert!(it.supervisor.state.shutdown.is_set());

    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while it.supervisor.state.shutdown.is_set() {
        assert!(tokio::time::Instant::now() < deadline, "flag never cleared");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(it.action.calls().is_empty());
    for handle in handles {
        handle.abort();
    }
}
