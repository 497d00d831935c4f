//! HTTP server: route table, auth layer and the plain/TLS listener.
//!
//! Every route, including the dashboard catch-all, passes through the
//! [`AuthGate`]. The terminal and file-browser prefixes are registered in
//! their bare, trailing-slash and nested forms so that all of them reach the
//! same upstream.

mod handlers;
pub mod tls;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router, middleware,
    routing::{any, get},
};
use axum_server::Handle;
use axum_server::tls_rustls::RustlsConfig;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::auth::{AuthGate, auth_middleware};
use crate::config::TlsConfig;
use crate::error::ServerError;
use crate::lifecycle::Supervisor;
use crate::proxy::{ReverseProxy, Upstreams};

use self::handlers::*;

pub const TERMINAL_PREFIX: &str = "/agi/ttyd";
pub const FILEBROWSER_PREFIX: &str = "/agi/filebrowser";
pub const MENU_PATH: &str = "/agi/menu";
pub const STATUS_PATH: &str = "/agi/status";
pub const INGEST_DETAIL_PATH: &str = "/agi/ingest/detail";
pub const SHUTDOWN_PATH: &str = "/agi/shutdown";
pub const POWEROFF_PATH: &str = "/agi/poweroff";

/// Upper bound on connection draining after `/agi/shutdown`.
pub const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(60);

/// State shared by all handlers.
#[derive(Clone)]
pub struct AppState {
    pub supervisor: Supervisor,
    pub proxy: ReverseProxy,
    pub upstreams: Arc<Upstreams>,
    /// Controls the listener; used by the shutdown endpoint.
    pub handle: Handle,
}

impl AppState {
    pub fn new(supervisor: Supervisor, upstreams: Upstreams) -> Self {
        Self {
            supervisor,
            proxy: ReverseProxy::new(),
            upstreams: Arc::new(upstreams),
            handle: Handle::new(),
        }
    }
}

/// Build the full route table behind the auth gate.
pub fn router(app: AppState, gate: Arc<AuthGate>) -> Router {
    let nested_terminal = format!("{TERMINAL_PREFIX}/{{*rest}}");
    let nested_filebrowser = format!("{FILEBROWSER_PREFIX}/{{*rest}}");

    Router::new()
        // Terminal (WebSocket upgrades included)
        .route(TERMINAL_PREFIX, any(terminal_handler))
        .route(&format!("{TERMINAL_PREFIX}/"), any(terminal_handler))
        .route(&nested_terminal, any(terminal_handler))
        // File browser
        .route(FILEBROWSER_PREFIX, any(filebrowser_handler))
        .route(&format!("{FILEBROWSER_PREFIX}/"), any(filebrowser_handler))
        .route(&nested_filebrowser, any(filebrowser_handler))
        // Control
        .route(MENU_PATH, get(menu_handler))
        .route(STATUS_PATH, get(status_handler))
        .route(INGEST_DETAIL_PATH, get(ingest_detail_handler))
        .route(SHUTDOWN_PATH, get(shutdown_handler))
        .route(POWEROFF_PATH, get(poweroff_handler))
        // Everything else is the dashboard
        .fallback(dashboard_handler)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(middleware::from_fn_with_state(gate, auth_middleware)),
        )
        .with_state(app)
}

/// Load the TLS listener config from the operator's PEM files.
pub fn rustls_config(tls: &TlsConfig) -> Result<RustlsConfig, ServerError> {
    let config = tls::server_config(tls)?;
    Ok(RustlsConfig::from_config(Arc::new(config)))
}

/// Serve `app` on `addr` until the handle is told to shut down.
pub async fn serve(
    app: Router,
    addr: SocketAddr,
    tls: Option<RustlsConfig>,
    handle: Handle,
) -> Result<(), ServerError> {
    let service = app.into_make_service_with_connect_info::<SocketAddr>();
    let scheme = if tls.is_some() { "https" } else { "http" };
    tracing::info!(%addr, scheme, "Starting listener");

    let result = match tls {
        Some(config) => {
            axum_server::bind_rustls(addr, config)
                .handle(handle)
                .serve(service)
                .await
        }
        None => axum_server::bind(addr).handle(handle).serve(service).await,
    };
    result.map_err(|e| {
        tracing::error!(%addr, error = %e, "Listener failed");
        ServerError::Serve(format!("{addr}: {e}"))
    })?;
    tracing::info!("Listener stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use axum::http::{StatusCode, header};
    use flate2::{Compression, write::GzEncoder};
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::config::{AgiPaths, AuthConfig};
    use crate::lifecycle::Timing;
    use crate::lifecycle::testing::RecordingAction;
    use crate::notifier::Notifier;
    use crate::proxy::Upstream;
    use crate::state::SharedState;
    use crate::status::StatusAggregator;
    use crate::status::process::StaticProcessTable;

    struct Harness {
        base: String,
        app: AppState,
        action: Arc<RecordingAction>,
        _dir: tempfile::TempDir,
    }

    fn closed_port() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);
        addr.to_string()
    }

    async fn start() -> Harness {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = Arc::new(SharedState::new());
        let action = RecordingAction::new(state.clone());
        let supervisor = Supervisor {
            state: state.clone(),
            status: Arc::new(StatusAggregator::new(
                AgiPaths::under(dir.path()),
                Arc::new(StaticProcessTable::new().with_process(40, "asd")),
                "asd",
            )),
            notifier: Notifier::disabled(),
            action: action.clone(),
            timing: Timing::default(),
        };
        let dead = closed_port();
        let upstreams = Upstreams {
            dashboard: Upstream::new("dashboard", dead.clone()),
            terminal: Upstream::new("terminal", dead.clone()),
            filebrowser: Upstream::new("filebrowser", dead),
        };
        let app = AppState::new(supervisor, upstreams);
        let gate = Arc::new(AuthGate::new(&AuthConfig::None, state));
        let routes = router(app.clone(), gate);
        let handle = app.handle.clone();
        tokio::spawn(serve(
            routes,
            "127.0.0.1:0".parse().expect("addr"),
            None,
            handle.clone(),
        ));
        let addr = handle.listening().await.expect("listening");
        Harness {
            base: format!("http://{addr}"),
            app,
            action,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn menu_links_and_hsts() {
        let h = start().await;
        let response = reqwest::get(format!("{}/agi/menu", h.base)).await.expect("get");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::STRICT_TRANSPORT_SECURITY],
            "max-age=31536000"
        );
        let body = response.text().await.expect("body");
        assert!(body.contains(r#"href="/agi/ttyd""#));
        assert!(body.contains(r#"href="/agi/filebrowser""#));
        assert!(body.contains("/d/dashList/dashboard-list?"));
    }

    #[tokio::test]
    async fn status_is_json_snapshot() {
        let h = start().await;
        let body: serde_json::Value = reqwest::get(format!("{}/agi/status", h.base))
            .await
            .expect("get")
            .json()
            .await
            .expect("json");
        assert_eq!(body["database_running"], true);
        assert_eq!(body["helper_running"], false);
        assert_eq!(body["ingest"]["downloader_complete_pct"], 0);
        assert_eq!(body["ingest"]["complete_steps"]["Download"], false);
    }

    #[tokio::test]
    async fn ingest_detail_validates_and_decompresses() {
        let h = start().await;
        let get = |query: &str| reqwest::get(format!("{}/agi/ingest/detail{query}", h.base));

        assert_eq!(get("?detail=unknown.json").await.expect("get").status(), 400);
        assert_eq!(get("").await.expect("get").status(), 400);
        assert_eq!(get("?detail=unpacker.json").await.expect("get").status(), 404);

        let paths = h.app.supervisor.status.paths().clone();
        std::fs::create_dir_all(&paths.ingest_progress).expect("mkdir");
        let mut gz = GzEncoder::new(Vec::new(), Compression::default());
        gz.write_all(br#"{"Files":{}}"#).expect("gz");
        std::fs::write(
            paths.ingest_progress.join("unpacker.json.gz"),
            gz.finish().expect("gz"),
        )
        .expect("write");
        std::fs::write(&paths.steps_file, br#"{"Init":true}"#).expect("write");

        let response = get("?detail=unpacker.json").await.expect("get");
        assert_eq!(response.status(), 200);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/json");
        assert_eq!(response.text().await.expect("body"), r#"{"Files":{}}"#);

        let steps = get("?detail=steps.json").await.expect("get");
        assert_eq!(steps.text().await.expect("body"), r#"{"Init":true}"#);
    }

    #[tokio::test]
    async fn unreachable_upstream_is_bad_gateway() {
        let h = start().await;
        for path in ["/", "/d/home", "/agi/ttyd", "/agi/filebrowser/files/x"] {
            let response = reqwest::get(format!("{}{path}", h.base)).await.expect("get");
            assert_eq!(response.status(), StatusCode::BAD_GATEWAY, "{path}");
        }
    }

    #[tokio::test]
    async fn poweroff_sets_flag_then_runs_action() {
        let h = start().await;
        let response = reqwest::get(format!("{}/agi/poweroff", h.base)).await.expect("get");
        assert_eq!(response.text().await.expect("body"), "Poweroff...");

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while h.action.calls().is_empty() {
            assert!(tokio::time::Instant::now() < deadline, "action never ran");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(h.action.calls(), vec![true]);
    }

    #[tokio::test]
    async fn shutdown_stops_listener() {
        let h = start().await;
        let response = reqwest::get(format!("{}/agi/shutdown", h.base)).await.expect("get");
        assert_eq!(response.text().await.expect("body"), "Shutting down...");
        assert!(h.app.supervisor.state.shutdown.is_set());
        assert!(h.action.calls().is_empty());

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let client = reqwest::Client::builder()
                .pool_max_idle_per_host(0)
                .build()
                .expect("client");
            if client.get(format!("{}/agi/menu", h.base)).send().await.is_err() {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "listener still up");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}
