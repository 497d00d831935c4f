//! Control endpoints and the proxied route handlers.

use std::net::SocketAddr;

use axum::{
    Json,
    body::Body,
    extract::{ConnectInfo, Query, Request, State},
    http::{StatusCode, header},
    response::{Html, IntoResponse, Response},
};
use serde::Deserialize;
use tokio_util::io::ReaderStream;

use super::{AppState, GRACEFUL_SHUTDOWN_TIMEOUT};
use crate::error::ProxyError;
use crate::status::StatusSnapshot;
use crate::status::progress::{self, DETAIL_FILES, STEPS_FILE};

const MENU_HTML: &str = r#"<html><head><title>AGI URLs</title></head><body><center>
<a href="/d/dashList/dashboard-list?from=now-7d&to=now&var-MaxIntervalSeconds=30&var-ProduceDelta&var-ClusterName=All&var-NodeIdent=All&var-Namespace=All&var-Histogram=NONE&var-HistogramDev=NONE&var-HistogramUs=NONE&var-HistogramCount=NONE&var-HistogramSize=NONE&var-XdrDcName=All&var-xdr5dc=All&var-warnC=All&var-warnCtx=All&var-errC=All&var-errCtx=All&orgId=1" target="_blank"><h1>Grafana</h1></a>
<a href="/agi/ttyd" target="_blank"><h1>Web Console (ttyd)</h1></a>
<a href="/agi/filebrowser" target="_blank"><h1>File Browser</h1></a>
</center></body></html>"#;

fn remote_addr(request: &Request) -> Option<SocketAddr> {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr)
}

// --- Proxied routes ---

pub(super) async fn dashboard_handler(
    State(app): State<AppState>,
    request: Request,
) -> Result<Response, ProxyError> {
    app.proxy.forward(&app.upstreams.dashboard, request).await
}

pub(super) async fn terminal_handler(
    State(app): State<AppState>,
    request: Request,
) -> Result<Response, ProxyError> {
    app.proxy.forward(&app.upstreams.terminal, request).await
}

pub(super) async fn filebrowser_handler(
    State(app): State<AppState>,
    request: Request,
) -> Result<Response, ProxyError> {
    app.proxy.forward(&app.upstreams.filebrowser, request).await
}

// --- Control endpoints ---

pub(super) async fn menu_handler() -> Html<&'static str> {
    Html(MENU_HTML)
}

pub(super) async fn status_handler(State(app): State<AppState>) -> Json<StatusSnapshot> {
    tracing::info!("Status requested");
    Json(app.supervisor.status.collect().await)
}

#[derive(Debug, Deserialize)]
pub(super) struct DetailQuery {
    #[serde(default)]
    detail: String,
}

/// Raw passthrough of one progress file, decompressed if only `.gz` exists.
pub(super) async fn ingest_detail_handler(
    State(app): State<AppState>,
    Query(query): Query<DetailQuery>,
) -> Result<Response, (StatusCode, String)> {
    let name = query.detail.as_str();
    if !DETAIL_FILES.contains(&name) {
        return Err((StatusCode::BAD_REQUEST, "invalid detail type".to_string()));
    }

    let paths = app.supervisor.status.paths();
    let path = if name == STEPS_FILE {
        paths.steps_file.clone()
    } else {
        paths.ingest_progress.join(name)
    };
    let located = progress::locate(&path).ok_or_else(|| {
        (
            StatusCode::NOT_FOUND,
            format!("file not found: {}", path.display()),
        )
    })?;

    let reader = progress::open_stream(&located).await.map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("could not read {}: {e}", located.path.display()),
        )
    })?;
    let body = Body::from_stream(ReaderStream::new(reader));

    Ok(([(header::CONTENT_TYPE, "application/json")], body).into_response())
}

/// Stop accepting requests and let the process exit once connections drain.
pub(super) async fn shutdown_handler(State(app): State<AppState>, request: Request) -> &'static str {
    tracing::warn!(remote = ?remote_addr(&request), "Proxy shutdown requested");
    app.supervisor.state.shutdown.set();
    let handle = app.handle.clone();
    tokio::spawn(async move { handle.graceful_shutdown(Some(GRACEFUL_SHUTDOWN_TIMEOUT)) });
    "Shutting down..."
}

/// Power the instance off through the shutdown action.
pub(super) async fn poweroff_handler(State(app): State<AppState>, request: Request) -> &'static str {
    tracing::warn!(remote = ?remote_addr(&request), "Poweroff requested");
    app.supervisor.state.shutdown.set();
    let supervisor = app.supervisor.clone();
    tokio::spawn(async move { supervisor.shutdown_now().await });
    "Poweroff..."
}
