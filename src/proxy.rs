//! Reverse-proxy dispatcher for the co-located backends.
//!
//! Requests are forwarded to a loopback upstream with the original host in
//! `X-Forwarded-Host`, and the upstream response is streamed back as is.
//! Connection upgrades (the terminal's WebSocket) are relayed byte for byte
//! once both sides have switched protocols.

use std::net::SocketAddr;

use axum::body::Body;
use axum::extract::{ConnectInfo, Request};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, Uri, Version, header};
use axum::response::Response;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::{TokioExecutor, TokioIo};

use crate::error::ProxyError;

pub const DASHBOARD_PORT: u16 = 8850;
pub const TERMINAL_PORT: u16 = 8852;
pub const FILEBROWSER_PORT: u16 = 8853;

const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Headers meaningful only for a single transport hop.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// A backend reachable over plain HTTP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    name: &'static str,
    authority: String,
}

impl Upstream {
    pub fn new(name: &'static str, authority: impl Into<String>) -> Self {
        Self {
            name,
            authority: authority.into(),
        }
    }

    /// A backend on the loopback interface.
    pub fn local(name: &'static str, port: u16) -> Self {
        Self::new(name, format!("127.0.0.1:{port}"))
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }
}

/// The three fixed upstreams.
#[derive(Debug, Clone)]
pub struct Upstreams {
    pub dashboard: Upstream,
    pub terminal: Upstream,
    pub filebrowser: Upstream,
}

impl Default for Upstreams {
    fn default() -> Self {
        Self {
            dashboard: Upstream::local("dashboard", DASHBOARD_PORT),
            terminal: Upstream::local("terminal", TERMINAL_PORT),
            filebrowser: Upstream::local("filebrowser", FILEBROWSER_PORT),
        }
    }
}

/// Shared HTTP/1 client used for every upstream.
#[derive(Clone)]
pub struct ReverseProxy {
    client: Client<HttpConnector, Body>,
}

impl Default for ReverseProxy {
    fn default() -> Self {
        Self::new()
    }
}

impl ReverseProxy {
    pub fn new() -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        Self {
            client: Client::builder(TokioExecutor::new()).build(connector),
        }
    }

    /// Forward `req` to `upstream` and return its response.
    pub async fn forward(
        &self,
        upstream: &Upstream,
        mut req: Request,
    ) -> Result<Response, ProxyError> {
        let client_upgrade =
            is_upgrade_request(req.headers()).then(|| hyper::upgrade::on(&mut req));
        let (mut parts, body) = req.into_parts();

        let original_host = parts.headers.get(header::HOST).cloned().or_else(|| {
            parts
                .uri
                .authority()
                .and_then(|a| HeaderValue::from_str(a.as_str()).ok())
        });
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        parts.uri = format!("http://{}{}", upstream.authority, path_and_query)
            .parse::<Uri>()
            .map_err(|e| ProxyError::InvalidUri {
                upstream: upstream.name.to_string(),
                reason: e.to_string(),
            })?;
        parts.version = Version::HTTP_11;

        let upgrade = client_upgrade
            .is_some()
            .then(|| parts.headers.get(header::UPGRADE).cloned())
            .flatten();
        let client_addr = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());

        let headers = &mut parts.headers;
        strip_hop_by_hop(headers);
        if let Some(protocol) = upgrade {
            headers.insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
            headers.insert(header::UPGRADE, protocol);
        }
        if let Some(host) = original_host {
            headers.insert(X_FORWARDED_HOST, host);
        }
        if let Some(ip) = client_addr {
            append_forwarded_for(headers, &ip.to_string());
        }
        let host = HeaderValue::from_str(&upstream.authority).map_err(|e| ProxyError::Request {
            upstream: upstream.name.to_string(),
            reason: e.to_string(),
        })?;
        headers.insert(header::HOST, host);

        let mut response = self
            .client
            .request(axum::http::Request::from_parts(parts, body))
            .await
            .map_err(|e| ProxyError::Unreachable {
                upstream: upstream.name.to_string(),
                reason: e.to_string(),
            })?;

        if response.status() == StatusCode::SWITCHING_PROTOCOLS {
            match client_upgrade {
                Some(client_upgrade) => {
                    let upstream_upgrade = hyper::upgrade::on(&mut response);
                    tokio::spawn(relay(upstream.name, client_upgrade, upstream_upgrade));
                }
                None => {
                    tracing::warn!(upstream = upstream.name, "Upstream switched protocols unasked");
                }
            }
        } else {
            strip_hop_by_hop(response.headers_mut());
        }

        Ok(response.map(Body::new))
    }
}

fn is_upgrade_request(headers: &HeaderMap) -> bool {
    headers.contains_key(header::UPGRADE)
        && headers
            .get_all(header::CONNECTION)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
}

/// Remove hop-by-hop headers, including any named by `Connection`.
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();
    for name in &named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

fn append_forwarded_for(headers: &mut HeaderMap, ip: &str) {
    let value = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(prior) if !prior.is_empty() => format!("{prior}, {ip}"),
        _ => ip.to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}

async fn relay(
    upstream: &'static str,
    client: hyper::upgrade::OnUpgrade,
    backend: hyper::upgrade::OnUpgrade,
) {
    let (client, backend) = match tokio::try_join!(client, backend) {
        Ok(pair) => pair,
        Err(e) => {
            tracing::warn!(upstream, error = %e, "Connection upgrade failed");
            return;
        }
    };
    let mut client = TokioIo::new(client);
    let mut backend = TokioIo::new(backend);
    match tokio::io::copy_bidirectional(&mut client, &mut backend).await {
        Ok((to_backend, to_client)) => {
            tracing::debug!(upstream, to_backend, to_client, "Upgraded connection closed")
        }
        Err(e) => tracing::debug!(upstream, error = %e, "Upgraded connection ended with error"),
    }
}
