//! Error types for agi-proxy.

use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};

/// Top-level error type for the proxy.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Server error: {0}")]
    Server(#[from] ServerError),

    #[error("Proxy error: {0}")]
    Proxy(#[from] ProxyError),

    #[error("Notification error: {0}")]
    Notify(#[from] NotifyError),

    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse {path}: {message}")]
    ParseError { path: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Listener and TLS setup errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("TLS setup failed: {0}")]
    Tls(String),

    #[error("Server terminated with error: {0}")]
    Serve(String),
}

/// Reverse-proxy failures. These are scoped to one request.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("Invalid upstream URI for {upstream}: {reason}")]
    InvalidUri { upstream: String, reason: String },

    #[error("Upstream {upstream} unreachable: {reason}")]
    Unreachable { upstream: String, reason: String },

    #[error("Failed to build request for {upstream}: {reason}")]
    Request { upstream: String, reason: String },
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = match &self {
            ProxyError::Unreachable { .. } => StatusCode::BAD_GATEWAY,
            ProxyError::InvalidUri { .. } | ProxyError::Request { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        tracing::warn!(status = status.as_u16(), error = %self, "Proxy request failed");
        (
            status,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            self.to_string(),
        )
            .into_response()
    }
}

/// Notification sink failures. Always logged, never escalated.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("HTTP client init failed: {0}")]
    Client(String),

    #[error("Request to {sink} failed: {reason}")]
    Request { sink: &'static str, reason: String },

    #[error("{sink} rejected notification with HTTP {status}: {body}")]
    Rejected {
        sink: &'static str,
        status: u16,
        body: String,
    },

    #[error("Invalid header '{0}'")]
    InvalidHeader(String),
}

/// Shutdown action and monitor failures.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("Shutdown command is empty")]
    EmptyCommand,

    #[error("HTTP client init failed: {0}")]
    HttpClient(String),

    #[error("Failed to run '{command}': {reason}")]
    CommandFailed { command: String, reason: String },

    #[error("'{command}' exited with {status}: {output}")]
    CommandExit {
        command: String,
        status: String,
        output: String,
    },
}

/// Result type alias for the proxy.
pub type Result<T> = std::result::Result<T, Error>;
