//! agi-proxy: the single network entry point of an AGI instance.
//!
//! The proxy authenticates users, forwards their traffic to the dashboard,
//! web terminal and file browser running on the same host, and decides when
//! the instance should power itself off. Lifecycle decisions come from a set
//! of independent monitors (inactivity, max uptime, spot interruption) that
//! share a handful of state cells; service health changes and shutdowns are
//! announced through the notifier.

pub mod auth;
pub mod backends;
pub mod cli;
pub mod config;
pub mod error;
pub mod health;
pub mod lifecycle;
pub mod notifier;
pub mod proxy;
pub mod server;
pub mod state;
pub mod status;

use std::fs::OpenOptions;
use std::io::{ErrorKind, Write as _};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub use config::Config;
pub use error::{Error, Result};

use crate::auth::{AuthGate, tokens};
use crate::config::NotifierConfig;
use crate::health::HealthMonitor;
use crate::lifecycle::{CommandShutdown, Supervisor, Timing};
use crate::notifier::Notifier;
use crate::proxy::Upstreams;
use crate::server::AppState;
use crate::state::SharedState;
use crate::status::StatusAggregator;
use crate::status::process::SystemProcessTable;

/// Removes the proxy's PID file when dropped.
struct PidFile {
    path: PathBuf,
}

impl PidFile {
    fn create(path: &Path) -> Option<Self> {
        match std::fs::write(path, std::process::id().to_string()) {
            Ok(()) => Some(Self {
                path: path.to_path_buf(),
            }),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Could not write PID file");
                None
            }
        }
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::debug!(path = %self.path.display(), error = %e, "Could not remove PID file");
        }
    }
}

/// Write the operator label unless one is already present.
fn write_initial_label(path: &Path, label: &str) {
    let result = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .and_then(|mut file| file.write_all(label.as_bytes()));
    match result {
        Ok(()) => tracing::debug!(path = %path.display(), "Initial label written"),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "Could not write label"),
    }
}

/// Build the notifier from `notifier.yaml`, if present.
fn load_notifier(config: &Config) -> Option<Notifier> {
    let paths = &config.paths;
    let notifier_config = match NotifierConfig::load(&paths.notifier_config) {
        Ok(Some(loaded)) => loaded,
        Ok(None) => {
            tracing::info!("No notifier configuration, notifications disabled");
            return None;
        }
        Err(e) => {
            tracing::error!(error = %e, "Notifier configuration unusable, notifications disabled");
            return None;
        }
    };
    let data_in_memory = !paths.no_dim_marker.exists();
    let notifier = Notifier::from_config(
        &config.instance.name,
        &notifier_config,
        paths,
        data_in_memory,
    );
    tracing::info!(
        notifier = ?notifier,
        data_in_memory,
        "Notifier configured"
    );
    Some(notifier)
}

/// Run the proxy until the listener stops.
pub async fn run(config: Config) -> Result<()> {
    let paths = &config.paths;
    let _pid_file = PidFile::create(&paths.proxy_pid);
    write_initial_label(&paths.label, &config.instance.initial_label);
    if let Err(e) = std::fs::create_dir_all(&config.backends.entry_dir) {
        tracing::warn!(
            dir = %config.backends.entry_dir.display(),
            error = %e,
            "Could not create entry directory"
        );
    }

    let state = Arc::new(SharedState::new());
    let status = Arc::new(StatusAggregator::new(
        paths.clone(),
        Arc::new(SystemProcessTable),
        &config.lifecycle.database_process_suffix,
    ));

    let notifier = load_notifier(&config);
    let notifications_enabled = notifier.is_some();
    let supervisor = Supervisor {
        state: state.clone(),
        status,
        notifier: notifier.unwrap_or_else(Notifier::disabled),
        action: Arc::new(CommandShutdown::new(
            config.lifecycle.shutdown_command.clone(),
        )),
        timing: Timing::default(),
    };
    supervisor.spawn_monitors(&config.lifecycle, notifications_enabled)?;
    if notifications_enabled {
        tokio::spawn(HealthMonitor::new(supervisor.clone()).run());
    }

    let gate = Arc::new(AuthGate::new(&config.auth, state.clone()));
    if let Some(store) = gate.token_store() {
        tokens::spawn_reloader(store);
    }

    if config.backends.enabled {
        let started = backends::spawn_all(&config.backends, state.clone());
        tracing::info!(count = started.len(), "Backends launched");
    } else {
        tracing::info!("Backend launch disabled");
    }

    let tls = config
        .listen
        .tls
        .as_ref()
        .map(server::rustls_config)
        .transpose()?;
    let addr = SocketAddr::from(([0, 0, 0, 0], config.listen.port));
    let app = AppState::new(supervisor, Upstreams::default());
    let handle = app.handle.clone();
    server::serve(server::router(app, gate), addr, tls, handle).await?;
    Ok(())
}
