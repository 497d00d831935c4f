//! Backend child processes: the web terminal and the file browser.
//!
//! Both run as plain children of the proxy with the entry directory as
//! working directory. Their output is scanned line by line; the terminal
//! reports its live session count there, which feeds the connection counter.
//! Exits are logged and never restarted.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;

use crate::config::BackendsConfig;
use crate::proxy::{FILEBROWSER_PORT, TERMINAL_PORT};
use crate::state::SharedState;

const TERMINAL_BANNER: &str = "export TMOUT=3600 \
    && echo '* lnav tool is installed for log analysis' \
    && echo '* aerospike-tools is installed' \
    && echo '* less -S ...: enable horizontal scrolling in less using arrow keys' \
    && echo '* showconf command: showconf collect_info.tgz' \
    && echo '* showsysinfo command: showsysinfo collect_info.tgz' \
    && echo '* showinterrupts command: showinterrupts collect_info.tgz' \
    && /bin/bash";

static CLIENT_COUNT: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"clients: ([0-9]+)$").ok());

/// How to launch one backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendSpec {
    pub name: &'static str,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    /// Feed `clients: N` log lines into the connection counter.
    pub reports_connections: bool,
}

impl BackendSpec {
    pub fn terminal(config: &BackendsConfig) -> Self {
        let port = TERMINAL_PORT.to_string();
        Self {
            name: "terminal",
            program: config.terminal_bin.clone(),
            args: to_args(&[
                "-p", &port, "-i", "lo", "-P", "5", "-b", "/agi/ttyd", "/bin/bash", "-c",
                TERMINAL_BANNER,
            ]),
            working_dir: config.entry_dir.clone(),
            reports_connections: true,
        }
    }

    pub fn filebrowser(config: &BackendsConfig) -> Self {
        let port = FILEBROWSER_PORT.to_string();
        let root = config.entry_dir.to_string_lossy().into_owned();
        Self {
            name: "filebrowser",
            program: config.filebrowser_bin.clone(),
            args: to_args(&[
                "-p", &port, "-r", &root, "--noauth", "-d", "/opt/filebrowser.db", "-b",
                "/agi/filebrowser/",
            ]),
            working_dir: config.entry_dir.clone(),
            reports_connections: false,
        }
    }
}

fn to_args(args: &[&str]) -> Vec<String> {
    args.iter().map(|a| a.to_string()).collect()
}

/// Session count reported on a terminal log line, if any.
pub fn parse_client_count(line: &str) -> Option<u64> {
    let pattern = CLIENT_COUNT.as_ref()?;
    pattern.captures(line)?.get(1)?.as_str().parse().ok()
}

/// Launch both backends. Failures are logged; the proxy keeps running.
pub fn spawn_all(config: &BackendsConfig, state: Arc<SharedState>) -> Vec<JoinHandle<()>> {
    [BackendSpec::terminal(config), BackendSpec::filebrowser(config)]
        .into_iter()
        .filter_map(|spec| spawn(spec, state.clone()))
        .collect()
}

/// Start one backend and supervise it until it exits.
pub fn spawn(spec: BackendSpec, state: Arc<SharedState>) -> Option<JoinHandle<()>> {
    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .current_dir(&spec.working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            tracing::error!(
                backend = spec.name,
                program = %spec.program.display(),
                error = %e,
                "Backend could not be started"
            );
            return None;
        }
    };
    tracing::info!(backend = spec.name, pid = ?child.id(), "Backend started");

    let tracked = spec.reports_connections.then_some(state);
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(watch_output(spec.name, "stdout", stdout, tracked.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(watch_output(spec.name, "stderr", stderr, tracked));
    }

    Some(tokio::spawn(async move {
        match child.wait().await {
            Ok(status) if status.success() => {
                tracing::info!(backend = spec.name, "Backend exited")
            }
            Ok(status) => {
                tracing::error!(backend = spec.name, %status, "Backend exited with error")
            }
            Err(e) => tracing::error!(backend = spec.name, error = %e, "Backend wait failed"),
        }
    }))
}

/// Scan one output stream until it closes.
pub async fn watch_output<R>(
    backend: &'static str,
    stream: &'static str,
    output: R,
    state: Option<Arc<SharedState>>,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(output).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                tracing::trace!(backend, stream, line = %line, "Backend output");
                let Some(state) = state.as_ref() else {
                    continue;
                };
                if let Some(count) = parse_client_count(&line)
                    && state.connections.set(count)
                {
                    tracing::info!(backend, connections = count, "Terminal connections changed");
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::error!(backend, stream, error = %e, "Backend output read failed");
                break;
            }
        }
    }
    tracing::debug!(backend, stream, "Backend output closed");
}
