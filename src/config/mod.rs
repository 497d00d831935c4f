//! Configuration for agi-proxy.
//!
//! Flags and env vars come in through [`Cli`]; `resolve` validates them and
//! splits them into per-component sections. Files that live next to the
//! instance (notifier settings, pipeline source description) are loaded by
//! [`notifier`] and may be absent.

pub mod notifier;

use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;

use crate::cli::Cli;
use crate::error::ConfigError;

pub use self::notifier::{IngestSources, NotifierConfig};

/// Main configuration for the proxy.
#[derive(Debug, Clone)]
pub struct Config {
    pub instance: InstanceConfig,
    pub paths: AgiPaths,
    pub listen: ListenConfig,
    pub auth: AuthConfig,
    pub lifecycle: LifecycleConfig,
    pub backends: BackendsConfig,
    pub log_json: bool,
}

#[derive(Debug, Clone)]
pub struct InstanceConfig {
    pub name: String,
    pub initial_label: String,
}

/// Well-known files of an AGI instance.
#[derive(Debug, Clone)]
pub struct AgiPaths {
    pub root: PathBuf,
    pub ingest_progress: PathBuf,
    pub steps_file: PathBuf,
    pub ingest_pid: PathBuf,
    pub plugin_pid: PathBuf,
    pub helper_pid: PathBuf,
    pub proxy_pid: PathBuf,
    pub label: PathBuf,
    pub owner: PathBuf,
    pub notifier_config: PathBuf,
    pub no_dim_marker: PathBuf,
    pub ingest_config: PathBuf,
    pub files_dir: PathBuf,
}

impl AgiPaths {
    /// Layout rooted at `root`, with progress files in `ingest_progress`.
    pub fn new(root: &Path, ingest_progress: &Path, files_dir: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            ingest_progress: ingest_progress.to_path_buf(),
            steps_file: root.join("ingest").join("steps.json"),
            ingest_pid: root.join("ingest.pid"),
            plugin_pid: root.join("plugin.pid"),
            helper_pid: root.join("grafanafix.pid"),
            proxy_pid: root.join("proxy.pid"),
            label: root.join("label"),
            owner: root.join("owner"),
            notifier_config: root.join("notifier.yaml"),
            no_dim_marker: root.join("nodim"),
            ingest_config: root.join("ingest.yaml"),
            files_dir: files_dir.to_path_buf(),
        }
    }

    /// Everything under one directory; convenient for tests.
    pub fn under(root: &Path) -> Self {
        Self::new(root, &root.join("ingest"), &root.join("files"))
    }
}

#[derive(Debug, Clone)]
pub struct ListenConfig {
    pub port: u16,
    pub tls: Option<TlsConfig>,
}

#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

/// Authentication policy, fixed for the process lifetime.
#[derive(Debug, Clone)]
pub enum AuthConfig {
    None,
    Basic {
        user: String,
        password: SecretString,
    },
    Token {
        dir: PathBuf,
        name: String,
    },
}

impl AuthConfig {
    fn resolve(cli: &Cli) -> Result<Self, ConfigError> {
        match normalize_variant(&cli.auth_type).as_str() {
            "none" | "" => Ok(Self::None),
            "basic" => Ok(Self::Basic {
                user: cli.basic_auth_user.clone(),
                password: SecretString::from(cli.basic_auth_pass.clone()),
            }),
            "token" => {
                if cli.token_name.trim().is_empty() {
                    return Err(ConfigError::InvalidValue {
                        key: "token-name".to_string(),
                        message: "must not be empty".to_string(),
                    });
                }
                Ok(Self::Token {
                    dir: cli.token_path.clone(),
                    name: cli.token_name.clone(),
                })
            }
            other => Err(ConfigError::InvalidValue {
                key: "auth-type".to_string(),
                message: format!("expected 'none', 'basic' or 'token', got '{other}'"),
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// `None` disables the inactivity monitor.
    pub max_inactivity: Option<Duration>,
    /// `None` disables the max-uptime monitor.
    pub max_uptime: Option<Duration>,
    pub shutdown_command: String,
    pub spot_endpoint: String,
    pub debug_activity: bool,
    /// Executable names that count as an interactive shell.
    pub shell_names: Vec<String>,
    /// Suffix identifying the database daemon in the process table.
    pub database_process_suffix: String,
}

#[derive(Debug, Clone)]
pub struct BackendsConfig {
    pub enabled: bool,
    pub terminal_bin: PathBuf,
    pub filebrowser_bin: PathBuf,
    pub entry_dir: PathBuf,
}

impl Config {
    /// Validate CLI input and build the configuration.
    pub fn resolve(cli: &Cli) -> Result<Self, ConfigError> {
        let tls = if cli.https {
            let cert_file = cli.cert_file.clone().ok_or_else(|| ConfigError::MissingRequired {
                key: "cert-file".to_string(),
                hint: "--https requires --cert-file".to_string(),
            })?;
            let key_file = cli.key_file.clone().ok_or_else(|| ConfigError::MissingRequired {
                key: "key-file".to_string(),
                hint: "--https requires --key-file".to_string(),
            })?;
            Some(TlsConfig {
                cert_file,
                key_file,
            })
        } else {
            None
        };

        if cli.shutdown_command.split_whitespace().next().is_none() {
            return Err(ConfigError::InvalidValue {
                key: "shutdown-command".to_string(),
                message: "must not be empty".to_string(),
            });
        }

        Ok(Self {
            instance: InstanceConfig {
                name: cli.agi_name.clone(),
                initial_label: cli.label.clone(),
            },
            paths: AgiPaths::new(&cli.agi_root, &cli.ingest_progress_path, &cli.entry_dir),
            listen: ListenConfig {
                port: cli.listen_port,
                tls,
            },
            auth: AuthConfig::resolve(cli)?,
            lifecycle: LifecycleConfig {
                max_inactivity: non_zero(cli.max_inactivity),
                max_uptime: non_zero(cli.max_uptime),
                shutdown_command: cli.shutdown_command.clone(),
                spot_endpoint: cli.spot_endpoint.clone(),
                debug_activity: cli.debug_activity,
                shell_names: vec!["bash".to_string()],
                database_process_suffix: "asd".to_string(),
            },
            backends: BackendsConfig {
                enabled: !cli.no_backends,
                terminal_bin: cli.terminal_bin.clone(),
                filebrowser_bin: cli.filebrowser_bin.clone(),
                entry_dir: cli.entry_dir.clone(),
            },
            log_json: cli.log_json,
        })
    }
}

fn non_zero(duration: Duration) -> Option<Duration> {
    (!duration.is_zero()).then_some(duration)
}

fn normalize_variant(value: &str) -> String {
    value.trim().to_ascii_lowercase()
}
