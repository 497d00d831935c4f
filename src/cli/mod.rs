//! Command-line interface for agi-proxy.
//!
//! Every flag can also be supplied through an `AGI_PROXY_*` environment
//! variable; `.env` in the working directory is loaded before parsing.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "agi-proxy",
    version,
    about = "Authenticating reverse proxy and lifecycle supervisor for AGI instances"
)]
pub struct Cli {
    /// Instance name reported in notifications.
    #[arg(long, env = "AGI_PROXY_AGI_NAME", default_value = "")]
    pub agi_name: String,

    /// Freeform label shown in dashboards; only written if no label exists yet.
    #[arg(short = 'L', long, env = "AGI_PROXY_LABEL", default_value = "")]
    pub label: String,

    /// Root directory holding PID, label, owner and notifier files.
    #[arg(long, env = "AGI_PROXY_ROOT", default_value = "/opt/agi")]
    pub agi_root: PathBuf,

    /// Directory where the ingest pipeline stores its JSON progress.
    #[arg(
        short = 'i',
        long,
        env = "AGI_PROXY_INGEST_PROGRESS_PATH",
        default_value = "/opt/agi/ingest/"
    )]
    pub ingest_progress_path: PathBuf,

    /// Port to listen on (all interfaces).
    #[arg(short = 'l', long, env = "AGI_PROXY_LISTEN_PORT", default_value_t = 80)]
    pub listen_port: u16,

    /// Enable the HTTPS listener.
    #[arg(short = 'S', long, env = "AGI_PROXY_HTTPS")]
    pub https: bool,

    /// Server certificate (PEM), required with --https.
    #[arg(short = 'C', long, env = "AGI_PROXY_CERT_FILE", value_name = "PATH")]
    pub cert_file: Option<PathBuf>,

    /// Server private key (PEM), required with --https.
    #[arg(short = 'K', long, env = "AGI_PROXY_KEY_FILE", value_name = "PATH")]
    pub key_file: Option<PathBuf>,

    /// Working directory for the terminal and file browser.
    #[arg(
        short = 'd',
        long,
        env = "AGI_PROXY_ENTRY_DIR",
        default_value = "/opt/agi/files"
    )]
    pub entry_dir: PathBuf,

    /// Max user inactivity before the instance is shut down; 0 disables.
    #[arg(
        short = 'm',
        long,
        env = "AGI_PROXY_MAX_INACTIVITY",
        default_value = "1h",
        value_parser = humantime::parse_duration
    )]
    pub max_inactivity: Duration,

    /// Max hard instance uptime; 0 disables.
    #[arg(
        short = 'M',
        long,
        env = "AGI_PROXY_MAX_UPTIME",
        default_value = "24h",
        value_parser = humantime::parse_duration
    )]
    pub max_uptime: Duration,

    /// Command executed when max uptime or max inactivity is breached.
    #[arg(
        short = 'c',
        long,
        env = "AGI_PROXY_SHUTDOWN_COMMAND",
        default_value = "/sbin/poweroff"
    )]
    pub shutdown_command: String,

    /// Authentication type: none|basic|token.
    #[arg(short = 'a', long, env = "AGI_PROXY_AUTH_TYPE", default_value = "none")]
    pub auth_type: String,

    #[arg(
        short = 'u',
        long,
        env = "AGI_PROXY_BASIC_AUTH_USER",
        default_value = "admin"
    )]
    pub basic_auth_user: String,

    #[arg(
        short = 'p',
        long,
        env = "AGI_PROXY_BASIC_AUTH_PASS",
        default_value = "secure",
        hide_env_values = true
    )]
    pub basic_auth_pass: String,

    /// Directory where access tokens are stored.
    #[arg(
        short = 't',
        long = "token-path",
        env = "AGI_PROXY_TOKEN_PATH",
        default_value = "/opt/agitokens"
    )]
    pub token_path: PathBuf,

    /// Name of the token query parameter and cookie.
    #[arg(
        short = 'T',
        long,
        env = "AGI_PROXY_TOKEN_NAME",
        default_value = "AGI_TOKEN"
    )]
    pub token_name: String,

    /// Log every inactivity monitor decision.
    #[arg(short = 'D', long = "debug-activity", env = "AGI_PROXY_DEBUG_ACTIVITY")]
    pub debug_activity: bool,

    /// Cloud metadata URL announcing spot interruptions.
    #[arg(
        long,
        env = "AGI_PROXY_SPOT_ENDPOINT",
        default_value = "http://169.254.169.254/latest/meta-data/spot/instance-action"
    )]
    pub spot_endpoint: String,

    #[arg(
        long,
        env = "AGI_PROXY_TERMINAL_BIN",
        default_value = "/usr/local/bin/ttyd"
    )]
    pub terminal_bin: PathBuf,

    #[arg(
        long,
        env = "AGI_PROXY_FILEBROWSER_BIN",
        default_value = "/usr/local/bin/filebrowser"
    )]
    pub filebrowser_bin: PathBuf,

    /// Do not launch the terminal and file browser child processes.
    #[arg(long, env = "AGI_PROXY_NO_BACKENDS")]
    pub no_backends: bool,

    /// Emit logs as JSON lines.
    #[arg(long, env = "AGI_PROXY_LOG_JSON")]
    pub log_json: bool,
}
