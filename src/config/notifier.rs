//! Instance-local notifier and pipeline-source settings (YAML).

use std::path::Path;

use secrecy::SecretString;
use serde::Deserialize;

use crate::error::ConfigError;

const DEFAULT_SLACK_API_URL: &str = "https://slack.com/api/chat.postMessage";

/// Sinks for lifecycle notifications, read from `notifier.yaml`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NotifierConfig {
    /// JSON webhook URL.
    pub endpoint: Option<String>,
    /// Extra webhook headers as `Name: value`.
    pub headers: Vec<String>,
    #[serde(deserialize_with = "deserialize_secret")]
    pub slack_token: Option<SecretString>,
    pub slack_channel: Option<String>,
    pub slack_api_url: Option<String>,
}

impl NotifierConfig {
    /// Load the notifier file. A missing file yields `Ok(None)`.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(ConfigError::Io(e)),
        };
        if content.trim().is_empty() {
            return Ok(Some(Self::default()));
        }
        serde_yml::from_str(&content)
            .map(Some)
            .map_err(|e| ConfigError::ParseError {
                path: path.display().to_string(),
                message: e.to_string(),
            })
    }

    pub fn webhook_endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref().filter(|s| !s.trim().is_empty())
    }

    pub fn slack_enabled(&self) -> bool {
        self.slack_token.is_some()
            && self
                .slack_channel
                .as_deref()
                .is_some_and(|c| !c.trim().is_empty())
    }

    pub fn slack_api_url(&self) -> &str {
        self.slack_api_url
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(DEFAULT_SLACK_API_URL)
    }
}

fn deserialize_secret<'de, D>(deserializer: D) -> Result<Option<SecretString>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?
        .filter(|s| !s.trim().is_empty())
        .map(SecretString::from))
}

/// Data sources configured for the ingest pipeline, read from `ingest.yaml`.
///
/// Only the parts shown in chat summaries are modelled.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IngestSources {
    pub downloader: DownloaderSources,
    pub custom_source_name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DownloaderSources {
    pub s3_source: S3Source,
    pub sftp_source: SftpSource,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct S3Source {
    pub enabled: bool,
    pub bucket_name: String,
    pub path_prefix: String,
    pub search_regex: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SftpSource {
    pub enabled: bool,
    pub host: String,
    pub path_prefix: String,
    pub search_regex: String,
}

impl IngestSources {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        serde_yml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }

    /// One quoted summary line per enabled source.
    pub fn summary_lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        let s3 = &self.downloader.s3_source;
        if s3.enabled {
            lines.push(format!(
                "> *S3 Source*: {}:{} {}",
                s3.bucket_name, s3.path_prefix, s3.search_regex
            ));
        }
        let sftp = &self.downloader.sftp_source;
        if sftp.enabled {
            lines.push(format!(
                "> *SFTP Source*: {}:{} {}",
                sftp.host, sftp.path_prefix, sftp.search_regex
            ));
        }
        if !self.custom_source_name.is_empty() {
            lines.push(format!("> *Custom Source*: {}", self.custom_source_name));
        }
        lines
    }
}
