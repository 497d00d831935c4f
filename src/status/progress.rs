//! Ingest pipeline progress files.
//!
//! The pipeline writes one JSON document per stage, optionally gzipped
//! (`<name>.gz`) once the stage is finished. Keys are PascalCase.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;
use tokio_util::io::SyncIoBridge;

/// Pipe capacity between the decompressing thread and the response body.
const STREAM_BUFFER: usize = 64 * 1024;

/// Names accepted by the ingest detail endpoint.
pub const DETAIL_FILES: [&str; 6] = [
    "downloader.json",
    "unpacker.json",
    "pre-processor.json",
    "log-processor.json",
    "cf-processor.json",
    "steps.json",
];

pub const STEPS_FILE: &str = "steps.json";

/// The "steps completed" marker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct CompletedSteps {
    pub init: bool,
    pub download: bool,
    pub unpack: bool,
    pub pre_process: bool,
    pub process_logs: bool,
    pub process_collect_info: bool,
}

/// The stage whose progress file describes the pipeline right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Download,
    Unpack,
    PreProcess,
    ProcessLogs,
}

impl Stage {
    /// Active stage for a steps marker, `None` before init.
    pub fn from_steps(steps: &CompletedSteps) -> Option<Self> {
        if steps.init && !steps.download {
            Some(Self::Download)
        } else if steps.download && !steps.unpack {
            Some(Self::Unpack)
        } else if steps.unpack && !steps.pre_process {
            Some(Self::PreProcess)
        } else if steps.pre_process {
            Some(Self::ProcessLogs)
        } else {
            None
        }
    }

    pub fn progress_file(self) -> &'static str {
        match self {
            Self::Download => "downloader.json",
            Self::Unpack => "unpacker.json",
            Self::PreProcess => "pre-processor.json",
            Self::ProcessLogs => "log-processor.json",
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct DownloaderProgress {
    pub s3_files: BTreeMap<String, DownloadFile>,
    pub sftp_files: BTreeMap<String, DownloadFile>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct DownloadFile {
    pub size: u64,
    pub is_downloaded: bool,
    pub error: String,
}

/// Shared shape of the unpacker and pre-processor progress files.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct FileErrorsProgress {
    pub files: BTreeMap<String, FileErrors>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct FileErrors {
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct LogProcessorProgress {
    pub files: BTreeMap<String, LogFile>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct LogFile {
    pub size: u64,
    pub processed: u64,
    pub finished: bool,
}

/// Where a progress file was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Located {
    pub path: PathBuf,
    pub gzipped: bool,
}

/// Find `path`, falling back to `path.gz`.
pub fn locate(path: &Path) -> Option<Located> {
    if path.is_file() {
        return Some(Located {
            path: path.to_path_buf(),
            gzipped: false,
        });
    }
    let mut gz = path.as_os_str().to_owned();
    gz.push(".gz");
    let gz = PathBuf::from(gz);
    gz.is_file().then_some(Located {
        path: gz,
        gzipped: true,
    })
}

/// Read a located file, decompressing if needed.
pub fn read_located(located: &Located) -> std::io::Result<Vec<u8>> {
    let raw = std::fs::read(&located.path)?;
    if !located.gzipped {
        return Ok(raw);
    }
    let mut out = Vec::new();
    GzDecoder::new(raw.as_slice()).read_to_end(&mut out)?;
    Ok(out)
}

/// Open a located file as an async byte stream.
///
/// Gzipped files are decompressed on a blocking thread into a pipe; a read
/// error mid-stream ends the stream early.
pub async fn open_stream(
    located: &Located,
) -> std::io::Result<Box<dyn AsyncRead + Send + Unpin>> {
    let file = tokio::fs::File::open(&located.path).await?;
    if !located.gzipped {
        return Ok(Box::new(file));
    }
    let file = file.into_std().await;
    let (reader, writer) = tokio::io::duplex(STREAM_BUFFER);
    let mut writer = SyncIoBridge::new(writer);
    let path = located.path.clone();
    tokio::task::spawn_blocking(move || {
        if let Err(e) = std::io::copy(&mut GzDecoder::new(file), &mut writer) {
            tracing::warn!(path = %path.display(), error = %e, "Progress stream interrupted");
        }
    });
    Ok(Box::new(reader))
}

/// Read `path` or its gzipped form. `Ok(None)` when neither exists.
pub fn read_progress(path: &Path) -> std::io::Result<Option<Vec<u8>>> {
    match locate(path) {
        Some(located) => read_located(&located).map(Some),
        None => Ok(None),
    }
}

/// Decode a progress document, degrading to the default on any failure.
pub fn decode_or_default<T>(path: &Path) -> T
where
    T: serde::de::DeserializeOwned + Default,
{
    match read_progress(path) {
        Ok(Some(bytes)) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
            tracing::warn!(path = %path.display(), error = %e, "Unparsable progress file");
            T::default()
        }),
        Ok(None) => T::default(),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Could not read progress file");
            T::default()
        }
    }
}
