//! Status aggregation.
//!
//! Builds a [`StatusSnapshot`] from the pipeline's progress files and the
//! process table. Every probe degrades independently: a missing file, bad
//! JSON or stale PID zeroes its own field and nothing else.

pub mod process;
pub mod progress;

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::AgiPaths;

use self::process::{ProcessTable, any_name_ends_with, pid_file_alive};
use self::progress::{
    CompletedSteps, DownloadFile, DownloaderProgress, FileErrorsProgress, LogProcessorProgress,
    Stage, decode_or_default,
};

/// Point-in-time view of daemon, helper and pipeline health.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub database_running: bool,
    pub helper_running: bool,
    pub plugin_running: bool,
    pub ingest: IngestStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestStatus {
    pub running: bool,
    pub complete_steps: CompletedSteps,
    pub downloader_total_size: u64,
    pub downloader_complete_size: u64,
    pub downloader_complete_pct: u32,
    pub log_processor_total_size: u64,
    pub log_processor_complete_size: u64,
    pub log_processor_complete_pct: u32,
    pub errors: Vec<String>,
}

/// Integer percentage, zero when `total` is zero. Saturates at `u32::MAX`
/// when `done` far exceeds `total`.
pub fn percent(done: u64, total: u64) -> u32 {
    if total == 0 {
        return 0;
    }
    u32::try_from(u128::from(done) * 100 / u128::from(total)).unwrap_or(u32::MAX)
}

/// Collects status snapshots for one instance layout.
pub struct StatusAggregator {
    paths: AgiPaths,
    processes: Arc<dyn ProcessTable>,
    database_suffix: String,
}

impl StatusAggregator {
    pub fn new(
        paths: AgiPaths,
        processes: Arc<dyn ProcessTable>,
        database_suffix: impl Into<String>,
    ) -> Self {
        Self {
            paths,
            processes,
            database_suffix: database_suffix.into(),
        }
    }

    pub fn paths(&self) -> &AgiPaths {
        &self.paths
    }

    pub fn processes(&self) -> &Arc<dyn ProcessTable> {
        &self.processes
    }

    /// Build a fresh snapshot. Blocking: reads files and the process table.
    pub fn snapshot(&self) -> StatusSnapshot {
        let table = self.processes.as_ref();
        let mut status = StatusSnapshot {
            database_running: any_name_ends_with(table, &self.database_suffix),
            helper_running: pid_file_alive(&self.paths.helper_pid, table),
            plugin_running: pid_file_alive(&self.paths.plugin_pid, table),
            ingest: IngestStatus {
                running: pid_file_alive(&self.paths.ingest_pid, table),
                ..IngestStatus::default()
            },
        };

        let steps: CompletedSteps = decode_or_default(&self.paths.steps_file);
        status.ingest.complete_steps = steps;

        let Some(stage) = Stage::from_steps(&steps) else {
            return status;
        };
        let progress_path = self.paths.ingest_progress.join(stage.progress_file());
        let ingest = &mut status.ingest;
        match stage {
            Stage::Download => {
                let progress: DownloaderProgress = decode_or_default(&progress_path);
                self.apply_download(ingest, &progress);
            }
            Stage::Unpack | Stage::PreProcess => {
                ingest.downloader_complete_pct = 100;
                let progress: FileErrorsProgress = decode_or_default(&progress_path);
                for (name, file) in &progress.files {
                    for error in &file.errors {
                        ingest.errors.push(format!("{name}::{error}"));
                    }
                }
            }
            Stage::ProcessLogs => {
                ingest.downloader_complete_pct = 100;
                let progress: LogProcessorProgress = decode_or_default(&progress_path);
                let mut total = 0u64;
                let mut done = 0u64;
                for file in progress.files.values() {
                    total = total.saturating_add(file.size);
                    let processed = if file.finished { file.size } else { file.processed };
                    done = done.saturating_add(processed);
                }
                ingest.log_processor_total_size = total;
                ingest.log_processor_complete_size = done;
                ingest.log_processor_complete_pct = percent(done, total);
            }
        }
        status
    }

    fn apply_download(&self, ingest: &mut IngestStatus, progress: &DownloaderProgress) {
        let input = self.paths.files_dir.join("input");
        let sources = [
            (&progress.s3_files, input.join("s3source")),
            (&progress.sftp_files, input.join("sftpsource")),
        ];
        let mut total = 0u64;
        let mut done = 0u64;
        for (files, local_dir) in sources {
            for (name, file) in files {
                if !file.error.is_empty() {
                    ingest.errors.push(format!("{name}::{}", file.error));
                }
                total = total.saturating_add(file.size);
                done = done.saturating_add(downloaded_bytes(name, file, &local_dir));
            }
        }
        ingest.downloader_total_size = total;
        ingest.downloader_complete_size = done;
        ingest.downloader_complete_pct = percent(done, total);
    }

    /// Snapshot on the blocking pool; a failed task yields an empty snapshot.
    pub async fn collect(self: &Arc<Self>) -> StatusSnapshot {
        let this = self.clone();
        match tokio::task::spawn_blocking(move || this.snapshot()).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::error!(error = %e, "Status collection task failed");
                StatusSnapshot::default()
            }
        }
    }
}

/// Bytes of `file` already on disk: the declared size once downloaded,
/// otherwise whatever the partial local copy holds.
fn downloaded_bytes(name: &str, file: &DownloadFile, local_dir: &Path) -> u64 {
    if file.is_downloaded {
        return file.size;
    }
    std::fs::metadata(local_dir.join(name))
        .map(|m| m.len())
        .unwrap_or(0)
}
