//! Data models for the upload queue.
//!
//! Defines upload jobs, their lifecycle stages and the queue-wide summary.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::error::UploadError;

/// Free-form metadata fields sent along with an archive (e.g. `category`).
pub type JobOptions = BTreeMap<String, String>;

/// Lifecycle stage of an upload job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UploadStage {
    /// Waiting for its turn to be transferred.
    Queued,
    /// Archive bytes are being sent to the upload endpoint.
    Transferring,
    /// Server accepted the archive and is extracting/analyzing it.
    ServerProcessing,
    Completed, // terminal
    Failed,    // terminal
}

impl UploadStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Transferring => "TRANSFERRING",
            Self::ServerProcessing => "SERVER_PROCESSING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Jobs in these stages hold a transfer or a poller and cannot be removed.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Transferring | Self::ServerProcessing)
    }

    /// Only queued and failed jobs may start a (re)transfer.
    pub fn can_start_transfer(&self) -> bool {
        matches!(self, Self::Queued | Self::Failed)
    }
}

impl std::fmt::Display for UploadStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The archive to upload. Never changes once a job is created.
#[derive(Debug, Clone)]
pub enum ArchiveSource {
    /// Archive read from disk while it is being transferred.
    File(PathBuf),
    /// Archive already held in memory.
    Memory { file_name: String, data: Bytes },
}

impl ArchiveSource {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        ArchiveSource::File(path.into())
    }

    pub fn memory(file_name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        ArchiveSource::Memory {
            file_name: file_name.into(),
            data: data.into(),
        }
    }

    /// File name sent in the multipart body.
    pub fn file_name(&self) -> String {
        match self {
            ArchiveSource::File(path) => path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("archive")
                .to_string(),
            ArchiveSource::Memory { file_name, .. } => file_name.clone(),
        }
    }

    /// Size in bytes, if it can be determined without reading the archive.
    pub fn known_size(&self) -> Option<u64> {
        match self {
            ArchiveSource::File(path) => std::fs::metadata(path).ok().map(|m| m.len()),
            ArchiveSource::Memory { data, .. } => Some(data.len() as u64),
        }
    }
}

/// Default label for an archive: its file name without the extension.
fn default_display_name(file_name: &str) -> String {
    Path::new(file_name)
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .unwrap_or(file_name)
        .to_string()
}

/// One archive in the upload queue.
///
/// Stages move along `QUEUED -> TRANSFERRING -> SERVER_PROCESSING -> COMPLETED`,
/// with `FAILED` reachable from both active stages. A failed job may start a
/// new transfer, which resets everything the previous attempt recorded.
#[derive(Debug, Clone, Serialize)]
pub struct UploadJob {
    /// Local identifier, unrelated to the server job id.
    pub id: String,
    #[serde(skip)]
    pub source: ArchiveSource,
    pub display_name: String,
    pub options: JobOptions,
    pub stage: UploadStage,
    pub transfer_progress: u8,
    pub server_progress: u8,
    pub units_processed: u32,
    pub units_total: Option<u32>,
    pub server_job_id: Option<String>,
    pub error_message: Option<String>,
    pub size_bytes: Option<u64>,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Position in the queue, assigned at enqueue time.
    #[serde(skip)]
    pub(crate) seq: u64,
}

impl UploadJob {
    /// Create a queued job for an archive.
    pub fn new(source: ArchiveSource, options: JobOptions) -> Self {
        let display_name = default_display_name(&source.file_name());
        let size_bytes = source.known_size();

        Self {
            id: uuid::Uuid::new_v4().to_string(),
            source,
            display_name,
            options,
            stage: UploadStage::Queued,
            transfer_progress: 0,
            server_progress: 0,
            units_processed: 0,
            units_total: None,
            server_job_id: None,
            error_message: None,
            size_bytes,
            attempts: 0,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            seq: 0,
        }
    }

    fn require(&self, allowed: &[UploadStage], expected: &str) -> Result<(), UploadError> {
        if allowed.contains(&self.stage) {
            Ok(())
        } else {
            Err(UploadError::invalid_state(expected, self.stage.as_str()))
        }
    }

    /// Change the label. Only allowed before a transfer starts or after a failure.
    pub fn rename(&mut self, name: impl Into<String>) -> Result<(), UploadError> {
        self.require(
            &[UploadStage::Queued, UploadStage::Failed],
            "QUEUED or FAILED",
        )?;
        self.display_name = name.into();
        Ok(())
    }

    /// Replace the metadata fields. Same restriction as [`UploadJob::rename`].
    pub fn set_options(&mut self, options: JobOptions) -> Result<(), UploadError> {
        self.require(
            &[UploadStage::Queued, UploadStage::Failed],
            "QUEUED or FAILED",
        )?;
        self.options = options;
        Ok(())
    }

    /// Enter `TRANSFERRING`, clearing whatever a previous attempt left behind.
    pub fn begin_transfer(&mut self) -> Result<(), UploadError> {
        self.require(
            &[UploadStage::Queued, UploadStage::Failed],
            "QUEUED or FAILED",
        )?;
        self.stage = UploadStage::Transferring;
        self.transfer_progress = 0;
        self.server_progress = 0;
        self.units_processed = 0;
        self.units_total = None;
        self.server_job_id = None;
        self.error_message = None;
        self.attempts += 1;
        self.started_at = Some(Utc::now());
        self.finished_at = None;
        Ok(())
    }

    pub fn apply_transfer_progress(&mut self, percent: i64) -> Result<(), UploadError> {
        self.require(&[UploadStage::Transferring], "TRANSFERRING")?;
        self.transfer_progress = percent.clamp(0, 100) as u8;
        Ok(())
    }

    /// Record the server's acceptance of the archive and enter `SERVER_PROCESSING`.
    pub fn accept(&mut self, server_job_id: &str, units_total: u32) -> Result<(), UploadError> {
        self.require(&[UploadStage::Transferring], "TRANSFERRING")?;
        self.stage = UploadStage::ServerProcessing;
        self.transfer_progress = 100;
        self.server_job_id = Some(server_job_id.to_string());
        self.units_total = Some(units_total);
        Ok(())
    }

    /// Apply a status report. A zero total means the server does not know it yet.
    pub fn apply_server_status(
        &mut self,
        percent: i64,
        units_processed: u32,
        units_total: u32,
    ) -> Result<(), UploadError> {
        self.require(&[UploadStage::ServerProcessing], "SERVER_PROCESSING")?;
        self.server_progress = percent.clamp(0, 100) as u8;
        self.units_processed = units_processed;
        if units_total > 0 {
            self.units_total = Some(units_total);
        }
        Ok(())
    }

    pub fn mark_completed(&mut self) -> Result<(), UploadError> {
        self.require(
            &[UploadStage::Transferring, UploadStage::ServerProcessing],
            "TRANSFERRING or SERVER_PROCESSING",
        )?;
        self.stage = UploadStage::Completed;
        self.server_progress = 100;
        self.error_message = None;
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>) -> Result<(), UploadError> {
        self.require(
            &[UploadStage::Transferring, UploadStage::ServerProcessing],
            "TRANSFERRING or SERVER_PROCESSING",
        )?;
        self.stage = UploadStage::Failed;
        self.error_message = Some(reason.into());
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    /// Progress of whichever phase is current, for display.
    pub fn progress_percent(&self) -> u8 {
        match self.stage {
            UploadStage::Queued => 0,
            UploadStage::Transferring => self.transfer_progress,
            UploadStage::ServerProcessing => self.server_progress,
            UploadStage::Completed => 100,
            UploadStage::Failed => 0,
        }
    }
}

/// Aggregate view of the queue, always derived from the jobs themselves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueSummary {
    pub total: usize,
    pub queued: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub overall_percent: u8,
    pub all_done: bool,
}

impl QueueSummary {
    pub fn from_jobs(jobs: &[UploadJob]) -> Self {
        let mut summary = QueueSummary {
            total: jobs.len(),
            ..Default::default()
        };

        for job in jobs {
            match job.stage {
                UploadStage::Queued => summary.queued += 1,
                UploadStage::Transferring | UploadStage::ServerProcessing => summary.active += 1,
                UploadStage::Completed => summary.completed += 1,
                UploadStage::Failed => summary.failed += 1,
            }
        }

        summary.overall_percent = if summary.total == 0 {
            0
        } else {
            let finished = (summary.completed + summary.failed) as f64;
            (finished / summary.total as f64 * 100.0).round() as u8
        };
        summary.all_done = summary.total > 0
            && summary.active == 0
            && summary.completed + summary.failed == summary.total;

        summary
    }
}
