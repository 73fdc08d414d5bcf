//! Scripted ingestion API used by the upload queue unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;

use super::client::{
    IngestionApi, JobStatusReport, ServerJobState, TransferProgress, UploadAccepted,
    UploadRequest,
};
use super::error::TransferError;

/// How the fake upload endpoint answers for a given archive file name.
#[derive(Debug, Clone)]
pub(crate) enum UploadBehavior {
    Accept { units_total: u32 },
    Reject { status: u16, message: String },
    Malformed,
}

/// One scripted answer of the fake status endpoint.
#[derive(Debug, Clone)]
pub(crate) enum StatusStep {
    Report(JobStatusReport),
    Error(String),
}

impl StatusStep {
    pub(crate) fn processing(percent: i64, processed: u32, total: u32) -> Self {
        StatusStep::Report(JobStatusReport {
            state: ServerJobState::Processing,
            progress_percent: percent,
            units_processed: processed,
            units_total: total,
            error: None,
        })
    }

    pub(crate) fn completed(processed: u32, total: u32) -> Self {
        StatusStep::Report(JobStatusReport {
            state: ServerJobState::Completed,
            progress_percent: 100,
            units_processed: processed,
            units_total: total,
            error: None,
        })
    }

    pub(crate) fn failed(error: Option<&str>) -> Self {
        StatusStep::Report(JobStatusReport {
            state: ServerJobState::Failed,
            progress_percent: 0,
            units_processed: 0,
            units_total: 0,
            error: error.map(str::to_string),
        })
    }
}

/// In-memory stand-in for the upload and job status endpoints.
///
/// Server job ids are `srv-<file name>`. Status scripts are consumed one step
/// per call and the last step repeats forever; jobs without a script complete
/// on the first poll.
pub(crate) struct FakeIngestionApi {
    upload_behaviors: Mutex<HashMap<String, UploadBehavior>>,
    status_scripts: Mutex<HashMap<String, VecDeque<StatusStep>>>,
    upload_log: Mutex<Vec<UploadRequest>>,
    status_calls: Mutex<HashMap<String, usize>>,
    upload_delay: Duration,
    status_delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeIngestionApi {
    pub(crate) fn new() -> Self {
        Self::with_upload_delay(Duration::ZERO)
    }

    pub(crate) fn with_upload_delay(upload_delay: Duration) -> Self {
        Self {
            upload_behaviors: Mutex::new(HashMap::new()),
            status_scripts: Mutex::new(HashMap::new()),
            upload_log: Mutex::new(Vec::new()),
            status_calls: Mutex::new(HashMap::new()),
            upload_delay,
            status_delay: Duration::ZERO,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Every status request takes this long before answering.
    pub(crate) fn with_status_delay(mut self, status_delay: Duration) -> Self {
        self.status_delay = status_delay;
        self
    }

    pub(crate) fn set_upload_behavior(&self, file_name: &str, behavior: UploadBehavior) {
        self.upload_behaviors
            .lock()
            .unwrap()
            .insert(file_name.to_string(), behavior);
    }

    pub(crate) fn set_status_script(&self, server_job_id: &str, steps: Vec<StatusStep>) {
        self.status_scripts
            .lock()
            .unwrap()
            .insert(server_job_id.to_string(), steps.into());
    }

    pub(crate) fn upload_requests(&self) -> Vec<UploadRequest> {
        self.upload_log.lock().unwrap().clone()
    }

    /// File names of uploaded archives, in call order.
    pub(crate) fn uploaded_files(&self) -> Vec<String> {
        self.upload_requests()
            .iter()
            .map(|r| r.source.file_name())
            .collect()
    }

    pub(crate) fn status_calls(&self, server_job_id: &str) -> usize {
        self.status_calls
            .lock()
            .unwrap()
            .get(server_job_id)
            .copied()
            .unwrap_or(0)
    }

    pub(crate) fn max_concurrent_uploads(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IngestionApi for FakeIngestionApi {
    async fn upload_archive(
        &self,
        request: UploadRequest,
        progress: mpsc::UnboundedSender<TransferProgress>,
    ) -> Result<UploadAccepted, TransferError> {
        let file_name = request.source.file_name();
        let total = request.source.known_size().unwrap_or(0);
        self.upload_log.lock().unwrap().push(request);

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        for quarter in 1..=4u64 {
            let _ = progress.send(TransferProgress {
                bytes_sent: total * quarter / 4,
                bytes_total: total,
            });
        }
        if !self.upload_delay.is_zero() {
            tokio::time::sleep(self.upload_delay).await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let behavior = self
            .upload_behaviors
            .lock()
            .unwrap()
            .get(&file_name)
            .cloned()
            .unwrap_or(UploadBehavior::Accept { units_total: 10 });

        match behavior {
            UploadBehavior::Accept { units_total } => Ok(UploadAccepted {
                job_id: format!("srv-{}", file_name),
                units_total,
            }),
            UploadBehavior::Reject { status, message } => {
                Err(TransferError::Rejected { status, message })
            }
            UploadBehavior::Malformed => Err(TransferError::MalformedResponse(
                "missing field `job_id`".to_string(),
            )),
        }
    }

    async fn job_status(&self, server_job_id: &str) -> Result<JobStatusReport> {
        *self
            .status_calls
            .lock()
            .unwrap()
            .entry(server_job_id.to_string())
            .or_insert(0) += 1;

        if !self.status_delay.is_zero() {
            tokio::time::sleep(self.status_delay).await;
        }

        let step = {
            let mut scripts = self.status_scripts.lock().unwrap();
            match scripts.get_mut(server_job_id) {
                Some(steps) if steps.len() > 1 => steps.pop_front(),
                Some(steps) => steps.front().cloned(),
                None => None,
            }
        };

        match step.unwrap_or_else(|| StatusStep::completed(0, 0)) {
            StatusStep::Report(report) => Ok(report),
            StatusStep::Error(message) => Err(anyhow!(message)),
        }
    }
}
