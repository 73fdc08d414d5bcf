//! Transfer driver: moves one archive's bytes to the upload endpoint.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::client::{IngestionApi, TransferProgress, UploadAccepted, UploadRequest};
use super::error::UploadError;
use super::queue::QueueShared;

/// Percentage of an archive sent so far, rounded down.
///
/// An empty archive counts as fully sent.
pub fn percent_of(bytes_sent: u64, bytes_total: u64) -> i64 {
    if bytes_total == 0 {
        return 100;
    }
    let sent = bytes_sent.min(bytes_total) as u128;
    (sent * 100 / bytes_total as u128) as i64
}

/// Uploads a single job's archive and records the outcome on the job.
///
/// The upload queue never runs two transfers at once, so a driver never sees
/// the same job twice concurrently.
pub(crate) struct TransferDriver {
    api: Arc<dyn IngestionApi>,
    destination: Option<String>,
}

impl TransferDriver {
    pub(crate) fn new(api: Arc<dyn IngestionApi>, destination: Option<String>) -> Self {
        Self { api, destination }
    }

    /// Transfer the archive of `job_id`.
    ///
    /// Returns the server's acceptance once the job is in `SERVER_PROCESSING`.
    /// A rejected or broken upload marks the job failed and is returned as
    /// `UploadError::Transfer`. Any other error means the transfer never started.
    pub(crate) async fn transfer(
        &self,
        shared: &QueueShared,
        job_id: &str,
    ) -> Result<UploadAccepted, UploadError> {
        let request = shared
            .update_job(job_id, |job| {
                job.begin_transfer()?;
                Ok(UploadRequest {
                    display_name: job.display_name.clone(),
                    options: job.options.clone(),
                    destination: self.destination.clone(),
                    source: job.source.clone(),
                })
            })
            .await?;

        match request.source.known_size() {
            Some(size) => info!(
                "Transferring {:?} ({:#})",
                request.display_name,
                byte_unit::Byte::from(size)
            ),
            None => info!("Transferring {:?}", request.display_name),
        }

        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        let upload = self.api.upload_archive(request, progress_tx);
        tokio::pin!(upload);

        let mut last_percent = None;
        let result = loop {
            tokio::select! {
                Some(progress) = progress_rx.recv() => {
                    self.apply_progress(shared, job_id, progress, &mut last_percent).await;
                }
                result = &mut upload => break result,
            }
        };
        while let Ok(progress) = progress_rx.try_recv() {
            self.apply_progress(shared, job_id, progress, &mut last_percent)
                .await;
        }

        match result {
            Ok(accepted) => {
                shared
                    .update_job(job_id, |job| {
                        job.accept(&accepted.job_id, accepted.units_total)
                    })
                    .await?;
                info!(
                    "Upload of job {} accepted as server job {} ({} units)",
                    job_id, accepted.job_id, accepted.units_total
                );
                Ok(accepted)
            }
            Err(e) => {
                warn!("Upload of job {} failed: {}", job_id, e);
                shared
                    .update_job(job_id, |job| job.mark_failed(e.to_string()))
                    .await?;
                Err(UploadError::Transfer(e))
            }
        }
    }

    async fn apply_progress(
        &self,
        shared: &QueueShared,
        job_id: &str,
        progress: TransferProgress,
        last_percent: &mut Option<i64>,
    ) {
        let percent = percent_of(progress.bytes_sent, progress.bytes_total);
        if *last_percent == Some(percent) {
            return;
        }
        *last_percent = Some(percent);

        if let Err(e) = shared
            .update_job(job_id, |job| job.apply_transfer_progress(percent))
            .await
        {
            debug!("Dropping transfer progress for job {}: {}", job_id, e);
        }
    }
}
