//! Queue orchestrator.
//!
//! Owns the ordered list of upload jobs, runs transfers one at a time and
//! hands accepted archives to status pollers. The queue is headless: views
//! observe it through [`UploadQueue::subscribe`] and never hold job state.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::client::IngestionApi;
use super::error::UploadError;
use super::models::{ArchiveSource, JobOptions, QueueSummary, UploadJob, UploadStage};
use super::poller::{PollerConfig, PollerRegistry, StatusPoller};
use super::transfer::TransferDriver;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

const CANCELLED_MESSAGE: &str = "Processing cancelled";

/// Change notifications broadcast to every subscriber.
#[derive(Debug, Clone)]
pub enum QueueEvent {
    JobAdded(UploadJob),
    /// Snapshot of a job right after it changed.
    JobUpdated(UploadJob),
    JobRemoved(String),
    RunStarted,
    RunFinished { attempted: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Idle,
    Running,
    /// Shut down; no transfer or poller will start again.
    Stopped,
}

/// Result of [`UploadQueue::run_all`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The pass went through the queue and started this many transfers.
    Finished { attempted: usize },
    /// Another pass was already in progress; nothing was done.
    AlreadyRunning,
}

#[derive(Debug, Clone, Default)]
pub struct UploadQueueSettings {
    /// Sent as the `destination` field of every upload, when set.
    pub destination: Option<String>,
    pub poller: PollerConfig,
}

/// Job list shared by the queue, the transfer driver and the pollers.
///
/// Every mutation is a read-modify-write of one job under the write lock,
/// followed by a broadcast of the new snapshot.
pub(crate) struct QueueShared {
    jobs: RwLock<Vec<UploadJob>>,
    events: broadcast::Sender<QueueEvent>,
    next_seq: AtomicU64,
}

impl QueueShared {
    pub(crate) fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            jobs: RwLock::new(Vec::new()),
            events,
            next_seq: AtomicU64::new(1),
        }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: QueueEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    pub(crate) async fn enqueue(
        &self,
        sources: Vec<ArchiveSource>,
        options: &JobOptions,
    ) -> Vec<String> {
        let mut jobs = self.jobs.write().await;
        let mut ids = Vec::with_capacity(sources.len());
        for source in sources {
            let mut job = UploadJob::new(source, options.clone());
            job.seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
            ids.push(job.id.clone());
            self.emit(QueueEvent::JobAdded(job.clone()));
            jobs.push(job);
        }
        ids
    }

    pub(crate) async fn job(&self, job_id: &str) -> Option<UploadJob> {
        self.jobs
            .read()
            .await
            .iter()
            .find(|j| j.id == job_id)
            .cloned()
    }

    pub(crate) async fn jobs(&self) -> Vec<UploadJob> {
        self.jobs.read().await.clone()
    }

    pub(crate) async fn summary(&self) -> QueueSummary {
        QueueSummary::from_jobs(&self.jobs.read().await)
    }

    /// Apply `f` to one job. The job is only broadcast when `f` succeeds;
    /// a failing transition leaves it untouched.
    pub(crate) async fn update_job<T, F>(&self, job_id: &str, f: F) -> Result<T, UploadError>
    where
        F: FnOnce(&mut UploadJob) -> Result<T, UploadError>,
    {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .iter_mut()
            .find(|j| j.id == job_id)
            .ok_or_else(|| UploadError::JobNotFound(job_id.to_string()))?;

        let mut updated = job.clone();
        let value = f(&mut updated)?;
        *job = updated.clone();
        self.emit(QueueEvent::JobUpdated(updated));
        Ok(value)
    }

    /// Remove a job that is not active. `Ok(None)` if it does not exist.
    pub(crate) async fn remove(&self, job_id: &str) -> Result<Option<UploadJob>, UploadError> {
        let mut jobs = self.jobs.write().await;
        let Some(index) = jobs.iter().position(|j| j.id == job_id) else {
            return Ok(None);
        };
        if jobs[index].stage.is_active() {
            return Err(UploadError::invalid_state(
                "QUEUED, COMPLETED or FAILED",
                jobs[index].stage.as_str(),
            ));
        }
        let job = jobs.remove(index);
        self.emit(QueueEvent::JobRemoved(job.id.clone()));
        Ok(Some(job))
    }

    /// First job after `cursor` in queue order that may start a transfer.
    pub(crate) async fn next_pending_after(&self, cursor: u64) -> Option<(String, u64)> {
        self.jobs
            .read()
            .await
            .iter()
            .find(|j| j.seq > cursor && j.stage.can_start_transfer())
            .map(|j| (j.id.clone(), j.seq))
    }
}

/// Clears the running flag when a pass ends, however it ends.
struct RunGuard<'a> {
    running: &'a AtomicBool,
}

impl<'a> RunGuard<'a> {
    fn acquire(running: &'a AtomicBool) -> Option<Self> {
        running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| RunGuard { running })
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

struct QueueInner {
    shared: Arc<QueueShared>,
    driver: TransferDriver,
    poller: StatusPoller,
    registry: Arc<PollerRegistry>,
    running: AtomicBool,
    shutdown_token: CancellationToken,
}

impl Drop for QueueInner {
    fn drop(&mut self) {
        self.shutdown_token.cancel();
        let stopped = self.registry.close();
        if !stopped.is_empty() {
            debug!("Upload queue dropped, cancelled {} pollers", stopped.len());
        }
    }
}

/// Batch upload orchestrator. Cheap to clone; all clones share one queue.
///
/// Pollers are cancelled by [`UploadQueue::shutdown`] or when the last clone
/// is dropped.
#[derive(Clone)]
pub struct UploadQueue {
    inner: Arc<QueueInner>,
}

impl UploadQueue {
    pub fn new(api: Arc<dyn IngestionApi>, settings: UploadQueueSettings) -> Self {
        let shared = Arc::new(QueueShared::new());
        let registry = Arc::new(PollerRegistry::new());
        let driver = TransferDriver::new(Arc::clone(&api), settings.destination);
        let poller = StatusPoller::new(
            api,
            Arc::clone(&shared),
            Arc::clone(&registry),
            settings.poller,
        );

        Self {
            inner: Arc::new(QueueInner {
                shared,
                driver,
                poller,
                registry,
                running: AtomicBool::new(false),
                shutdown_token: CancellationToken::new(),
            }),
        }
    }

    /// Add archives to the end of the queue, each with its own copy of `options`.
    pub async fn enqueue(&self, sources: Vec<ArchiveSource>, options: &JobOptions) -> Vec<String> {
        let count = sources.len();
        let ids = self.inner.shared.enqueue(sources, options).await;
        info!("Enqueued {} archives", count);
        ids
    }

    /// Remove a job that is not transferring or processing.
    ///
    /// Returns `Ok(false)` if no such job exists.
    pub async fn remove(&self, job_id: &str) -> Result<bool, UploadError> {
        match self.inner.shared.remove(job_id).await? {
            Some(job) => {
                if let Some(server_job_id) = &job.server_job_id {
                    self.inner.registry.cancel(server_job_id);
                }
                debug!("Removed job {} ({})", job.id, job.display_name);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn rename(&self, job_id: &str, name: impl Into<String>) -> Result<(), UploadError> {
        let name = name.into();
        self.inner
            .shared
            .update_job(job_id, |job| job.rename(name))
            .await
    }

    pub async fn set_options(&self, job_id: &str, options: JobOptions) -> Result<(), UploadError> {
        self.inner
            .shared
            .update_job(job_id, |job| job.set_options(options))
            .await
    }

    /// Transfer every queued or failed job, one at a time, in queue order.
    ///
    /// Jobs enqueued while the pass runs are picked up when reached. A job that
    /// fails during the pass is left for a later pass or [`UploadQueue::retry`].
    /// Processing is tracked in the background and does not hold up the pass.
    /// After [`UploadQueue::shutdown`] the pass stops before the next transfer.
    pub async fn run_all(&self) -> RunOutcome {
        let Some(guard) = RunGuard::acquire(&self.inner.running) else {
            debug!("Upload pass already running, ignoring");
            return RunOutcome::AlreadyRunning;
        };
        self.inner.shared.emit(QueueEvent::RunStarted);

        let mut cursor = 0;
        let mut attempted = 0;
        while let Some((job_id, seq)) = self.inner.shared.next_pending_after(cursor).await {
            if self.inner.shutdown_token.is_cancelled() {
                info!("Upload queue shut down, leaving remaining jobs queued");
                break;
            }
            cursor = seq;
            if self.transfer_one(&job_id).await {
                attempted += 1;
            }
        }

        // Waiters check the flag when RunFinished arrives
        drop(guard);
        info!("Upload pass finished, {} transfers attempted", attempted);
        self.inner
            .shared
            .emit(QueueEvent::RunFinished { attempted });
        RunOutcome::Finished { attempted }
    }

    /// Submit one failed job again. Not allowed while a pass is running or
    /// after shutdown.
    pub async fn retry(&self, job_id: &str) -> Result<(), UploadError> {
        if self.inner.shutdown_token.is_cancelled() {
            return Err(UploadError::invalid_state(
                QueueState::Idle.as_str(),
                QueueState::Stopped.as_str(),
            ));
        }
        let Some(guard) = RunGuard::acquire(&self.inner.running) else {
            return Err(UploadError::invalid_state(
                QueueState::Idle.as_str(),
                QueueState::Running.as_str(),
            ));
        };

        let job = self
            .inner
            .shared
            .job(job_id)
            .await
            .ok_or_else(|| UploadError::JobNotFound(job_id.to_string()))?;
        if job.stage != UploadStage::Failed {
            return Err(UploadError::invalid_state(
                UploadStage::Failed.as_str(),
                job.stage.as_str(),
            ));
        }

        info!("Retrying job {} ({})", job.id, job.display_name);
        self.inner.shared.emit(QueueEvent::RunStarted);
        let attempted = usize::from(self.transfer_one(job_id).await);
        drop(guard);
        self.inner
            .shared
            .emit(QueueEvent::RunFinished { attempted });
        Ok(())
    }

    /// Stop tracking a job the server is processing and mark it failed.
    ///
    /// Returns `Ok(false)` when there was nothing to cancel.
    pub async fn cancel(&self, job_id: &str) -> Result<bool, UploadError> {
        let Some(job) = self.inner.shared.job(job_id).await else {
            return Ok(false);
        };

        match job.stage {
            UploadStage::Transferring => Err(UploadError::invalid_state(
                UploadStage::ServerProcessing.as_str(),
                job.stage.as_str(),
            )),
            UploadStage::ServerProcessing => {
                if let Some(server_job_id) = &job.server_job_id {
                    self.inner.registry.cancel(server_job_id);
                }
                match self
                    .inner
                    .shared
                    .update_job(job_id, |job| job.mark_failed(CANCELLED_MESSAGE))
                    .await
                {
                    Ok(()) => {
                        info!("Cancelled processing of job {}", job_id);
                        Ok(true)
                    }
                    // Finished or removed in the meantime
                    Err(UploadError::InvalidState { .. } | UploadError::JobNotFound(_)) => {
                        Ok(false)
                    }
                    Err(e) => Err(e),
                }
            }
            _ => Ok(false),
        }
    }

    pub async fn jobs(&self) -> Vec<UploadJob> {
        self.inner.shared.jobs().await
    }

    pub async fn job(&self, job_id: &str) -> Option<UploadJob> {
        self.inner.shared.job(job_id).await
    }

    pub async fn summary(&self) -> QueueSummary {
        self.inner.shared.summary().await
    }

    pub fn state(&self) -> QueueState {
        if self.inner.running.load(Ordering::SeqCst) {
            QueueState::Running
        } else if self.inner.shutdown_token.is_cancelled() {
            QueueState::Stopped
        } else {
            QueueState::Idle
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.shared.subscribe()
    }

    /// Wait until no pass is running and no job is transferring or processing.
    ///
    /// After shutdown, processing jobs are no longer tracked and only the
    /// running pass is waited for.
    pub async fn wait_until_settled(&self) {
        let mut events = self.subscribe();
        loop {
            let stopped = self.inner.shutdown_token.is_cancelled();
            match self.state() {
                QueueState::Running => {}
                QueueState::Stopped => return,
                QueueState::Idle => {
                    if self.summary().await.active == 0 {
                        return;
                    }
                }
            }
            tokio::select! {
                event = events.recv() => {
                    if let Err(broadcast::error::RecvError::Closed) = event {
                        return;
                    }
                }
                _ = self.inner.shutdown_token.cancelled(), if !stopped => {}
            }
        }
    }

    /// Stop every status poller and wait for them to exit. No transfer or
    /// poller starts afterwards.
    ///
    /// A transfer in flight is not interrupted; the pass running it ends once
    /// it completes, without polling the result.
    pub async fn shutdown(&self) {
        self.inner.shutdown_token.cancel();
        let handles = self.inner.registry.close();
        info!("Shutting down upload queue, stopping {} pollers", handles.len());
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Poller task ended abnormally: {}", e);
            }
        }
    }

    /// Transfer one job and start its poller on success.
    /// Returns false if the transfer could not even start.
    async fn transfer_one(&self, job_id: &str) -> bool {
        match self.inner.driver.transfer(&self.inner.shared, job_id).await {
            Ok(accepted) => {
                if !self.inner.poller.spawn(job_id, &accepted.job_id) {
                    info!(
                        "Upload queue shut down, not tracking server job {} of job {}",
                        accepted.job_id, job_id
                    );
                }
                true
            }
            // Already recorded on the job
            Err(e) if e.is_resubmittable() => true,
            Err(e) => {
                debug!("Skipping job {}: {}", job_id, e);
                false
            }
        }
    }
}

impl QueueState {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueState::Idle => "IDLE",
            QueueState::Running => "RUNNING",
            QueueState::Stopped => "STOPPED",
        }
    }
}
