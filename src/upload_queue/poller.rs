//! Status poller for archives the server is processing.
//!
//! Once an archive is accepted the server extracts and analyzes it with no
//! completion signal other than the job status endpoint. A poller queries that
//! endpoint on a fixed interval until the job completes, fails, or the tick
//! budget runs out.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::anyhow;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::client::{IngestionApi, JobStatusReport, ServerJobState};
use super::error::{UploadError, PROCESSING_FAILED_MESSAGE};
use super::queue::QueueShared;

/// Polling cadence and timeout for server-side processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollerConfig {
    /// Time between two status requests.
    pub interval: Duration,
    /// Number of ticks after which a job still processing is failed.
    pub max_ticks: u32,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            max_ticks: 1800, // one hour at the default interval
        }
    }
}

/// Shortest accepted poll interval; smaller values are raised to it.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

struct ActivePoller {
    generation: u64,
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct RegistryState {
    active: HashMap<String, ActivePoller>,
    /// Set by [`PollerRegistry::close`]; no poller may start afterwards.
    closed: bool,
}

/// Owns the cancellation tokens and task handles of running pollers, keyed by
/// server job id. At most one poller is registered per server job id.
#[derive(Default)]
pub struct PollerRegistry {
    state: Mutex<RegistryState>,
    next_generation: AtomicU64,
}

impl PollerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a poller, cancelling any previous one for the same server job.
    /// Returns `None` once the registry is closed.
    fn register(&self, server_job_id: &str, token: CancellationToken) -> Option<u64> {
        let mut state = self.lock();
        if state.closed {
            return None;
        }
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let previous = state.active.insert(
            server_job_id.to_string(),
            ActivePoller {
                generation,
                token,
                handle: None,
            },
        );
        if let Some(previous) = previous {
            debug!("Replacing poller for server job {}", server_job_id);
            previous.token.cancel();
        }
        Some(generation)
    }

    fn attach(&self, server_job_id: &str, generation: u64, handle: JoinHandle<()>) {
        if let Some(entry) = self.lock().active.get_mut(server_job_id) {
            if entry.generation == generation {
                entry.handle = Some(handle);
            }
        }
    }

    /// Forget a poller that stopped on its own. Newer pollers are left alone.
    fn release(&self, server_job_id: &str, generation: u64) {
        let mut state = self.lock();
        if state
            .active
            .get(server_job_id)
            .is_some_and(|e| e.generation == generation)
        {
            state.active.remove(server_job_id);
        }
    }

    /// Stop the poller for a server job. Returns false if none was running.
    pub fn cancel(&self, server_job_id: &str) -> bool {
        match self.lock().active.remove(server_job_id) {
            Some(entry) => {
                entry.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Stop every poller, refuse new ones, and hand back the task handles.
    pub fn close(&self) -> Vec<JoinHandle<()>> {
        let mut state = self.lock();
        state.closed = true;
        state
            .active
            .drain()
            .filter_map(|(_, entry)| {
                entry.token.cancel();
                entry.handle
            })
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn is_active(&self, server_job_id: &str) -> bool {
        self.lock().active.contains_key(server_job_id)
    }

    pub fn active_count(&self) -> usize {
        self.lock().active.len()
    }
}

/// Spawns poll tasks that report into the queue's shared state.
pub(crate) struct StatusPoller {
    api: Arc<dyn IngestionApi>,
    shared: Arc<QueueShared>,
    registry: Arc<PollerRegistry>,
    config: PollerConfig,
}

impl StatusPoller {
    pub(crate) fn new(
        api: Arc<dyn IngestionApi>,
        shared: Arc<QueueShared>,
        registry: Arc<PollerRegistry>,
        config: PollerConfig,
    ) -> Self {
        if config.interval < MIN_POLL_INTERVAL {
            warn!(
                "Poll interval {:?} is below {:?}, using {:?}",
                config.interval, MIN_POLL_INTERVAL, MIN_POLL_INTERVAL
            );
        }
        let config = PollerConfig {
            interval: config.interval.max(MIN_POLL_INTERVAL),
            ..config
        };
        Self {
            api,
            shared,
            registry,
            config,
        }
    }

    /// Start polling `server_job_id` on behalf of the local job `job_id`.
    ///
    /// Returns false, starting nothing, once the registry has been closed.
    pub(crate) fn spawn(&self, job_id: &str, server_job_id: &str) -> bool {
        let token = CancellationToken::new();
        let Some(generation) = self.registry.register(server_job_id, token.clone()) else {
            debug!(
                "Poller registry closed, not polling server job {}",
                server_job_id
            );
            return false;
        };

        let task = PollTask {
            api: Arc::clone(&self.api),
            shared: Arc::clone(&self.shared),
            config: self.config,
            job_id: job_id.to_string(),
            server_job_id: server_job_id.to_string(),
            token,
        };
        let registry = Arc::clone(&self.registry);
        let server_job_id_owned = server_job_id.to_string();

        let handle = tokio::spawn(async move {
            task.run().await;
            registry.release(&server_job_id_owned, generation);
        });
        self.registry.attach(server_job_id, generation, handle);
        true
    }
}

enum PollStep {
    Continue,
    Stop,
}

struct PollTask {
    api: Arc<dyn IngestionApi>,
    shared: Arc<QueueShared>,
    config: PollerConfig,
    job_id: String,
    server_job_id: String,
    token: CancellationToken,
}

impl PollTask {
    async fn run(self) {
        debug!(
            "Polling server job {} every {:?} (max {} ticks)",
            self.server_job_id, self.config.interval, self.config.max_ticks
        );

        let mut ticker = tokio::time::interval(self.config.interval);
        // Ticks stay on the wall-clock grid even when a poll runs late
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // Skip the first immediate tick, wait for the first interval
        ticker.tick().await;

        for tick in 1..=self.config.max_ticks {
            tokio::select! {
                _ = self.token.cancelled() => {
                    debug!("Poller for server job {} cancelled", self.server_job_id);
                    return;
                }
                _ = ticker.tick() => {}
            }

            // A request may not outlive its tick
            let result = tokio::select! {
                _ = self.token.cancelled() => {
                    debug!("Poller for server job {} cancelled mid-request", self.server_job_id);
                    return;
                }
                result = tokio::time::timeout(
                    self.config.interval,
                    self.api.job_status(&self.server_job_id),
                ) => result.unwrap_or_else(|_| {
                    Err(anyhow!("no response within {:?}", self.config.interval))
                }),
            };

            match result {
                Ok(report) => {
                    if let PollStep::Stop = self.apply(report).await {
                        return;
                    }
                }
                Err(e) => warn!(
                    "Status poll {}/{} for server job {} failed: {:#}",
                    tick, self.config.max_ticks, self.server_job_id, e
                ),
            }
        }

        info!(
            "Server job {} still processing after {} polls, giving up",
            self.server_job_id, self.config.max_ticks
        );
        if let Err(e) = self
            .shared
            .update_job(&self.job_id, |job| {
                job.mark_failed(UploadError::ProcessingTimeout.to_string())
            })
            .await
        {
            debug!("Could not time out job {}: {}", self.job_id, e);
        }
    }

    async fn apply(&self, report: JobStatusReport) -> PollStep {
        let result = match report.state {
            ServerJobState::Processing => {
                let update = self
                    .shared
                    .update_job(&self.job_id, |job| {
                        job.apply_server_status(
                            report.progress_percent,
                            report.units_processed,
                            report.units_total,
                        )
                    })
                    .await;
                if update.is_ok() {
                    return PollStep::Continue;
                }
                update
            }
            ServerJobState::Completed => {
                info!("Server job {} completed", self.server_job_id);
                self.shared
                    .update_job(&self.job_id, |job| {
                        // A completed job processed everything, even if the report omits counts
                        let processed = if report.units_processed > 0 {
                            report.units_processed
                        } else {
                            job.units_total.unwrap_or(0)
                        };
                        job.apply_server_status(100, processed, report.units_total)?;
                        job.mark_completed()
                    })
                    .await
            }
            ServerJobState::Failed => {
                let reason = UploadError::Processing(
                    report
                        .error
                        .filter(|e| !e.trim().is_empty())
                        .unwrap_or_else(|| PROCESSING_FAILED_MESSAGE.to_string()),
                )
                .to_string();
                warn!("Server job {} failed: {}", self.server_job_id, reason);
                self.shared
                    .update_job(&self.job_id, |job| job.mark_failed(reason))
                    .await
            }
        };

        // Removed or no longer processing (e.g. cancelled): nothing left to track
        if let Err(e) = result {
            debug!(
                "Stopping poller for server job {}: {}",
                self.server_job_id, e
            );
        }
        PollStep::Stop
    }
}
