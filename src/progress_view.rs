//! Terminal rendering of the upload queue.
//!
//! The view keeps its own snapshots of the jobs, fed by queue events, so it can
//! be attached, minimized or dropped at any time without affecting the uploads.

use std::collections::HashMap;

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::upload_queue::{QueueEvent, QueueSummary, UploadJob, UploadQueue, UploadStage};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ViewMode {
    /// One bar per job plus the summary bar.
    #[default]
    Detailed,
    /// Summary bar only.
    Minimized,
}

pub struct ProgressView {
    multi: MultiProgress,
    mode: ViewMode,
    summary_bar: ProgressBar,
    job_bars: HashMap<String, ProgressBar>,
    jobs: Vec<UploadJob>,
    running: bool,
}

impl ProgressView {
    pub fn new(mode: ViewMode) -> Self {
        Self::with_draw_target(mode, ProgressDrawTarget::stderr())
    }

    /// A view that tracks state but draws nothing.
    pub fn hidden(mode: ViewMode) -> Self {
        Self::with_draw_target(mode, ProgressDrawTarget::hidden())
    }

    fn with_draw_target(mode: ViewMode, target: ProgressDrawTarget) -> Self {
        let multi = MultiProgress::with_draw_target(target);
        let summary_bar = multi.add(ProgressBar::new(100));
        summary_bar.set_style(summary_style());

        Self {
            multi,
            mode,
            summary_bar,
            job_bars: HashMap::new(),
            jobs: Vec::new(),
            running: false,
        }
    }

    pub fn mode(&self) -> ViewMode {
        self.mode
    }

    /// Switch between detailed and minimized rendering.
    pub fn set_mode(&mut self, mode: ViewMode) {
        if self.mode == mode {
            return;
        }
        self.mode = mode;
        for (_, bar) in self.job_bars.drain() {
            bar.finish_and_clear();
            self.multi.remove(&bar);
        }
        self.refresh_all();
    }

    /// Replace the local snapshots with the queue's current jobs.
    pub fn sync(&mut self, jobs: Vec<UploadJob>) {
        let stale: Vec<String> = self
            .job_bars
            .keys()
            .filter(|id| !jobs.iter().any(|j| &j.id == *id))
            .cloned()
            .collect();
        for id in stale {
            self.drop_bar(&id);
        }
        self.jobs = jobs;
        self.refresh_all();
    }

    pub fn apply(&mut self, event: &QueueEvent) {
        match event {
            QueueEvent::JobAdded(job) | QueueEvent::JobUpdated(job) => {
                match self.jobs.iter_mut().find(|j| j.id == job.id) {
                    Some(existing) => *existing = job.clone(),
                    None => self.jobs.push(job.clone()),
                }
                self.refresh_job(&job.id);
            }
            QueueEvent::JobRemoved(id) => {
                self.jobs.retain(|j| &j.id != id);
                self.drop_bar(id);
            }
            QueueEvent::RunStarted => self.running = true,
            QueueEvent::RunFinished { .. } => self.running = false,
        }
        self.refresh_summary();
    }

    pub fn summary(&self) -> QueueSummary {
        QueueSummary::from_jobs(&self.jobs)
    }

    /// Leave the final state on screen.
    pub fn finish(&self) {
        for bar in self.job_bars.values() {
            bar.finish();
        }
        self.summary_bar.finish();
    }

    fn refresh_all(&mut self) {
        let ids: Vec<String> = self.jobs.iter().map(|j| j.id.clone()).collect();
        for id in ids {
            self.refresh_job(&id);
        }
        self.refresh_summary();
    }

    fn refresh_job(&mut self, job_id: &str) {
        if self.mode == ViewMode::Minimized {
            return;
        }
        let Some(job) = self.jobs.iter().find(|j| j.id == job_id) else {
            return;
        };

        let bar = self
            .job_bars
            .entry(job.id.clone())
            .or_insert_with(|| {
                let bar = self.multi.add(ProgressBar::new(100));
                bar.set_style(job_style());
                bar
            });
        bar.set_position(u64::from(job.progress_percent()));
        bar.set_message(job_line(job));
    }

    fn refresh_summary(&self) {
        let summary = self.summary();
        self.summary_bar
            .set_position(u64::from(summary.overall_percent));
        self.summary_bar
            .set_message(summary_line(&summary, self.running));
    }

    fn drop_bar(&mut self, job_id: &str) {
        if let Some(bar) = self.job_bars.remove(job_id) {
            bar.finish_and_clear();
            self.multi.remove(&bar);
        }
    }
}

fn job_style() -> ProgressStyle {
    ProgressStyle::with_template("{bar:30.cyan/blue} {pos:>3}% {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ")
}

fn summary_style() -> ProgressStyle {
    ProgressStyle::with_template("{bar:30.green/white} {pos:>3}% {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#- ")
}

/// One-line description of a job for its progress bar.
pub fn job_line(job: &UploadJob) -> String {
    let status = match job.stage {
        UploadStage::Queued => "queued".to_string(),
        UploadStage::Transferring => format!("uploading {}%", job.transfer_progress),
        UploadStage::ServerProcessing => match job.units_total {
            Some(total) if total > 0 => {
                format!("processing {}/{} tracks", job.units_processed, total)
            }
            _ => format!("processing {}%", job.server_progress),
        },
        UploadStage::Completed => match job.units_total {
            Some(total) => format!("done, {} tracks", total),
            None => "done".to_string(),
        },
        UploadStage::Failed => format!(
            "failed: {}",
            job.error_message.as_deref().unwrap_or("unknown error")
        ),
    };
    format!("{}  {}", job.display_name, status)
}

pub fn summary_line(summary: &QueueSummary, running: bool) -> String {
    let mut line = format!(
        "{}/{} archives finished ({} completed, {} failed)",
        summary.completed + summary.failed,
        summary.total,
        summary.completed,
        summary.failed
    );
    if summary.active > 0 {
        line.push_str(&format!(", {} in progress", summary.active));
    }
    if running {
        line.push_str(", uploading");
    }
    line
}

/// Render `queue` until `stop` is cancelled.
pub fn spawn(queue: UploadQueue, mode: ViewMode, stop: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut view = ProgressView::new(mode);
        // Subscribe before taking the snapshot so no change is missed
        let mut events = queue.subscribe();
        view.sync(queue.jobs().await);

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                event = events.recv() => match event {
                    Ok(event) => view.apply(&event),
                    Err(RecvError::Lagged(skipped)) => {
                        debug!("Progress view lagged by {} events, resyncing", skipped);
                        view.sync(queue.jobs().await);
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }

        view.sync(queue.jobs().await);
        view.finish();
    })
}
