//! Batch upload queue.
//!
//! Client-side orchestration for ingesting archives into the catalog:
//! 1. Operator enqueues one or more archives (each holding many tracks)
//! 2. Archives are transferred to the upload endpoint one at a time, in order
//! 3. Each accepted archive gets a server job id and a status poller
//! 4. Pollers track server-side extraction until completion, failure or timeout

mod client;
mod error;
mod models;
mod poller;
mod queue;
mod transfer;

pub use client::{
    HttpIngestionClient, IngestionApi, JobStatusReport, ServerJobState, TransferProgress,
    UploadAccepted, UploadRequest,
};
pub use error::{TransferError, UploadError};
pub use models::{ArchiveSource, JobOptions, QueueSummary, UploadJob, UploadStage};
pub use poller::PollerConfig;
pub use queue::{QueueEvent, QueueState, RunOutcome, UploadQueue, UploadQueueSettings};
pub use transfer::percent_of;

#[cfg(test)]
pub(crate) mod testing;
