//! Record pool batch upload client library.
//!
//! This library exposes the upload queue orchestration for the CLI, for any
//! other view layer that wants to observe it, and for testing.

pub mod config;
pub mod progress_view;
pub mod upload_queue;

// Re-export commonly used types for convenience
pub use upload_queue::{
    ArchiveSource, HttpIngestionClient, IngestionApi, JobOptions, QueueEvent, QueueSummary,
    UploadError, UploadJob, UploadQueue, UploadQueueSettings, UploadStage,
};
