//! Common test infrastructure
//!
//! Integration tests talk to a scripted ingestion server spawned on a random
//! port. Tests should only import from this module.

mod server;

pub use server::{MockIngestionServer, RecordedUpload, Reply};

use std::time::Duration;

/// Upper bound for anything a test waits on.
#[allow(dead_code)]
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);
