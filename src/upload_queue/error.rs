use thiserror::Error;

/// Message recorded on a job whose server-side processing never finished.
pub const PROCESSING_TIMEOUT_MESSAGE: &str = "Processing timed out";

/// Fallback message when the server reports a failure without a reason.
pub const PROCESSING_FAILED_MESSAGE: &str = "Processing failed";

/// Errors that can occur while uploading an archive to the upload endpoint.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransferError {
    #[error("Upload request failed: {0}")]
    Transport(String),

    /// The server refused the upload. `message` is shown to the operator as-is.
    #[error("{message}")]
    Rejected { status: u16, message: String },

    #[error("Malformed upload response: {0}")]
    MalformedResponse(String),

    #[error("Failed to read archive: {0}")]
    Io(String),
}

impl From<reqwest::Error> for TransferError {
    fn from(err: reqwest::Error) -> Self {
        TransferError::Transport(err.to_string())
    }
}

impl From<std::io::Error> for TransferError {
    fn from(err: std::io::Error) -> Self {
        TransferError::Io(err.to_string())
    }
}

/// Errors surfaced by upload jobs and the upload queue.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UploadError {
    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error("{0}")]
    Processing(String),

    #[error("{}", PROCESSING_TIMEOUT_MESSAGE)]
    ProcessingTimeout,

    #[error("Invalid job state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    #[error("Job not found: {0}")]
    JobNotFound(String),
}

impl UploadError {
    pub(crate) fn invalid_state(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        UploadError::InvalidState {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Returns true if the operator can recover by submitting the job again.
    pub fn is_resubmittable(&self) -> bool {
        matches!(
            self,
            UploadError::Transfer(_) | UploadError::Processing(_) | UploadError::ProcessingTimeout
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejected_transfer_shows_server_message_verbatim() {
        let err = TransferError::Rejected {
            status: 500,
            message: "Archive is corrupted".to_string(),
        };
        assert_eq!(err.to_string(), "Archive is corrupted");

        let wrapped: UploadError = err.into();
        assert_eq!(wrapped.to_string(), "Archive is corrupted");
    }

    #[test]
    fn test_timeout_message() {
        assert_eq!(
            UploadError::ProcessingTimeout.to_string(),
            PROCESSING_TIMEOUT_MESSAGE
        );
    }

    #[test]
    fn test_invalid_state_is_not_resubmittable() {
        let err = UploadError::invalid_state("QUEUED", "TRANSFERRING");
        assert!(!err.is_resubmittable());
        assert_eq!(
            err.to_string(),
            "Invalid job state: expected QUEUED, got TRANSFERRING"
        );
        assert!(UploadError::ProcessingTimeout.is_resubmittable());
        assert!(UploadError::Processing("bad tags".to_string()).is_resubmittable());
    }
}
