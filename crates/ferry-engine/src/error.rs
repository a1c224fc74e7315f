//! Error types for the engine crate.

use thiserror::Error;

/// Errors that can occur while talking to the copy engine or a cluster
/// filesystem.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    /// The copy engine could not be reached.
    #[error("Copy engine unavailable: {0}")]
    Unavailable(String),

    /// The engine refused or failed to accept a copy job.
    #[error("Copy job submission failed: {0}")]
    SubmissionFailed(String),

    /// No copy job with this identifier is known to the engine.
    #[error("Copy job not found: {0}")]
    JobNotFound(String),

    /// Copy options are not usable.
    #[error("Invalid copy options: {0}")]
    InvalidOptions(String),

    /// A path or URI could not be interpreted.
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// No filesystem is registered for the URI.
    #[error("Filesystem unavailable: {0}")]
    FilesystemUnavailable(String),

    /// Filesystem operation failed.
    #[error("Filesystem error: {0}")]
    Filesystem(String),

    /// Snapshot operation failed.
    #[error("Snapshot error: {0}")]
    Snapshot(String),

    /// Timeout waiting for a copy job.
    #[error("Timeout waiting for copy job {0}")]
    Timeout(String),

    /// Internal engine error.
    #[error("Engine error: {0}")]
    Internal(String),
}

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EngineError::JobNotFound("job_1700000000000_0001".to_string());
        assert_eq!(err.to_string(), "Copy job not found: job_1700000000000_0001");

        let err = EngineError::InvalidPath("filePath cannot be empty".to_string());
        assert_eq!(err.to_string(), "Invalid path: filePath cannot be empty");
    }
}
