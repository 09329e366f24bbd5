//! Error types for saorsa-warden.

use thiserror::Error;

/// Result type used throughout the warden.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while supervising or updating the managed binary.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration is missing or invalid
    #[error("Configuration error: {0}")]
    Config(String),

    /// A release source could not be queried or its response not decoded
    #[error("Version discovery failed: {0}")]
    Discovery(String),

    /// A single download source failed (bad status, empty body, transport)
    #[error("Download failed: {0}")]
    Download(String),

    /// Every ranked download source was tried and none produced an artifact
    #[error("All {attempts} download source(s) failed, last error: {last}")]
    DownloadExhausted {
        /// Number of sources actually attempted (skipped sources not counted)
        attempts: usize,
        /// Error from the last source tried
        last: String,
    },

    /// Downloaded artifact did not match its declared SHA-256 checksum
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Checksum declared by the release source
        expected: String,
        /// Checksum computed over the downloaded bytes
        actual: String,
    },

    /// Replacing the live executable with the staged one failed
    #[error("Executable swap failed: {0}")]
    Swap(String),

    /// A failed swap could not be rolled back; the live executable may be gone
    #[error("Swap rollback failed, live executable may be unusable: {0}")]
    RollbackFailed(String),

    /// The managed executable could not be launched
    #[error("Failed to launch managed executable: {0}")]
    Launch(String),

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Filesystem error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error must abort the whole warden rather than be
    /// retried on the next check cycle.
    ///
    /// Only a failed rollback qualifies: after it the on-disk executable
    /// is in an unknown state and restarting the managed process would be
    /// unsafe. Launch failures are fatal only on cold start, which the
    /// supervisor decides from its own history.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::RollbackFailed(_))
    }
}
