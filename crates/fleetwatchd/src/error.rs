//! Error types for the update daemon.

use fleetwatch_common::ProtocolError;
use thiserror::Error;

/// Failures talking to the version source or handling its artifacts.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("network error: {0}")]
    Network(String),

    #[error("server returned {status}: {message}")]
    Server { status: u16, message: String },

    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("download cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for SourceError {
    fn from(e: reqwest::Error) -> Self {
        SourceError::Network(e.to_string())
    }
}

impl SourceError {
    /// Verification failures must never proceed to install.
    pub fn is_verification(&self) -> bool {
        matches!(
            self,
            SourceError::HashMismatch { .. } | SourceError::SizeMismatch { .. }
        )
    }
}

/// Failures replacing the running binary.
#[derive(Error, Debug)]
pub enum InstallError {
    #[error("artifact missing: {0}")]
    MissingArtifact(String),

    #[error("binary path unknown: {0}")]
    BinaryPath(String),

    #[error("install failed: {0}")]
    Failed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures reading or writing the rollback marker.
#[derive(Error, Debug)]
pub enum MarkerError {
    #[error("rollback marker is corrupt: {0}")]
    Corrupt(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Best-effort delivery failures (telemetry, remote progress).
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("sink closed")]
    Closed,

    #[error("delivery failed: {0}")]
    Delivery(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl From<reqwest::Error> for SinkError {
    fn from(e: reqwest::Error) -> Self {
        SinkError::Delivery(e.to_string())
    }
}

/// Errors surfaced by `UpdateManager` operations.
#[derive(Error, Debug)]
pub enum UpdateError {
    /// A session is already live; nothing was started.
    #[error("update already in progress ({0})")]
    Busy(String),

    #[error("auto-update disabled")]
    Disabled,

    #[error("update cancelled")]
    Cancelled,

    #[error("version check failed: {0}")]
    Network(String),

    #[error("download failed: {0}")]
    Download(String),

    #[error("verification failed: {0}")]
    Verification(String),

    #[error("install failed: {0}")]
    Install(#[from] InstallError),

    #[error(transparent)]
    Marker(#[from] MarkerError),

    #[error("insufficient disk space: need {required} MB, have {available} MB")]
    DiskSpace { required: u64, available: u64 },
}

impl UpdateError {
    pub fn is_busy(&self) -> bool {
        matches!(self, UpdateError::Busy(_))
    }

    /// Error code reported to telemetry.
    pub fn code(&self) -> &'static str {
        match self {
            UpdateError::Busy(_) => "BUSY",
            UpdateError::Disabled => "POLICY_DISABLED",
            UpdateError::Cancelled => "CANCELLED",
            UpdateError::Network(_) => "SERVER_ERROR",
            UpdateError::Download(_) => "DOWNLOAD_FAILED",
            UpdateError::Verification(_) => "HASH_MISMATCH",
            UpdateError::Install(_) => "APPLY_FAILED",
            UpdateError::Marker(_) => "APPLY_FAILED",
            UpdateError::DiskSpace { .. } => "DISK_SPACE",
        }
    }
}

impl UpdateError {
    /// Map a source failure that happened while fetching the artifact.
    pub fn from_download(e: SourceError) -> Self {
        match e {
            SourceError::Cancelled => UpdateError::Cancelled,
            e if e.is_verification() => UpdateError::Verification(e.to_string()),
            e => UpdateError::Download(e.to_string()),
        }
    }
}

impl From<SourceError> for UpdateError {
    fn from(e: SourceError) -> Self {
        match e {
            SourceError::Cancelled => UpdateError::Cancelled,
            e if e.is_verification() => UpdateError::Verification(e.to_string()),
            e => UpdateError::Network(e.to_string()),
        }
    }
}
