//! Update state machine states and the progress event schema.

use serde::{Deserialize, Serialize};
use std::fmt;

/// `progress` value meaning "no percentage applies".
pub const PROGRESS_UNKNOWN: i32 = -1;

/// State of the update state machine, as reported on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateStatus {
    Idle,
    Checking,
    UpToDate,
    Available,
    Downloading,
    Verifying,
    Installing,
    AwaitingRestart,
    Validating,
    Succeeded,
    Failed,
    RolledBack,
    Cancelled,
}

impl UpdateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateStatus::Idle => "idle",
            UpdateStatus::Checking => "checking",
            UpdateStatus::UpToDate => "up_to_date",
            UpdateStatus::Available => "available",
            UpdateStatus::Downloading => "downloading",
            UpdateStatus::Verifying => "verifying",
            UpdateStatus::Installing => "installing",
            UpdateStatus::AwaitingRestart => "awaiting_restart",
            UpdateStatus::Validating => "validating",
            UpdateStatus::Succeeded => "succeeded",
            UpdateStatus::Failed => "failed",
            UpdateStatus::RolledBack => "rolled_back",
            UpdateStatus::Cancelled => "cancelled",
        }
    }

    /// Phases in which abort leaves nothing half-applied.
    pub fn is_cancellable(&self) -> bool {
        matches!(
            self,
            UpdateStatus::Checking | UpdateStatus::Downloading | UpdateStatus::Verifying
        )
    }

    /// Last state a session reports before returning to idle.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UpdateStatus::UpToDate
                | UpdateStatus::Succeeded
                | UpdateStatus::Failed
                | UpdateStatus::RolledBack
                | UpdateStatus::Cancelled
        )
    }
}

impl fmt::Display for UpdateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One state transition, as seen by observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub status: UpdateStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_version: Option<String>,
    /// 0-100, or [`PROGRESS_UNKNOWN`].
    pub progress: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProgressEvent {
    pub fn new(status: UpdateStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            target_version: None,
            progress: PROGRESS_UNKNOWN,
            message: message.into(),
            error: None,
        }
    }

    /// Terminal failure: progress is always reset to unknown.
    pub fn failure(
        status: UpdateStatus,
        message: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        let message = message.into();
        let mut error = error.into();
        if error.is_empty() {
            error = message.clone();
        }
        Self {
            status,
            target_version: None,
            progress: PROGRESS_UNKNOWN,
            message,
            error: Some(error),
        }
    }

    pub fn with_target(mut self, target: Option<impl Into<String>>) -> Self {
        self.target_version = target.map(Into::into);
        self
    }

    pub fn with_progress(mut self, progress: i32) -> Self {
        self.progress = progress.clamp(PROGRESS_UNKNOWN, 100);
        self
    }

    pub fn is_failure(&self) -> bool {
        self.error.is_some()
    }
}
