//! Rollback marker.
//!
//! Written (and fsynced) immediately before the running binary is replaced;
//! read and cleared by post-update validation on the next start. Its
//! presence is the only signal that this process came up after a
//! self-initiated update.

use crate::error::MarkerError;
use chrono::{DateTime, Utc};
use fleetwatch_common::fs_utils::{atomic_write, remove_if_exists};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub const MARKER_FILE: &str = "rollback_marker.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackMarker {
    pub previous_version: String,
    pub expected_new_version: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub run_id: Option<Uuid>,
    #[serde(default)]
    pub forced: bool,
    #[serde(default)]
    pub reason: String,
}

impl RollbackMarker {
    pub fn new(previous_version: &str, expected_new_version: &str) -> Self {
        Self {
            previous_version: previous_version.to_string(),
            expected_new_version: expected_new_version.to_string(),
            timestamp: Utc::now(),
            run_id: None,
            forced: false,
            reason: String::new(),
        }
    }
}

/// Marker file under the agent's data directory.
#[derive(Debug, Clone)]
pub struct MarkerStore {
    path: PathBuf,
}

impl MarkerStore {
    pub fn new(autoupdate_dir: &Path) -> Self {
        Self {
            path: autoupdate_dir.join(MARKER_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Durably persist the marker. Returns only once the data and the
    /// directory entry are on stable storage.
    pub fn write(&self, marker: &RollbackMarker) -> Result<(), MarkerError> {
        let content = serde_json::to_vec_pretty(marker)?;
        atomic_write(&self.path, &content)?;
        Ok(())
    }

    /// Read the marker without clearing it.
    ///
    /// An unreadable or unparseable marker is reported as
    /// [`MarkerError::Corrupt`]; a missing one as `Ok(None)`.
    pub fn read(&self) -> Result<Option<RollbackMarker>, MarkerError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(MarkerError::Io(e)),
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| MarkerError::Corrupt(e.to_string()))
    }

    pub fn clear(&self) -> Result<(), MarkerError> {
        remove_if_exists(&self.path)?;
        Ok(())
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }
}
