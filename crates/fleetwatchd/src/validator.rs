//! Post-update validation.
//!
//! Runs once per process start. The rollback marker is the only evidence
//! that this process came up after a self-initiated update; the validator
//! consumes it, decides how the update went and, on failure, records the
//! version in the failed-version ledger so the next check does not offer it
//! again straight away.

use crate::error::MarkerError;
use crate::exclusion::FailedVersionLedger;
use crate::health::HealthProbe;
use crate::marker::{MarkerStore, RollbackMarker};
use chrono::Utc;
use fleetwatch_common::same_version;
use std::sync::Arc;
use tracing::{info, warn};

/// Version reported when a marker was present but unreadable.
pub const UNKNOWN_VERSION: &str = "unknown";

/// What was found on disk at start-up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingValidation {
    Marker(RollbackMarker),
    /// A marker file existed but could not be parsed.
    Corrupt(String),
}

impl PendingValidation {
    pub fn previous_version(&self) -> &str {
        match self {
            PendingValidation::Marker(m) => &m.previous_version,
            PendingValidation::Corrupt(_) => UNKNOWN_VERSION,
        }
    }

    pub fn expected_version(&self) -> &str {
        match self {
            PendingValidation::Marker(m) => &m.expected_new_version,
            PendingValidation::Corrupt(_) => UNKNOWN_VERSION,
        }
    }
}

/// Outcome of [`PostUpdateValidator::conclude`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostUpdateValidation {
    /// No marker: this start was not preceded by an update.
    NotUpdated,
    Succeeded {
        from: String,
        to: String,
    },
    /// The service manager brought the previous binary back.
    RolledBack {
        from: String,
        expected: String,
        running: String,
    },
    Failed {
        from: String,
        expected: String,
        reason: String,
    },
}

impl PostUpdateValidation {
    pub fn was_updated(&self) -> bool {
        !matches!(self, PostUpdateValidation::NotUpdated)
    }

    pub fn from_version(&self) -> Option<&str> {
        match self {
            PostUpdateValidation::NotUpdated => None,
            PostUpdateValidation::Succeeded { from, .. }
            | PostUpdateValidation::RolledBack { from, .. }
            | PostUpdateValidation::Failed { from, .. } => Some(from),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, PostUpdateValidation::Succeeded { .. })
    }
}

pub struct PostUpdateValidator {
    current_version: String,
    markers: MarkerStore,
    ledger: Arc<FailedVersionLedger>,
    health: Arc<dyn HealthProbe>,
}

impl PostUpdateValidator {
    pub fn new(
        current_version: &str,
        markers: MarkerStore,
        ledger: Arc<FailedVersionLedger>,
        health: Arc<dyn HealthProbe>,
    ) -> Self {
        Self {
            current_version: current_version.to_string(),
            markers,
            ledger,
            health,
        }
    }

    /// Look for a marker without consuming it.
    pub fn pending(&self) -> Result<Option<PendingValidation>, MarkerError> {
        match self.markers.read() {
            Ok(Some(marker)) => Ok(Some(PendingValidation::Marker(marker))),
            Ok(None) => Ok(None),
            Err(MarkerError::Corrupt(reason)) => Ok(Some(PendingValidation::Corrupt(reason))),
            Err(e) => Err(e),
        }
    }

    /// Judge the pending update, record failures and clear the marker.
    pub async fn conclude(&self, pending: PendingValidation) -> PostUpdateValidation {
        let result = match pending {
            PendingValidation::Corrupt(reason) => PostUpdateValidation::Failed {
                from: UNKNOWN_VERSION.to_string(),
                expected: UNKNOWN_VERSION.to_string(),
                reason: format!("rollback marker unreadable: {}", reason),
            },
            PendingValidation::Marker(marker) => self.judge(&marker).await,
        };

        match &result {
            PostUpdateValidation::RolledBack { expected, .. } => {
                self.ledger
                    .record(expected, "rolled back after restart", Utc::now());
            }
            PostUpdateValidation::Failed {
                expected, reason, ..
            } if expected != UNKNOWN_VERSION => {
                self.ledger.record(expected, reason, Utc::now());
            }
            _ => {}
        }

        // The ledger entry is written first: a crash here re-validates on
        // the next start instead of forgetting the failure.
        if let Err(e) = self.markers.clear() {
            warn!("Failed to clear rollback marker: {}", e);
        }
        result
    }

    async fn judge(&self, marker: &RollbackMarker) -> PostUpdateValidation {
        let running = self.current_version.as_str();
        let from = marker.previous_version.clone();
        let expected = marker.expected_new_version.clone();

        if same_version(running, &expected) {
            return match self.health.check().await {
                Ok(()) => {
                    info!("Update from {} to {} validated", from, expected);
                    PostUpdateValidation::Succeeded { from, to: expected }
                }
                Err(reason) => {
                    warn!("Update to {} is running but unhealthy: {}", expected, reason);
                    PostUpdateValidation::Failed {
                        from,
                        expected,
                        reason: format!("health check failed: {}", reason),
                    }
                }
            };
        }

        if same_version(running, &from) {
            warn!(
                "Expected {} after update but {} is running, update was rolled back",
                expected, running
            );
            return PostUpdateValidation::RolledBack {
                from,
                expected,
                running: running.to_string(),
            };
        }

        warn!(
            "Expected {} after update but {} is running",
            expected, running
        );
        PostUpdateValidation::Failed {
            reason: format!("version mismatch: expected {}, running {}", expected, running),
            from,
            expected,
        }
    }
}
