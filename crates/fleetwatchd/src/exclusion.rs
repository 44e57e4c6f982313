//! Failed-version ledger.
//!
//! Versions that failed post-update validation are excluded from automatic
//! checks for a cool-down period so a bad build cannot put an agent into a
//! crash-update-crash loop.

use chrono::{DateTime, Duration, Utc};
use fleetwatch_common::fs_utils::atomic_write;
use fleetwatch_common::same_version;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, warn};

pub const LEDGER_FILE: &str = "failed_versions.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedVersion {
    pub version: String,
    pub failed_at: DateTime<Utc>,
    pub reason: String,
}

impl FailedVersion {
    fn expires_at(&self, cooldown: Duration) -> DateTime<Utc> {
        self.failed_at + cooldown
    }
}

/// Persisted list of recently failed versions.
pub struct FailedVersionLedger {
    path: PathBuf,
    cooldown: Duration,
    entries: Mutex<Vec<FailedVersion>>,
}

impl FailedVersionLedger {
    /// Load the ledger, starting empty if the file is missing or unreadable.
    pub fn open(autoupdate_dir: &Path, cooldown: Duration) -> Self {
        let path = autoupdate_dir.join(LEDGER_FILE);
        let entries = match fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!("Ignoring unreadable failed-version ledger: {}", e);
                Vec::new()
            }),
            Err(_) => Vec::new(),
        };
        Self {
            path,
            cooldown,
            entries: Mutex::new(entries),
        }
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Record `version` as failed at `now`, dropping expired entries.
    pub fn record(&self, version: &str, reason: &str, now: DateTime<Utc>) {
        let snapshot = {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            entries.retain(|e| e.expires_at(self.cooldown) > now && !same_version(&e.version, version));
            entries.push(FailedVersion {
                version: version.to_string(),
                failed_at: now,
                reason: reason.to_string(),
            });
            entries.clone()
        };

        info!(
            "Excluding {} from automatic updates until {}",
            version,
            now + self.cooldown
        );
        self.persist(&snapshot);
    }

    /// The exclusion entry for `version`, if it is still cooling down.
    pub fn excluded(&self, version: &str, now: DateTime<Utc>) -> Option<FailedVersion> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .iter()
            .find(|e| same_version(&e.version, version) && e.expires_at(self.cooldown) > now)
            .cloned()
    }

    /// Entries still inside the cool-down window at `now`.
    pub fn active(&self, now: DateTime<Utc>) -> Vec<FailedVersion> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .iter()
            .filter(|e| e.expires_at(self.cooldown) > now)
            .cloned()
            .collect()
    }

    pub fn entries(&self) -> Vec<FailedVersion> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn persist(&self, entries: &[FailedVersion]) {
        let result = serde_json::to_vec_pretty(entries)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
            .and_then(|content| atomic_write(&self.path, &content));
        if let Err(e) = result {
            warn!("Failed to persist failed-version ledger: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_exclusion_expires() {
        let temp = TempDir::new().unwrap();
        let ledger = FailedVersionLedger::open(temp.path(), Duration::hours(72));
        let now = Utc::now();

        ledger.record("1.3.0", "version mismatch", now);

        assert!(ledger.excluded("1.3.0", now + Duration::hours(1)).is_some());
        assert!(ledger.excluded("v1.3.0", now + Duration::hours(1)).is_some());
        assert!(ledger.excluded("1.3.1", now).is_none());
        assert!(ledger.excluded("1.3.0", now + Duration::hours(73)).is_none());
        assert_eq!(ledger.active(now).len(), 1);
        assert!(ledger.active(now + Duration::hours(73)).is_empty());
    }

    #[test]
    fn test_ledger_persists() {
        let temp = TempDir::new().unwrap();
        let now = Utc::now();
        {
            let ledger = FailedVersionLedger::open(temp.path(), Duration::hours(72));
            ledger.record("1.3.0", "health check failed", now);
            ledger.record("1.3.0", "health check failed again", now);
        }

        let reopened = FailedVersionLedger::open(temp.path(), Duration::hours(72));
        let entries = reopened.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].reason, "health check failed again");
        assert!(reopened.excluded("1.3.0", now).is_some());
    }

    #[test]
    fn test_corrupt_ledger_starts_empty() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join(LEDGER_FILE), b"[[[").unwrap();

        let ledger = FailedVersionLedger::open(temp.path(), Duration::hours(1));
        assert!(ledger.entries().is_empty());
    }
}
