//! Version source contract.
//!
//! The manager only ever talks to a [`VersionSource`]; the fleet server client
//! is one implementation, test fakes are others.

use crate::error::SourceError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

/// What the agent asks for when checking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionQuery {
    pub agent_id: String,
    pub channel: String,
    pub platform: String,
    pub arch: String,
}

/// A published build, as described by the server manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: String,
    #[serde(default)]
    pub channel: String,
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub arch: String,
    /// Hex-encoded SHA-256 of the artifact.
    #[serde(default)]
    pub sha256: String,
    #[serde(default)]
    pub size_bytes: u64,
    #[serde(default)]
    pub download_url: String,
    #[serde(default)]
    pub published_at: Option<DateTime<Utc>>,
}

/// A downloaded artifact on local disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub version: String,
    pub path: PathBuf,
    pub sha256: String,
    pub size_bytes: u64,
}

/// Download progress callback: `(bytes_done, bytes_total)`; total is 0 when
/// unknown.
pub type ProgressFn<'a> = &'a (dyn Fn(u64, u64) + Send + Sync);

#[async_trait]
pub trait VersionSource: Send + Sync {
    /// Latest published build for the query, `None` when nothing is published.
    async fn check_latest(&self, query: &VersionQuery) -> Result<Option<VersionInfo>, SourceError>;

    /// Fetch the artifact. Must return [`SourceError::Cancelled`] promptly once
    /// `cancel` fires.
    async fn download(
        &self,
        info: &VersionInfo,
        progress: ProgressFn<'_>,
        cancel: &CancellationToken,
    ) -> Result<Artifact, SourceError>;

    /// Check the artifact against the published digest.
    async fn verify(&self, artifact: &Artifact) -> Result<(), SourceError>;
}

/// Stand-in used when no fleet server is configured. Every check fails
/// with a network error, so explicit commands still end in a `Failed` event.
pub struct UnconfiguredSource;

#[async_trait]
impl VersionSource for UnconfiguredSource {
    async fn check_latest(&self, _query: &VersionQuery) -> Result<Option<VersionInfo>, SourceError> {
        Err(SourceError::Network("no fleet server configured".to_string()))
    }

    async fn download(
        &self,
        _info: &VersionInfo,
        _progress: ProgressFn<'_>,
        _cancel: &CancellationToken,
    ) -> Result<Artifact, SourceError> {
        Err(SourceError::Network("no fleet server configured".to_string()))
    }

    async fn verify(&self, _artifact: &Artifact) -> Result<(), SourceError> {
        Err(SourceError::InvalidManifest("no fleet server configured".to_string()))
    }
}

/// Percentage for a `(done, total)` pair, clamped to 0-100.
pub fn percent(done: u64, total: u64) -> i32 {
    if total == 0 {
        return 0;
    }
    ((done.min(total) as u128 * 100) / total as u128) as i32
}
