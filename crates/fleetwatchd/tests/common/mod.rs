//! Fakes and a wired-up manager for integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use fleetwatch_common::{AgentOverrideMode, PolicySpec, ProgressEvent, UpdateStatus, VersionPinStrategy};
use fleetwatchd::disk::{DiskSpace, DEFAULT_MIN_DISK_SPACE_MB};
use fleetwatchd::error::{InstallError, SinkError, SourceError};
use fleetwatchd::exclusion::FailedVersionLedger;
use fleetwatchd::health::HealthProbe;
use fleetwatchd::installer::{InstallOutcome, Installer};
use fleetwatchd::manager::{ManagerOptions, UpdateManager};
use fleetwatchd::marker::MarkerStore;
use fleetwatchd::policy_store::PolicyStore;
use fleetwatchd::progress::{ProgressHub, ProgressObserver};
use fleetwatchd::source::{Artifact, ProgressFn, VersionInfo, VersionQuery, VersionSource};
use fleetwatchd::telemetry::{TelemetryReport, TelemetryReporter, TelemetrySink};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

pub fn version_info(version: &str) -> VersionInfo {
    VersionInfo {
        version: version.to_string(),
        channel: "stable".to_string(),
        platform: "linux".to_string(),
        arch: "amd64".to_string(),
        sha256: "00".repeat(32),
        size_bytes: 10,
        download_url: format!("https://fleet.example/agent-{}", version),
        published_at: None,
    }
}

pub struct FakeSource {
    pub latest: Mutex<Option<VersionInfo>>,
    pub check_error: Mutex<Option<String>>,
    pub verify_fails: AtomicBool,
    /// When set, `check_latest` waits for one notification.
    pub check_gate: Mutex<Option<Arc<Notify>>>,
    /// When set, `download` only returns once cancelled.
    pub hold_download: AtomicBool,
    pub checks: AtomicUsize,
    pub downloads: AtomicUsize,
    dir: PathBuf,
}

impl FakeSource {
    pub fn new(latest: Option<&str>, dir: &Path) -> Self {
        Self {
            latest: Mutex::new(latest.map(version_info)),
            check_error: Mutex::new(None),
            verify_fails: AtomicBool::new(false),
            check_gate: Mutex::new(None),
            hold_download: AtomicBool::new(false),
            checks: AtomicUsize::new(0),
            downloads: AtomicUsize::new(0),
            dir: dir.to_path_buf(),
        }
    }

    pub fn offer(&self, version: &str) {
        *self.latest.lock().unwrap() = Some(version_info(version));
    }

    pub fn gate_checks(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.check_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn checks(&self) -> usize {
        self.checks.load(Ordering::SeqCst)
    }

    pub fn downloads(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VersionSource for FakeSource {
    async fn check_latest(&self, _query: &VersionQuery) -> Result<Option<VersionInfo>, SourceError> {
        self.checks.fetch_add(1, Ordering::SeqCst);
        let gate = self.check_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let error = self.check_error.lock().unwrap().clone();
        if let Some(message) = error {
            return Err(SourceError::Network(message));
        }
        let latest = self.latest.lock().unwrap().clone();
        Ok(latest)
    }

    async fn download(
        &self,
        info: &VersionInfo,
        progress: ProgressFn<'_>,
        cancel: &CancellationToken,
    ) -> Result<Artifact, SourceError> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        progress(0, 100);
        if self.hold_download.load(Ordering::SeqCst) {
            cancel.cancelled().await;
            return Err(SourceError::Cancelled);
        }
        progress(50, 100);
        progress(100, 100);

        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.dir.join(format!("artifact-{}", info.version));
        tokio::fs::write(&path, b"new binary").await?;
        Ok(Artifact {
            version: info.version.clone(),
            path,
            sha256: info.sha256.clone(),
            size_bytes: 10,
        })
    }

    async fn verify(&self, _artifact: &Artifact) -> Result<(), SourceError> {
        if self.verify_fails.load(Ordering::SeqCst) {
            return Err(SourceError::HashMismatch {
                expected: "aa".to_string(),
                actual: "bb".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeInstaller {
    pub installs: AtomicUsize,
    pub fail: AtomicBool,
    /// When set, `install` waits for one notification.
    pub gate: Mutex<Option<Arc<Notify>>>,
}

impl FakeInstaller {
    pub fn gate(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn installs(&self) -> usize {
        self.installs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Installer for FakeInstaller {
    async fn install(&self, _artifact: &Artifact) -> Result<InstallOutcome, InstallError> {
        self.installs.fetch_add(1, Ordering::SeqCst);
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(InstallError::Failed("read-only filesystem".to_string()));
        }
        Ok(InstallOutcome::RestartRequired)
    }
}

pub struct FixedProbe(pub Result<(), String>);

#[async_trait]
impl HealthProbe for FixedProbe {
    async fn check(&self) -> Result<(), String> {
        self.0.clone()
    }
}

/// Free space in MB; `None` makes the lookup fail.
pub struct FakeDisk {
    free_mb: Mutex<Option<u64>>,
    pub lookups: AtomicU64,
}

impl FakeDisk {
    pub fn set_free_mb(&self, free_mb: Option<u64>) {
        *self.free_mb.lock().unwrap() = free_mb;
    }
}

impl Default for FakeDisk {
    fn default() -> Self {
        Self {
            free_mb: Mutex::new(Some(10 * 1024)),
            lookups: AtomicU64::new(0),
        }
    }
}

impl DiskSpace for FakeDisk {
    fn available_bytes(&self) -> Result<u64, String> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        match *self.free_mb.lock().unwrap() {
            Some(mb) => Ok(mb * 1024 * 1024),
            None => Err("mount table unreadable".to_string()),
        }
    }
}

#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<ProgressEvent>>,
}

impl Recorder {
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn statuses(&self) -> Vec<UpdateStatus> {
        self.events().into_iter().map(|e| e.status).collect()
    }

    pub fn count(&self, status: UpdateStatus) -> usize {
        self.events().iter().filter(|e| e.status == status).count()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }
}

impl ProgressObserver for Recorder {
    fn on_progress(&self, event: &ProgressEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

#[derive(Default)]
pub struct TelemetryLog {
    reports: Mutex<Vec<TelemetryReport>>,
}

impl TelemetryLog {
    pub fn reports(&self) -> Vec<TelemetryReport> {
        self.reports.lock().unwrap().clone()
    }

    /// Wait until at least `n` reports arrived (delivery is spawned).
    pub async fn wait_for(&self, n: usize) -> Vec<TelemetryReport> {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let reports = self.reports();
                if reports.len() >= n {
                    return reports;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("timed out waiting for telemetry")
    }
}

#[async_trait]
impl TelemetrySink for TelemetryLog {
    async fn report(&self, report: &TelemetryReport) -> Result<(), SinkError> {
        self.reports.lock().unwrap().push(report.clone());
        Ok(())
    }
}

pub fn spec(strategy: VersionPinStrategy) -> PolicySpec {
    PolicySpec {
        update_check_days: 7,
        version_pin_strategy: strategy,
        ..PolicySpec::default()
    }
}

pub struct Harness {
    pub temp: TempDir,
    pub manager: Arc<UpdateManager>,
    pub policy: Arc<PolicyStore>,
    pub source: Arc<FakeSource>,
    pub installer: Arc<FakeInstaller>,
    pub disk: Arc<FakeDisk>,
    pub events: Arc<Recorder>,
    pub telemetry: Arc<TelemetryLog>,
    pub markers: MarkerStore,
    pub autoupdate_dir: PathBuf,
}

impl Harness {
    pub fn new(
        current: &str,
        mode: AgentOverrideMode,
        local: PolicySpec,
        offered: Option<&str>,
    ) -> Self {
        Self::with_probe(current, mode, local, offered, Ok(()))
    }

    pub fn with_probe(
        current: &str,
        mode: AgentOverrideMode,
        local: PolicySpec,
        offered: Option<&str>,
        probe: Result<(), String>,
    ) -> Self {
        let temp = TempDir::new().unwrap();
        let autoupdate_dir = temp.path().join("autoupdate");
        std::fs::create_dir_all(&autoupdate_dir).unwrap();

        let policy = Arc::new(PolicyStore::new(mode, local));
        let source = Arc::new(FakeSource::new(offered, &autoupdate_dir.join("downloads")));
        let installer = Arc::new(FakeInstaller::default());
        let disk = Arc::new(FakeDisk::default());
        let events = Arc::new(Recorder::default());
        let telemetry = Arc::new(TelemetryLog::default());
        let markers = MarkerStore::new(&autoupdate_dir);

        let progress = Arc::new(ProgressHub::new(64));
        progress.register(events.clone());

        let manager = Arc::new(UpdateManager::new(ManagerOptions {
            current_version: current.to_string(),
            query: VersionQuery {
                agent_id: "agent-test".to_string(),
                channel: "stable".to_string(),
                platform: "linux".to_string(),
                arch: "amd64".to_string(),
            },
            policy: policy.clone(),
            source: source.clone(),
            installer: installer.clone(),
            markers: markers.clone(),
            ledger: Arc::new(FailedVersionLedger::open(
                &autoupdate_dir,
                ChronoDuration::hours(72),
            )),
            health: Arc::new(FixedProbe(probe)),
            disk: disk.clone(),
            min_disk_space_mb: DEFAULT_MIN_DISK_SPACE_MB,
            telemetry: TelemetryReporter::new(
                "agent-test",
                Some(telemetry.clone() as Arc<dyn TelemetrySink>),
            ),
            progress,
        }));

        Self {
            temp,
            manager,
            policy,
            source,
            installer,
            disk,
            events,
            telemetry,
            markers,
            autoupdate_dir,
        }
    }

    /// Poll the manager until it reports `status`.
    pub async fn wait_for_status(&self, status: UpdateStatus) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.manager.status().status != status {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {}", status));
    }
}
