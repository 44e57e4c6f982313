//! Update manager: the update state machine.
//!
//! ```text
//! Idle -> Checking -> UpToDate -> Idle
//!                  -> Available -> Downloading -> Verifying -> Installing
//!                       -> AwaitingRestart -> (restart) -> Validating
//!                       -> Succeeded | Failed | RolledBack -> Idle
//! ```
//!
//! At most one session is live. Session state sits behind one lock that is
//! only held for transitions and reads; network and install work happens
//! outside it, so status queries never wait on a download. Every transition
//! publishes exactly one [`ProgressEvent`].

use crate::disk::{ensure_space, DiskSpace};
use crate::error::{SourceError, UpdateError};
use crate::exclusion::FailedVersionLedger;
use crate::health::HealthProbe;
use crate::installer::{InstallOutcome, Installer};
use crate::marker::{MarkerStore, RollbackMarker};
use crate::policy_store::PolicyProvider;
use crate::progress::ProgressHub;
use crate::restart::RestartRequest;
use crate::source::{percent, Artifact, VersionInfo, VersionQuery, VersionSource};
use crate::telemetry::{
    TelemetryReport, TelemetryReporter, CODE_HEALTH_CHECK, CODE_POLICY_DISABLED, CODE_ROLLED_BACK,
};
use crate::validator::{PostUpdateValidation, PostUpdateValidator};
use chrono::{DateTime, Utc};
use fleetwatch_common::{
    evaluate, parse_version, Eligibility, EffectivePolicy, PolicySource, ProgressEvent,
    UpdateStatus, PROGRESS_UNKNOWN,
};
use rand::Rng;
use serde::Serialize;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Retry delay when a scheduled check lands outside the maintenance window.
const WINDOW_RETRY: Duration = Duration::from_secs(15 * 60);

/// Longest single sleep of the scheduler.
const MAX_SLEEP: Duration = Duration::from_secs(365 * 24 * 60 * 60);

// Overall session progress per phase. Download progress is scaled into
// the DOWNLOAD_START..DOWNLOAD_END band so the value never goes backwards.
const PROGRESS_AVAILABLE: i32 = 5;
const DOWNLOAD_START: i32 = 5;
const DOWNLOAD_END: i32 = 80;
const PROGRESS_VERIFYING: i32 = 85;
const PROGRESS_INSTALLING: i32 = 90;
const PROGRESS_DONE: i32 = 100;

/// Everything the manager needs, wired up by the entrypoint or a test.
pub struct ManagerOptions {
    pub current_version: String,
    pub query: VersionQuery,
    pub policy: Arc<dyn PolicyProvider>,
    pub source: Arc<dyn VersionSource>,
    pub installer: Arc<dyn Installer>,
    pub markers: MarkerStore,
    pub ledger: Arc<FailedVersionLedger>,
    pub health: Arc<dyn HealthProbe>,
    pub disk: Arc<dyn DiskSpace>,
    /// Floor for the free space required before a download.
    pub min_disk_space_mb: u64,
    pub telemetry: TelemetryReporter,
    pub progress: Arc<ProgressHub>,
}

/// How a session finished when it did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    UpToDate,
    /// The new binary is in place; the process is expected to restart.
    RestartPending { version: String },
}

/// Point-in-time view for status endpoints and logs.
#[derive(Debug, Clone, Serialize)]
pub struct ManagerStatus {
    pub enabled: bool,
    pub policy_source: PolicySource,
    pub current_version: String,
    pub status: UpdateStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_version: Option<String>,
    pub progress: i32,
    pub message: String,
    pub cancellable: bool,
    pub session_started_at: Option<DateTime<Utc>>,
    pub last_check: Option<DateTime<Utc>>,
    pub next_check: Option<DateTime<Utc>>,
    pub check_interval_days: u32,
    pub excluded_versions: Vec<String>,
    pub channel: String,
    pub platform: String,
    pub arch: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Trigger {
    Scheduled,
    Manual,
    Forced { reason: String },
}

impl Trigger {
    fn is_forced(&self) -> bool {
        matches!(self, Trigger::Forced { .. })
    }

    fn label(&self) -> &'static str {
        match self {
            Trigger::Scheduled => "scheduled",
            Trigger::Manual => "manual",
            Trigger::Forced { .. } => "forced",
        }
    }

    fn reason(&self) -> &str {
        match self {
            Trigger::Forced { reason } => reason,
            _ => "",
        }
    }
}

/// The one live run of the state machine.
#[derive(Debug, Clone)]
struct UpdateSession {
    id: Uuid,
    status: UpdateStatus,
    target_version: Option<String>,
    progress: i32,
    message: String,
    started_at: DateTime<Utc>,
    cancel: CancellationToken,
}

impl UpdateSession {
    fn new(status: UpdateStatus, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            status,
            target_version: None,
            progress: 0,
            message: message.into(),
            started_at: Utc::now(),
            cancel: CancellationToken::new(),
        }
    }

    fn event(&self) -> ProgressEvent {
        ProgressEvent::new(self.status, self.message.clone())
            .with_target(self.target_version.clone())
            .with_progress(self.progress)
    }
}

/// The session with `id`, unless it was cancelled or replaced.
fn live(slot: &mut Option<UpdateSession>, id: Uuid) -> Option<&mut UpdateSession> {
    slot.as_mut()
        .filter(|s| s.id == id && !s.cancel.is_cancelled())
}

enum Verdict {
    UpToDate(String),
    RestartPending(String),
}

#[derive(Debug, Default)]
struct Schedule {
    last_check: Option<DateTime<Utc>>,
    next_check: Option<DateTime<Utc>>,
}

pub struct UpdateManager {
    current_version: String,
    query: VersionQuery,
    policy: Arc<dyn PolicyProvider>,
    source: Arc<dyn VersionSource>,
    installer: Arc<dyn Installer>,
    markers: MarkerStore,
    ledger: Arc<FailedVersionLedger>,
    validator: PostUpdateValidator,
    disk: Arc<dyn DiskSpace>,
    min_disk_space_mb: u64,
    telemetry: TelemetryReporter,
    progress: Arc<ProgressHub>,
    session: RwLock<Option<UpdateSession>>,
    schedule: RwLock<Schedule>,
    /// Held across mutate-then-publish so observers see transitions in order.
    emit: Mutex<()>,
    restart_tx: watch::Sender<Option<RestartRequest>>,
}

impl UpdateManager {
    pub fn new(options: ManagerOptions) -> Self {
        let validator = PostUpdateValidator::new(
            &options.current_version,
            options.markers.clone(),
            Arc::clone(&options.ledger),
            options.health,
        );
        let (restart_tx, _) = watch::channel(None);
        Self {
            current_version: options.current_version,
            query: options.query,
            policy: options.policy,
            source: options.source,
            installer: options.installer,
            markers: options.markers,
            ledger: options.ledger,
            validator,
            disk: options.disk,
            min_disk_space_mb: options.min_disk_space_mb,
            telemetry: options.telemetry,
            progress: options.progress,
            session: RwLock::new(None),
            schedule: RwLock::new(Schedule::default()),
            emit: Mutex::new(()),
            restart_tx,
        }
    }

    pub fn current_version(&self) -> &str {
        &self.current_version
    }

    pub fn progress(&self) -> &Arc<ProgressHub> {
        &self.progress
    }

    /// Fires once an install finished and the process should restart.
    pub fn restart_requests(&self) -> watch::Receiver<Option<RestartRequest>> {
        self.restart_tx.subscribe()
    }

    /// Check for an eligible update and install it.
    ///
    /// Fails fast with [`UpdateError::Busy`] while another session is live.
    pub async fn check_now(&self) -> Result<SessionOutcome, UpdateError> {
        self.run_session(Trigger::Manual).await
    }

    /// Install whatever the server offers, ignoring pin strategy, major
    /// upgrade gating and the failed-version ledger. `Never` mode still
    /// refuses.
    pub async fn force_install_latest(&self, reason: &str) -> Result<SessionOutcome, UpdateError> {
        self.run_session(Trigger::Forced {
            reason: reason.to_string(),
        })
        .await
    }

    /// Abort the live session if it is in a phase where that is safe.
    pub fn cancel(&self) -> bool {
        self.transition(|slot| {
            let session = match slot.as_mut() {
                Some(s) if s.status.is_cancellable() && !s.cancel.is_cancelled() => s,
                Some(s) => {
                    debug!("Cancel refused in state {}", s.status);
                    return (None, false);
                }
                None => return (None, false),
            };
            session.status = UpdateStatus::Cancelled;
            session.progress = PROGRESS_UNKNOWN;
            session.message = "Update cancelled".to_string();
            session.cancel.cancel();
            info!("Update session {} cancelled", session.id);
            (Some(session.event()), true)
        })
    }

    /// Consume the rollback marker left by a previous install, if any.
    ///
    /// Emits `Validating` followed by one terminal event when a marker was
    /// present, nothing otherwise.
    pub async fn validate_post_update(&self) -> Result<PostUpdateValidation, UpdateError> {
        let pending = match self.validator.pending()? {
            Some(pending) => pending,
            None => {
                debug!("No rollback marker, not running after an update");
                return Ok(PostUpdateValidation::NotUpdated);
            }
        };

        let mut session = UpdateSession::new(
            UpdateStatus::Validating,
            format!(
                "Validating update from {} to {}",
                pending.previous_version(),
                pending.expected_version()
            ),
        );
        session.target_version = Some(pending.expected_version().to_string());
        let id = session.id;
        self.transition(|slot| {
            if let Some(active) = slot.as_ref() {
                return (None, Err(UpdateError::Busy(active.status.to_string())));
            }
            let event = session.event();
            *slot = Some(session);
            (Some(event), Ok(()))
        })?;

        let result = self.validator.conclude(pending).await;

        let (event, code) = match &result {
            PostUpdateValidation::NotUpdated => (None, None),
            PostUpdateValidation::Succeeded { from, to } => (
                Some(
                    ProgressEvent::new(
                        UpdateStatus::Succeeded,
                        format!("Updated from {} to {}", from, to),
                    )
                    .with_progress(PROGRESS_DONE),
                ),
                None,
            ),
            PostUpdateValidation::RolledBack {
                expected, running, ..
            } => (
                Some(ProgressEvent::failure(
                    UpdateStatus::RolledBack,
                    format!("Update to {} was rolled back", expected),
                    format!("running {} instead of {}", running, expected),
                )),
                Some((CODE_ROLLED_BACK, format!("running {}", running))),
            ),
            PostUpdateValidation::Failed {
                expected, reason, ..
            } => (
                Some(ProgressEvent::failure(
                    UpdateStatus::Failed,
                    format!("Update to {} failed validation", expected),
                    reason.clone(),
                )),
                Some((CODE_HEALTH_CHECK, reason.clone())),
            ),
        };

        let expected = result_target(&result);
        if let Some(event) = event {
            let status = event.status;
            let event = event.with_target(expected.clone());
            self.finish(id, move |_| event);

            let mut report = TelemetryReport::new(id, status, &self.current_version)
                .target(expected.as_deref())
                .meta("trigger", "validation");
            if let Some(from) = result.from_version() {
                report = report.meta("from_version", from);
            }
            if let Some((code, message)) = code {
                report = report.error(code, message);
            }
            self.telemetry.submit(report);
        }

        Ok(result)
    }

    /// Snapshot of policy, session and schedule.
    pub fn status(&self) -> ManagerStatus {
        let effective = self.policy.effective_policy();
        let session = self
            .session
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let (last_check, next_check) = {
            let schedule = self.schedule.read().unwrap_or_else(|e| e.into_inner());
            (schedule.last_check, schedule.next_check)
        };
        let excluded_versions = self
            .ledger
            .active(Utc::now())
            .into_iter()
            .map(|e| e.version)
            .collect();

        let mut status = ManagerStatus {
            enabled: effective.is_enabled(),
            policy_source: effective.source(),
            current_version: self.current_version.clone(),
            status: UpdateStatus::Idle,
            target_version: None,
            progress: PROGRESS_UNKNOWN,
            message: String::new(),
            cancellable: false,
            session_started_at: None,
            last_check,
            next_check,
            check_interval_days: effective.spec().map(|s| s.update_check_days).unwrap_or(0),
            excluded_versions,
            channel: self.query.channel.clone(),
            platform: self.query.platform.clone(),
            arch: self.query.arch.clone(),
        };
        if let Some(session) = session {
            status.status = session.status;
            status.target_version = session.target_version;
            status.progress = session.progress;
            status.message = session.message;
            status.cancellable =
                session.status.is_cancellable() && !session.cancel.is_cancelled();
            status.session_started_at = Some(session.started_at);
        }
        status
    }

    /// Wait until no session is installing, up to `grace`. Returns whether
    /// the install settled in time.
    pub async fn wait_for_install_to_settle(&self, grace: Duration) -> bool {
        let deadline = Instant::now() + grace;
        loop {
            if self.status().status != UpdateStatus::Installing {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Validate the previous update, then run scheduled checks until
    /// `shutdown` fires. The cadence is recomputed whenever
    /// `policy_changes` ticks.
    pub async fn run(
        self: Arc<Self>,
        mut policy_changes: Option<watch::Receiver<u64>>,
        shutdown: CancellationToken,
    ) {
        match self.validate_post_update().await {
            Ok(result) if result.is_success() => info!("Post-update validation passed"),
            Ok(PostUpdateValidation::NotUpdated) => {}
            Ok(result) => warn!("Post-update validation reported {:?}", result),
            Err(e) => error!("Post-update validation failed: {}", e),
        }

        let mut plan: Option<(Duration, Instant)> = None;
        loop {
            let interval = self.policy.effective_policy().check_interval();
            if interval != plan.map(|(current, _)| current) {
                plan = match interval {
                    Some(interval) => {
                        let at = self.schedule_after(jittered(interval));
                        info!(
                            "Scheduled update checks every {} days",
                            interval.as_secs() / 86_400
                        );
                        Some((interval, at))
                    }
                    None => {
                        self.set_next_check(None);
                        info!("Scheduled update checks disabled");
                        None
                    }
                };
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                changed = policy_changed(&mut policy_changes) => {
                    if !changed {
                        policy_changes = None;
                    }
                    continue;
                }
                _ = sleep_until(plan.map(|(_, at)| at)) => {}
            }

            let Some((interval, _)) = plan else {
                continue;
            };

            if !self.in_maintenance_window(Utc::now()) {
                debug!("Outside maintenance window, retrying later");
                plan = Some((interval, self.schedule_after(WINDOW_RETRY)));
                continue;
            }

            // Run detached so shutdown is never stuck behind a download.
            let manager = Arc::clone(&self);
            tokio::spawn(async move {
                match manager.run_session(Trigger::Scheduled).await {
                    Ok(outcome) => debug!("Scheduled check finished: {:?}", outcome),
                    Err(e) if e.is_busy() => debug!("Scheduled check skipped: {}", e),
                    Err(UpdateError::Cancelled) => {}
                    Err(e) => warn!("Scheduled update check failed: {}", e),
                }
            });
            plan = Some((interval, self.schedule_after(jittered(interval))));
        }
        info!("Update loop stopped");
    }

    async fn run_session(&self, trigger: Trigger) -> Result<SessionOutcome, UpdateError> {
        let (id, cancel, policy) = self.begin(&trigger)?;

        match self.drive(id, &cancel, &policy, &trigger).await {
            Ok(Verdict::UpToDate(message)) => {
                let ended = self.finish(id, |s| {
                    ProgressEvent::new(UpdateStatus::UpToDate, message)
                        .with_target(s.target_version.clone())
                        .with_progress(PROGRESS_DONE)
                });
                match ended {
                    Some(session) => {
                        self.report(
                            &trigger,
                            &policy,
                            id,
                            UpdateStatus::UpToDate,
                            session.target_version.as_deref(),
                            None,
                        );
                        Ok(SessionOutcome::UpToDate)
                    }
                    None => Err(self.discard(id)),
                }
            }
            Ok(Verdict::RestartPending(version)) => Ok(SessionOutcome::RestartPending { version }),
            Err(UpdateError::Cancelled) => Err(self.discard(id)),
            Err(e) => {
                let message = failure_message(&e);
                let ended = self.finish(id, |s| {
                    ProgressEvent::failure(UpdateStatus::Failed, message, e.to_string())
                        .with_target(s.target_version.clone())
                });
                match ended {
                    Some(session) => {
                        warn!("Update session {} failed: {}", id, e);
                        self.report(
                            &trigger,
                            &policy,
                            id,
                            UpdateStatus::Failed,
                            session.target_version.as_deref(),
                            Some((e.code(), e.to_string())),
                        );
                        Err(e)
                    }
                    // Cancel won the race; its event was the terminal one.
                    None => Err(self.discard(id)),
                }
            }
        }
    }

    /// Open a session, or refuse with `Busy`/`Disabled`.
    fn begin(
        &self,
        trigger: &Trigger,
    ) -> Result<(Uuid, CancellationToken, EffectivePolicy), UpdateError> {
        let started = self.transition(|slot| {
            if let Some(active) = slot.as_ref() {
                return (None, Err(UpdateError::Busy(active.status.to_string())));
            }

            let policy = self.policy.effective_policy();
            if !policy.is_enabled() {
                let event = ProgressEvent::failure(
                    UpdateStatus::Failed,
                    "Auto-update is disabled on this agent",
                    UpdateError::Disabled.to_string(),
                );
                return (Some(event), Err(UpdateError::Disabled));
            }

            let session = UpdateSession::new(UpdateStatus::Checking, "Checking for updates");
            let event = session.event();
            let started = (session.id, session.cancel.clone(), policy);
            *slot = Some(session);
            (Some(event), Ok(started))
        });

        match &started {
            Ok((id, _, policy)) => info!(
                "Update session {} started ({}, policy from {})",
                id,
                trigger.label(),
                policy.source()
            ),
            Err(UpdateError::Disabled) => {
                info!("Refusing {} update: auto-update disabled", trigger.label());
                if let Trigger::Forced { reason } = trigger {
                    let report = TelemetryReport::new(
                        Uuid::new_v4(),
                        UpdateStatus::Failed,
                        &self.current_version,
                    )
                    .error(CODE_POLICY_DISABLED, UpdateError::Disabled.to_string())
                    .meta("trigger", trigger.label())
                    .meta("reason", reason.as_str());
                    self.telemetry.submit(report);
                }
            }
            Err(e) => debug!("Refusing {} update: {}", trigger.label(), e),
        }
        started
    }

    async fn drive(
        &self,
        id: Uuid,
        cancel: &CancellationToken,
        policy: &EffectivePolicy,
        trigger: &Trigger,
    ) -> Result<Verdict, UpdateError> {
        let latest = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(UpdateError::Cancelled),
            latest = self.source.check_latest(&self.query) => latest?,
        };
        self.mark_checked(Utc::now());

        let info = match latest {
            Some(info) => info,
            None => {
                return Ok(Verdict::UpToDate(format!(
                    "No published build for {} {}/{}",
                    self.query.channel, self.query.platform, self.query.arch
                )))
            }
        };

        if trigger.is_forced() {
            if let Some(entry) = self.ledger.excluded(&info.version, Utc::now()) {
                warn!(
                    "Forced install of {} bypasses exclusion ({})",
                    info.version, entry.reason
                );
            }
            info!(
                "Forced install of {} (running {}): {}",
                info.version,
                self.current_version,
                trigger.reason()
            );
        } else if let Some(reason) = self.decline_reason(&info.version, policy) {
            info!("Not updating to {}: {}", info.version, reason);
            return Ok(Verdict::UpToDate(format!(
                "Running {}; {} not eligible: {}",
                self.current_version, info.version, reason
            )));
        }

        self.announce(id, &info)?;
        ensure_space(self.disk.as_ref(), info.size_bytes, self.min_disk_space_mb)?;
        let artifact = self.download(id, cancel, &info).await?;

        self.advance(
            id,
            UpdateStatus::Verifying,
            PROGRESS_VERIFYING,
            format!("Verifying {}", info.version),
        )?;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(UpdateError::Cancelled),
            verified = self.source.verify(&artifact) => verified.map_err(|e| match e {
                SourceError::Cancelled => UpdateError::Cancelled,
                e => UpdateError::Verification(e.to_string()),
            })?,
        }

        // From here on cancellation is refused.
        self.advance(
            id,
            UpdateStatus::Installing,
            PROGRESS_INSTALLING,
            format!("Installing {}", info.version),
        )?;
        self.install(id, &artifact, trigger).await
    }

    async fn download(
        &self,
        id: Uuid,
        cancel: &CancellationToken,
        info: &VersionInfo,
    ) -> Result<Artifact, UpdateError> {
        self.advance(
            id,
            UpdateStatus::Downloading,
            DOWNLOAD_START,
            format!("Downloading {}", info.version),
        )?;

        let report = |done: u64, total: u64| self.download_progress(id, done, total);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(UpdateError::Cancelled),
            artifact = self.source.download(info, &report, cancel) => {
                artifact.map_err(UpdateError::from_download)
            }
        }
    }

    async fn install(
        &self,
        id: Uuid,
        artifact: &Artifact,
        trigger: &Trigger,
    ) -> Result<Verdict, UpdateError> {
        let mut marker = RollbackMarker::new(&self.current_version, &artifact.version);
        marker.run_id = Some(id);
        marker.forced = trigger.is_forced();
        marker.reason = trigger.reason().to_string();
        self.markers.write(&marker)?;
        debug!("Rollback marker written to {}", self.markers.path().display());

        let outcome = match self.installer.install(artifact).await {
            Ok(outcome) => outcome,
            Err(e) => {
                if let Err(clear) = self.markers.clear() {
                    warn!("Failed to clear rollback marker after failed install: {}", clear);
                }
                return Err(e.into());
            }
        };

        self.advance(
            id,
            UpdateStatus::AwaitingRestart,
            PROGRESS_DONE,
            format!("Installed {}, waiting for restart", artifact.version),
        )?;

        let policy = self.policy.effective_policy();
        self.report(
            trigger,
            &policy,
            id,
            UpdateStatus::AwaitingRestart,
            Some(&artifact.version),
            None,
        );

        match outcome {
            InstallOutcome::RestartRequired => {
                self.restart_tx.send_replace(Some(RestartRequest {
                    from_version: self.current_version.clone(),
                    to_version: artifact.version.clone(),
                    requested_at: Utc::now(),
                }));
            }
            InstallOutcome::RestartInitiated => info!("Installer initiated the restart"),
        }
        Ok(Verdict::RestartPending(artifact.version.clone()))
    }

    /// Why an automatic check should not take `candidate`, if it should not.
    fn decline_reason(&self, candidate: &str, policy: &EffectivePolicy) -> Option<String> {
        let spec = match policy.spec() {
            Some(spec) => spec,
            None => return Some("auto-update disabled".to_string()),
        };
        let current = match parse_version(&self.current_version) {
            Ok(v) => v,
            Err(e) => return Some(format!("running version is not comparable: {}", e)),
        };
        let offered = match parse_version(candidate) {
            Ok(v) => v,
            Err(e) => {
                warn!("Server offered an unparseable version: {}", e);
                return Some(e.to_string());
            }
        };
        if let Eligibility::Ineligible(reason) = evaluate(&current, &offered, spec) {
            return Some(reason.to_string());
        }
        self.ledger.excluded(candidate, Utc::now()).map(|entry| {
            format!(
                "failed at {} ({}), excluded until {}",
                entry.failed_at.to_rfc3339(),
                entry.reason,
                (entry.failed_at + self.ledger.cooldown()).to_rfc3339()
            )
        })
    }

    fn in_maintenance_window(&self, now: DateTime<Utc>) -> bool {
        self.policy
            .effective_policy()
            .spec()
            .map(|spec| spec.maintenance_window.contains(now))
            .unwrap_or(false)
    }

    /// Mutate the session slot and publish the resulting event while still
    /// holding the emit lock. Observers must not call back into the manager.
    fn transition<T>(
        &self,
        f: impl FnOnce(&mut Option<UpdateSession>) -> (Option<ProgressEvent>, T),
    ) -> T {
        let _emit = self.emit.lock().unwrap_or_else(|e| e.into_inner());
        let (event, value) = {
            let mut slot = self.session.write().unwrap_or_else(|e| e.into_inner());
            f(&mut slot)
        };
        if let Some(event) = event {
            self.progress.publish(event);
        }
        value
    }

    fn advance(
        &self,
        id: Uuid,
        status: UpdateStatus,
        progress: i32,
        message: String,
    ) -> Result<(), UpdateError> {
        self.transition(|slot| match live(slot, id) {
            Some(session) => {
                session.status = status;
                session.progress = session.progress.max(progress);
                session.message = message;
                info!("Update session {}: {}", id, session.status);
                (Some(session.event()), Ok(()))
            }
            None => (None, Err(UpdateError::Cancelled)),
        })
    }

    fn announce(&self, id: Uuid, info: &VersionInfo) -> Result<(), UpdateError> {
        self.transition(|slot| match live(slot, id) {
            Some(session) => {
                session.status = UpdateStatus::Available;
                session.target_version = Some(info.version.clone());
                session.progress = session.progress.max(PROGRESS_AVAILABLE);
                session.message = format!("Update {} available", info.version);
                info!("Update {} available (running {})", info.version, self.current_version);
                (Some(session.event()), Ok(()))
            }
            None => (None, Err(UpdateError::Cancelled)),
        })
    }

    /// Publish only when the scaled percentage actually moves.
    fn download_progress(&self, id: Uuid, done: u64, total: u64) {
        let scaled = DOWNLOAD_START + percent(done, total) * (DOWNLOAD_END - DOWNLOAD_START) / 100;
        self.transition(|slot| match live(slot, id) {
            Some(session)
                if session.status == UpdateStatus::Downloading && scaled > session.progress =>
            {
                session.progress = scaled;
                session.message = format!("Downloading... {}%", percent(done, total));
                (Some(session.event()), ())
            }
            _ => (None, ()),
        })
    }

    /// End session `id` with the event built by `terminal`. Returns the
    /// ended session, or `None` if it was cancelled or is no longer live.
    fn finish(
        &self,
        id: Uuid,
        terminal: impl FnOnce(&UpdateSession) -> ProgressEvent,
    ) -> Option<UpdateSession> {
        self.transition(|slot| {
            if live(slot, id).is_none() {
                return (None, None);
            }
            match slot.take() {
                Some(session) => {
                    let event = terminal(&session);
                    debug_assert!(event.status.is_terminal(), "{} ends no session", event.status);
                    info!("Update session {} ended: {}", id, event.status);
                    (Some(event), Some(session))
                }
                None => (None, None),
            }
        })
    }

    /// Drop a cancelled session without another event.
    fn discard(&self, id: Uuid) -> UpdateError {
        let mut slot = self.session.write().unwrap_or_else(|e| e.into_inner());
        if slot.as_ref().map(|s| s.id) == Some(id) {
            *slot = None;
            info!("Update session {} stopped after cancellation", id);
        }
        UpdateError::Cancelled
    }

    fn report(
        &self,
        trigger: &Trigger,
        policy: &EffectivePolicy,
        id: Uuid,
        status: UpdateStatus,
        target: Option<&str>,
        error: Option<(&str, String)>,
    ) {
        if !trigger.is_forced() && !policy.collect_telemetry() {
            return;
        }
        let mut report = TelemetryReport::new(id, status, &self.current_version)
            .target(target)
            .meta("trigger", trigger.label())
            .meta("policy_source", policy.source().as_str());
        if trigger.is_forced() {
            report = report.meta("reason", trigger.reason());
        }
        if let Some((code, message)) = error {
            report = report.error(code, message);
        }
        self.telemetry.submit(report);
    }

    fn mark_checked(&self, at: DateTime<Utc>) {
        self.schedule
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .last_check = Some(at);
    }

    fn set_next_check(&self, at: Option<DateTime<Utc>>) {
        self.schedule
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .next_check = at;
    }

    fn schedule_after(&self, delay: Duration) -> Instant {
        let delay = delay.min(MAX_SLEEP);
        let wall = chrono::Duration::from_std(delay)
            .ok()
            .map(|d| Utc::now() + d);
        self.set_next_check(wall);
        Instant::now() + delay
    }
}

fn result_target(result: &PostUpdateValidation) -> Option<String> {
    match result {
        PostUpdateValidation::NotUpdated => None,
        PostUpdateValidation::Succeeded { to, .. } => Some(to.clone()),
        PostUpdateValidation::RolledBack { expected, .. }
        | PostUpdateValidation::Failed { expected, .. } => Some(expected.clone()),
    }
}

fn failure_message(e: &UpdateError) -> &'static str {
    match e {
        UpdateError::Network(_) => "Update check failed",
        UpdateError::DiskSpace { .. } => "Insufficient disk space",
        UpdateError::Download(_) => "Download failed",
        UpdateError::Verification(_) => "Verification failed",
        UpdateError::Install(_) | UpdateError::Marker(_) => "Install failed",
        _ => "Update failed",
    }
}

/// Interval plus up to 10% random jitter.
fn jittered(interval: Duration) -> Duration {
    let max = interval.min(MAX_SLEEP).as_secs() / 10;
    if max == 0 {
        return interval;
    }
    interval + Duration::from_secs(rand::thread_rng().gen_range(0..=max))
}

async fn policy_changed(rx: &mut Option<watch::Receiver<u64>>) -> bool {
    match rx {
        Some(rx) => rx.changed().await.is_ok(),
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
