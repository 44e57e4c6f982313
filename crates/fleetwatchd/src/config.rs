//! Configuration management for fleetwatchd.
//!
//! Loads settings from /etc/fleetwatch/agent.toml or uses defaults.
//! Mode and strategy strings are parsed here, once; anything unrecognised is
//! logged and replaced by the default rather than rejected.

use crate::disk::DEFAULT_MIN_DISK_SPACE_MB;
use anyhow::{Context, Result};
use fleetwatch_common::fs_utils::atomic_write;
use fleetwatch_common::{AgentOverrideMode, MaintenanceWindow, PolicySpec, VersionPinStrategy};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// Config file path
pub const CONFIG_PATH: &str = "/etc/fleetwatch/agent.toml";

/// Default state directory
pub const DEFAULT_DATA_DIR: &str = "/var/lib/fleetwatch";

const AGENT_ID_FILE: &str = "agent_id";

/// Identity of this agent and where it gets updates from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Release channel (stable, beta, ...)
    #[serde(default = "default_channel")]
    pub channel: String,

    #[serde(default = "default_platform")]
    pub platform: String,

    #[serde(default = "default_arch")]
    pub arch: String,

    /// Binary replaced on install. Defaults to the running executable.
    #[serde(default)]
    pub binary_path: Option<PathBuf>,

    /// systemd unit restarted after install. Empty means exit and let the
    /// supervisor bring us back.
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// Fleet server base URL. Without it no version source is available.
    #[serde(default)]
    pub server_url: Option<String>,

    /// Empty means generate one and persist it under `data_dir`.
    #[serde(default)]
    pub agent_id: String,

    #[serde(default)]
    pub api_token: Option<String>,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(DEFAULT_DATA_DIR)
}

fn default_channel() -> String {
    "stable".to_string()
}

fn default_platform() -> String {
    std::env::consts::OS.to_string()
}

fn default_arch() -> String {
    match std::env::consts::ARCH {
        "x86_64" => "amd64".to_string(),
        "aarch64" => "arm64".to_string(),
        other => other.to_string(),
    }
}

fn default_service_name() -> String {
    "fleetwatch-agent".to_string()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            channel: default_channel(),
            platform: default_platform(),
            arch: default_arch(),
            binary_path: None,
            service_name: default_service_name(),
            server_url: None,
            agent_id: String::new(),
            api_token: None,
        }
    }
}

/// Local update policy as written in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalPolicyConfig {
    #[serde(default = "default_check_days")]
    pub update_check_days: u32,

    #[serde(default = "default_strategy")]
    pub version_pin_strategy: String,

    #[serde(default)]
    pub allow_major_upgrade: bool,

    #[serde(default)]
    pub target_version: String,

    #[serde(default)]
    pub maintenance_window: MaintenanceWindow,

    #[serde(default = "default_collect_telemetry")]
    pub collect_telemetry: bool,
}

fn default_check_days() -> u32 {
    7
}

fn default_strategy() -> String {
    VersionPinStrategy::default().to_string()
}

fn default_collect_telemetry() -> bool {
    true
}

impl Default for LocalPolicyConfig {
    fn default() -> Self {
        Self {
            update_check_days: default_check_days(),
            version_pin_strategy: default_strategy(),
            allow_major_upgrade: false,
            target_version: String::new(),
            maintenance_window: MaintenanceWindow::default(),
            collect_telemetry: default_collect_telemetry(),
        }
    }
}

impl LocalPolicyConfig {
    pub fn to_policy_spec(&self) -> PolicySpec {
        let strategy = self
            .version_pin_strategy
            .parse::<VersionPinStrategy>()
            .unwrap_or_else(|e| {
                warn!("{}, using {}", e, VersionPinStrategy::default());
                VersionPinStrategy::default()
            });

        PolicySpec {
            update_check_days: self.update_check_days,
            version_pin_strategy: strategy,
            allow_major_upgrade: self.allow_major_upgrade,
            target_version: self.target_version.trim().to_string(),
            maintenance_window: self.maintenance_window.clone(),
            collect_telemetry: self.collect_telemetry,
        }
    }
}

/// `[auto_update]` section
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AutoUpdateConfig {
    /// inherit | local | never
    #[serde(default)]
    pub mode: String,

    #[serde(default)]
    pub local_policy: LocalPolicyConfig,
}

impl AutoUpdateConfig {
    pub fn override_mode(&self) -> AgentOverrideMode {
        self.mode.parse::<AgentOverrideMode>().unwrap_or_else(|e| {
            warn!("{}, using {}", e, AgentOverrideMode::default());
            AgentOverrideMode::default()
        })
    }
}

/// `[update]` tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateTuning {
    /// How long a version that failed post-update validation stays excluded.
    #[serde(default = "default_cooldown_hours")]
    pub failed_version_cooldown_hours: u64,

    /// Remote progress queue depth; oldest events drop on overflow.
    #[serde(default = "default_progress_buffer")]
    pub progress_buffer: usize,

    /// How long shutdown waits for an install to finish.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Free space always required before a download, whatever its size.
    #[serde(default = "default_min_disk_space")]
    pub min_disk_space_mb: u64,
}

// Ten years; anything larger is effectively "forever".
const MAX_COOLDOWN_HOURS: u64 = 24 * 365 * 10;

fn default_cooldown_hours() -> u64 {
    72
}

fn default_progress_buffer() -> usize {
    64
}

fn default_shutdown_grace() -> u64 {
    30
}

fn default_request_timeout() -> u64 {
    60
}

fn default_min_disk_space() -> u64 {
    DEFAULT_MIN_DISK_SPACE_MB
}

impl Default for UpdateTuning {
    fn default() -> Self {
        Self {
            failed_version_cooldown_hours: default_cooldown_hours(),
            progress_buffer: default_progress_buffer(),
            shutdown_grace_secs: default_shutdown_grace(),
            request_timeout_secs: default_request_timeout(),
            min_disk_space_mb: default_min_disk_space(),
        }
    }
}

impl UpdateTuning {
    pub fn cooldown(&self) -> chrono::Duration {
        chrono::Duration::hours(self.failed_version_cooldown_hours.min(MAX_COOLDOWN_HOURS) as i64)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

/// Full agent configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,

    #[serde(default)]
    pub auto_update: AutoUpdateConfig,

    #[serde(default)]
    pub update: UpdateTuning,
}

impl Config {
    /// Load config from `path` (or the system path), or return defaults.
    pub fn load(path: Option<&Path>) -> Self {
        let path = path.unwrap_or_else(|| Path::new(CONFIG_PATH));
        Self::load_from_path(path).unwrap_or_else(|e| {
            warn!("Config not loaded, using defaults: {:#}", e);
            Config::default()
        })
    }

    /// Load config from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn override_mode(&self) -> AgentOverrideMode {
        self.auto_update.override_mode()
    }

    pub fn local_policy(&self) -> PolicySpec {
        self.auto_update.local_policy.to_policy_spec()
    }

    pub fn autoupdate_dir(&self) -> PathBuf {
        self.agent.data_dir.join("autoupdate")
    }

    /// Configured agent id, else the one persisted under `data_dir`, else a
    /// fresh one (persisted for next time).
    pub fn load_or_create_agent_id(&self) -> Result<String> {
        let configured = self.agent.agent_id.trim();
        if !configured.is_empty() {
            return Ok(configured.to_string());
        }

        let path = self.agent.data_dir.join(AGENT_ID_FILE);
        if let Ok(content) = fs::read_to_string(&path) {
            let stored = content.trim();
            if !stored.is_empty() {
                return Ok(stored.to_string());
            }
        }

        let id = Uuid::new_v4().to_string();
        atomic_write(&path, id.as_bytes())
            .with_context(|| format!("Failed to persist agent id to {}", path.display()))?;
        info!("Generated agent id {}", id);
        Ok(id)
    }

    /// Binary to replace on install.
    pub fn binary_path(&self) -> Result<PathBuf> {
        match &self.agent.binary_path {
            Some(path) => Ok(path.clone()),
            None => std::env::current_exe().context("Failed to resolve running executable"),
        }
    }
}
