//! Update policy model and resolution.
//!
//! An agent carries a local [`PolicySpec`] from its configuration and may
//! receive a [`FleetUpdatePolicy`] from the server at any time. The
//! [`AgentOverrideMode`] decides which of the two governs. [`resolve`] is the
//! only place that precedence is implemented.

use crate::error::PolicyError;
use chrono::{DateTime, Datelike, FixedOffset, Offset, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

const SECS_PER_DAY: u64 = 24 * 60 * 60;

/// How a standalone agent treats the fleet policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum AgentOverrideMode {
    /// Fleet policy governs; local policy is the fallback until one arrives.
    #[default]
    Inherit,
    /// Local policy governs; fleet policy is ignored.
    Local,
    /// Automatic updates are disabled outright.
    Never,
}

impl AgentOverrideMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentOverrideMode::Inherit => "inherit",
            AgentOverrideMode::Local => "local",
            AgentOverrideMode::Never => "never",
        }
    }
}

impl FromStr for AgentOverrideMode {
    type Err = PolicyError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "inherit" | "fleet" | "auto" => Ok(AgentOverrideMode::Inherit),
            "local" => Ok(AgentOverrideMode::Local),
            "never" | "disabled" | "off" => Ok(AgentOverrideMode::Never),
            _ => Err(PolicyError::UnrecognizedMode(value.to_string())),
        }
    }
}

impl TryFrom<String> for AgentOverrideMode {
    type Error = PolicyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<AgentOverrideMode> for String {
    fn from(mode: AgentOverrideMode) -> Self {
        mode.as_str().to_string()
    }
}

impl fmt::Display for AgentOverrideMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which future versions an agent may move to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum VersionPinStrategy {
    /// Any newer version; major bumps still need `allow_major_upgrade`.
    Latest,
    /// Newer builds of the running major.minor line; `allow_major_upgrade`
    /// lifts the restriction.
    #[default]
    Minor,
    /// Patch bumps within the running major.minor line.
    Patch,
    /// Exactly `target_version`, nothing else.
    Pin,
}

impl VersionPinStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            VersionPinStrategy::Latest => "latest",
            VersionPinStrategy::Minor => "minor",
            VersionPinStrategy::Patch => "patch",
            VersionPinStrategy::Pin => "pin",
        }
    }
}

impl FromStr for VersionPinStrategy {
    type Err = PolicyError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "latest" | "major" => Ok(VersionPinStrategy::Latest),
            "minor" => Ok(VersionPinStrategy::Minor),
            "patch" => Ok(VersionPinStrategy::Patch),
            "pin" | "exact" => Ok(VersionPinStrategy::Pin),
            _ => Err(PolicyError::UnrecognizedStrategy(value.to_string())),
        }
    }
}

impl TryFrom<String> for VersionPinStrategy {
    type Error = PolicyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<VersionPinStrategy> for String {
    fn from(strategy: VersionPinStrategy) -> Self {
        strategy.as_str().to_string()
    }
}

impl fmt::Display for VersionPinStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Time-of-day window in which scheduled updates may run.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceWindow {
    pub enabled: bool,
    pub start_hour: u8,
    pub start_min: u8,
    pub end_hour: u8,
    pub end_min: u8,
    /// IANA zone name such as `Europe/Madrid`. Takes precedence over
    /// `utc_offset`; empty means use the offset.
    pub timezone: String,
    /// Fixed offset such as `+02:00`; empty or `UTC` means UTC.
    pub utc_offset: String,
    /// 0 = Sunday. Empty means every day.
    pub days_of_week: Vec<u8>,
}

enum WindowZone {
    Named(Tz),
    Fixed(FixedOffset),
}

impl MaintenanceWindow {
    /// Whether `now` falls inside the window. A disabled window always matches.
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        if !self.enabled {
            return true;
        }

        let (weekday, current) = match self.zone() {
            WindowZone::Named(tz) => local_clock(now.with_timezone(&tz)),
            WindowZone::Fixed(offset) => local_clock(now.with_timezone(&offset)),
        };

        if !self.days_of_week.is_empty() && !self.days_of_week.contains(&weekday) {
            return false;
        }

        let start = u32::from(self.start_hour) * 60 + u32::from(self.start_min);
        let end = u32::from(self.end_hour) * 60 + u32::from(self.end_min);

        if start <= end {
            current >= start && current < end
        } else {
            // Overnight window, e.g. 22:00-04:00
            current >= start || current < end
        }
    }

    fn zone(&self) -> WindowZone {
        let utc = WindowZone::Fixed(Utc.fix());

        let name = self.timezone.trim();
        if !name.is_empty() {
            return match name.parse::<Tz>() {
                Ok(tz) => WindowZone::Named(tz),
                Err(e) => {
                    warn!("Unknown maintenance window timezone {:?} ({}), using UTC", name, e);
                    utc
                }
            };
        }

        let raw = self.utc_offset.trim();
        if raw.is_empty() || raw.eq_ignore_ascii_case("utc") || raw == "Z" {
            return utc;
        }
        match raw.parse::<FixedOffset>() {
            Ok(offset) => WindowZone::Fixed(offset),
            Err(e) => {
                warn!("Invalid maintenance window offset {:?} ({}), using UTC", raw, e);
                utc
            }
        }
    }
}

/// Weekday (0 = Sunday) and minute of day of a zoned timestamp.
fn local_clock<T: TimeZone>(local: DateTime<T>) -> (u8, u32) {
    let weekday = local.weekday().num_days_from_sunday() as u8;
    (weekday, local.hour() * 60 + local.minute())
}

/// The knobs shared by local and fleet policies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicySpec {
    /// Scheduled check cadence in days. 0 disables scheduled checks;
    /// explicit commands still work.
    pub update_check_days: u32,
    pub version_pin_strategy: VersionPinStrategy,
    pub allow_major_upgrade: bool,
    /// Required when `version_pin_strategy` is `Pin`.
    pub target_version: String,
    pub maintenance_window: MaintenanceWindow,
    pub collect_telemetry: bool,
}

impl Default for PolicySpec {
    fn default() -> Self {
        Self {
            update_check_days: 7,
            version_pin_strategy: VersionPinStrategy::Minor,
            allow_major_upgrade: false,
            target_version: String::new(),
            maintenance_window: MaintenanceWindow::default(),
            collect_telemetry: true,
        }
    }
}

/// Server-issued policy for the whole tenant. Replaced wholesale on arrival.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetUpdatePolicy {
    #[serde(flatten)]
    pub spec: PolicySpec,
    #[serde(default)]
    pub tenant_id: String,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl FleetUpdatePolicy {
    pub fn new(spec: PolicySpec) -> Self {
        Self {
            spec,
            tenant_id: String::new(),
            updated_at: None,
        }
    }
}

/// Where the effective policy came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicySource {
    Fleet,
    Local,
    /// Inherit mode, but no fleet policy has arrived yet.
    Fallback,
    Disabled,
}

impl PolicySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicySource::Fleet => "fleet",
            PolicySource::Local => "local",
            PolicySource::Fallback => "fallback",
            PolicySource::Disabled => "disabled",
        }
    }
}

impl fmt::Display for PolicySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The policy actually enforced after resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum EffectivePolicy {
    /// Mode is `Never`: no checks of any kind.
    Disabled,
    Enabled {
        source: PolicySource,
        spec: PolicySpec,
    },
}

impl EffectivePolicy {
    pub fn is_enabled(&self) -> bool {
        matches!(self, EffectivePolicy::Enabled { .. })
    }

    pub fn source(&self) -> PolicySource {
        match self {
            EffectivePolicy::Disabled => PolicySource::Disabled,
            EffectivePolicy::Enabled { source, .. } => *source,
        }
    }

    pub fn spec(&self) -> Option<&PolicySpec> {
        match self {
            EffectivePolicy::Disabled => None,
            EffectivePolicy::Enabled { spec, .. } => Some(spec),
        }
    }

    /// Cadence for scheduled checks, `None` when they should not run.
    pub fn check_interval(&self) -> Option<Duration> {
        let days = self.spec()?.update_check_days;
        if days == 0 {
            return None;
        }
        Some(Duration::from_secs(u64::from(days) * SECS_PER_DAY))
    }

    pub fn collect_telemetry(&self) -> bool {
        self.spec().map(|s| s.collect_telemetry).unwrap_or(false)
    }
}

/// Merge override mode, local policy and fleet policy into the effective
/// policy. Pure: identical inputs always give identical output.
pub fn resolve(
    mode: AgentOverrideMode,
    local: &PolicySpec,
    fleet: Option<&FleetUpdatePolicy>,
) -> EffectivePolicy {
    match mode {
        AgentOverrideMode::Never => EffectivePolicy::Disabled,
        AgentOverrideMode::Local => EffectivePolicy::Enabled {
            source: PolicySource::Local,
            spec: local.clone(),
        },
        AgentOverrideMode::Inherit => match fleet {
            Some(fleet) => EffectivePolicy::Enabled {
                source: PolicySource::Fleet,
                spec: fleet.spec.clone(),
            },
            None => EffectivePolicy::Enabled {
                source: PolicySource::Fallback,
                spec: local.clone(),
            },
        },
    }
}
