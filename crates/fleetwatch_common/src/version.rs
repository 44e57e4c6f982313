//! Version parsing and pin-strategy eligibility.

use crate::error::PolicyError;
use crate::policy::{PolicySpec, VersionPinStrategy};
use semver::Version;
use std::fmt;

/// Parse a release version, tolerating a leading `v`, short cores (`1.2`)
/// and four-part builds (`1.2.3.4`, folded into the prerelease).
pub fn parse_version(raw: &str) -> Result<Version, PolicyError> {
    let trimmed = raw.trim();
    let trimmed = trimmed.strip_prefix('v').unwrap_or(trimmed).trim();
    if trimmed.is_empty() {
        return Err(invalid(raw, "empty version"));
    }

    if let Ok(version) = Version::parse(trimmed) {
        return Ok(version);
    }

    let (rest, build) = match trimmed.split_once('+') {
        Some((rest, build)) => (rest, Some(build)),
        None => (trimmed, None),
    };
    let (core, prerelease) = match rest.split_once('-') {
        Some((core, pre)) => (core, Some(pre)),
        None => (rest, None),
    };

    let mut segments: Vec<&str> = core.split('.').collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(invalid(raw, "empty version segment"));
    }
    while segments.len() < 3 {
        segments.push("0");
    }

    let mut pre_parts = Vec::new();
    if segments.len() > 3 {
        pre_parts.push(segments[3..].join("."));
    }
    if let Some(pre) = prerelease.filter(|p| !p.is_empty()) {
        pre_parts.push(pre.to_string());
    }

    let mut normalized = segments[..3].join(".");
    if !pre_parts.is_empty() {
        normalized.push('-');
        normalized.push_str(&pre_parts.join("."));
    }
    if let Some(build) = build {
        normalized.push('+');
        normalized.push_str(build);
    }

    Version::parse(&normalized).map_err(|e| invalid(raw, &e.to_string()))
}

/// Whether two version strings name the same release. Falls back to a
/// plain string comparison when either side does not parse.
pub fn same_version(a: &str, b: &str) -> bool {
    match (parse_version(a), parse_version(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => a.trim() == b.trim(),
    }
}

fn invalid(raw: &str, reason: &str) -> PolicyError {
    PolicyError::InvalidVersion {
        version: raw.to_string(),
        reason: reason.to_string(),
    }
}

/// Why a candidate was turned down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IneligibleReason {
    NotNewer,
    MajorUpgradeNotAllowed,
    OutsideMinorLine,
    OutsidePatchLine,
    PinTargetMissing,
    PinTargetInvalid(String),
    NotPinTarget { target: Version },
    AlreadyAtPin,
}

impl fmt::Display for IneligibleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IneligibleReason::NotNewer => write!(f, "candidate is not newer than the running version"),
            IneligibleReason::MajorUpgradeNotAllowed => write!(f, "major upgrades are not allowed"),
            IneligibleReason::OutsideMinorLine => write!(f, "candidate leaves the current minor line"),
            IneligibleReason::OutsidePatchLine => write!(f, "candidate is not a patch release of the running version"),
            IneligibleReason::PinTargetMissing => write!(f, "pin strategy without a target version"),
            IneligibleReason::PinTargetInvalid(reason) => write!(f, "pin target is invalid: {}", reason),
            IneligibleReason::NotPinTarget { target } => write!(f, "candidate is not the pinned version {}", target),
            IneligibleReason::AlreadyAtPin => write!(f, "already running the pinned version"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Eligibility {
    Eligible,
    Ineligible(IneligibleReason),
}

/// Decide whether moving from `current` to `candidate` is allowed by `spec`.
///
/// `Latest`, `Minor` and `Patch` only ever move forward. `Pin` accepts the
/// target in either direction, but never the version already running.
pub fn evaluate(current: &Version, candidate: &Version, spec: &PolicySpec) -> Eligibility {
    use Eligibility::*;
    use IneligibleReason::*;

    if spec.version_pin_strategy == VersionPinStrategy::Pin {
        let raw = spec.target_version.trim();
        if raw.is_empty() {
            return Ineligible(PinTargetMissing);
        }
        let target = match parse_version(raw) {
            Ok(v) => v,
            Err(e) => return Ineligible(PinTargetInvalid(e.to_string())),
        };
        if candidate != &target {
            return Ineligible(NotPinTarget { target });
        }
        if candidate == current {
            return Ineligible(AlreadyAtPin);
        }
        return Eligible;
    }

    if candidate <= current {
        return Ineligible(NotNewer);
    }

    match spec.version_pin_strategy {
        VersionPinStrategy::Latest => {
            if candidate.major != current.major && !spec.allow_major_upgrade {
                Ineligible(MajorUpgradeNotAllowed)
            } else {
                Eligible
            }
        }
        VersionPinStrategy::Minor => {
            let same_line = candidate.major == current.major && candidate.minor == current.minor;
            if !same_line && !spec.allow_major_upgrade {
                Ineligible(OutsideMinorLine)
            } else {
                Eligible
            }
        }
        VersionPinStrategy::Patch => {
            if candidate.major != current.major || candidate.minor != current.minor {
                Ineligible(OutsidePatchLine)
            } else {
                Eligible
            }
        }
        VersionPinStrategy::Pin => Eligible,
    }
}
