//! Shared types for the fleetwatch agent update subsystem.
//!
//! Everything here is free of process-level I/O apart from [`fs_utils`]:
//! policy resolution, version eligibility, the progress schema and the
//! command protocol are plain data and pure functions.

pub mod command;
pub mod error;
pub mod fs_utils;
pub mod policy;
pub mod progress;
pub mod version;

pub use command::{AgentCommand, InboundMessage, WireMessage};
pub use error::{PolicyError, ProtocolError};
pub use policy::{
    resolve, AgentOverrideMode, EffectivePolicy, FleetUpdatePolicy, MaintenanceWindow,
    PolicySource, PolicySpec, VersionPinStrategy,
};
pub use progress::{ProgressEvent, UpdateStatus, PROGRESS_UNKNOWN};
pub use version::{evaluate, parse_version, same_version, Eligibility, IneligibleReason};

/// Version of the running agent binary.
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");
