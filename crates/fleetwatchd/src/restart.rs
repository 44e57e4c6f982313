//! Restart requests after an install.
//!
//! The manager never exits the process itself. It publishes a
//! [`RestartRequest`] and the entrypoint decides how to go away.

use chrono::{DateTime, Utc};
use tokio::process::Command;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartRequest {
    pub from_version: String,
    pub to_version: String,
    pub requested_at: DateTime<Utc>,
}

/// How the process should exit after [`request_service_restart`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartExit {
    /// The service manager will restart us; exit cleanly.
    Clean,
    /// Nobody asked for a restart; exit non-zero so `Restart=on-failure` kicks in.
    Failure,
}

impl RestartExit {
    pub fn code(&self) -> i32 {
        match self {
            RestartExit::Clean => 0,
            RestartExit::Failure => 1,
        }
    }
}

/// Systemd unit name with the `.service` suffix.
pub fn unit_name(service: &str) -> String {
    if service.ends_with(".service") {
        service.to_string()
    } else {
        format!("{}.service", service)
    }
}

/// Ask systemd to restart `service` without waiting for it.
pub async fn request_service_restart(service: &str) -> RestartExit {
    if service.trim().is_empty() || !cfg!(target_os = "linux") {
        info!("No service manager configured, exiting for restart");
        return RestartExit::Failure;
    }

    let unit = unit_name(service.trim());
    info!("Requesting systemd restart of {}", unit);

    let status = Command::new("systemctl")
        .args(["restart", "--no-block", &unit])
        .status()
        .await;

    match status {
        Ok(status) if status.success() => RestartExit::Clean,
        Ok(status) => {
            warn!("systemctl restart exited with {}, falling back to exit", status);
            RestartExit::Failure
        }
        Err(e) => {
            warn!("Failed to run systemctl: {}, falling back to exit", e);
            RestartExit::Failure
        }
    }
}
