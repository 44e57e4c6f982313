//! Update outcome telemetry.
//!
//! Reports are fire-and-forget: each one is delivered on its own task and a
//! delivery failure is only logged.

use crate::error::SinkError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleetwatch_common::UpdateStatus;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

pub const CODE_ROLLED_BACK: &str = "ROLLED_BACK";
pub const CODE_HEALTH_CHECK: &str = "HEALTH_CHECK";
pub const CODE_POLICY_DISABLED: &str = "POLICY_DISABLED";

/// One check or install outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryReport {
    pub agent_id: String,
    pub run_id: Uuid,
    pub status: UpdateStatus,
    pub current_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl TelemetryReport {
    pub fn new(run_id: Uuid, status: UpdateStatus, current_version: &str) -> Self {
        Self {
            agent_id: String::new(),
            run_id,
            status,
            current_version: current_version.to_string(),
            target_version: None,
            error_code: None,
            error_message: None,
            timestamp: Utc::now(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn target(mut self, target: Option<&str>) -> Self {
        self.target_version = target.map(str::to_string);
        self
    }

    pub fn error(mut self, code: &str, message: impl Into<String>) -> Self {
        self.error_code = Some(code.to_string());
        self.error_message = Some(message.into());
        self
    }

    pub fn meta(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

#[async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn report(&self, report: &TelemetryReport) -> Result<(), SinkError>;
}

/// Stamps reports with the agent id and ships them in the background.
#[derive(Clone)]
pub struct TelemetryReporter {
    agent_id: String,
    sink: Option<Arc<dyn TelemetrySink>>,
}

impl TelemetryReporter {
    pub fn new(agent_id: impl Into<String>, sink: Option<Arc<dyn TelemetrySink>>) -> Self {
        Self {
            agent_id: agent_id.into(),
            sink,
        }
    }

    pub fn submit(&self, mut report: TelemetryReport) {
        let Some(sink) = self.sink.clone() else {
            return;
        };
        report.agent_id = self.agent_id.clone();

        tokio::spawn(async move {
            match sink.report(&report).await {
                Ok(()) => debug!("Telemetry delivered ({} {})", report.run_id, report.status),
                Err(e) => warn!("Failed to report telemetry: {}", e),
            }
        });
    }
}
