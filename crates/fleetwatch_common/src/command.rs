//! Server command protocol and wire envelope.
//!
//! Inbound traffic is `{"type": ..., "data": ...}`. The untyped payload map
//! only lives in this module; everything past [`InboundMessage::parse`] works
//! with [`AgentCommand`].

use crate::error::ProtocolError;
use crate::policy::FleetUpdatePolicy;
use crate::progress::ProgressEvent;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const MSG_COMMAND: &str = "command";
pub const MSG_UPDATE_POLICY: &str = "update_policy";
pub const MSG_UPDATE_PROGRESS: &str = "update_progress";

pub const CMD_CHECK_UPDATE: &str = "check_update";
pub const CMD_CANCEL_UPDATE: &str = "cancel_update";
pub const CMD_FORCE_UPDATE: &str = "force_update";

/// Commands the server may send to an agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentCommand {
    CheckUpdate,
    CancelUpdate,
    ForceUpdate { reason: String },
}

impl AgentCommand {
    /// Build a command from its wire name and payload map.
    pub fn from_wire(name: &str, payload: &Map<String, Value>) -> Result<Self, ProtocolError> {
        match name.trim() {
            CMD_CHECK_UPDATE => Ok(AgentCommand::CheckUpdate),
            CMD_CANCEL_UPDATE => Ok(AgentCommand::CancelUpdate),
            CMD_FORCE_UPDATE => {
                let reason = match payload.get("reason") {
                    None | Some(Value::Null) => String::new(),
                    Some(Value::String(s)) => s.clone(),
                    Some(other) => {
                        return Err(ProtocolError::Malformed(format!(
                            "force_update reason must be a string, got {}",
                            other
                        )))
                    }
                };
                Ok(AgentCommand::ForceUpdate { reason })
            }
            other => Err(ProtocolError::UnknownCommand(other.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AgentCommand::CheckUpdate => CMD_CHECK_UPDATE,
            AgentCommand::CancelUpdate => CMD_CANCEL_UPDATE,
            AgentCommand::ForceUpdate { .. } => CMD_FORCE_UPDATE,
        }
    }
}

/// Envelope shared by every message on the agent channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl WireMessage {
    /// Wrap a progress event for the server.
    pub fn progress(event: &ProgressEvent, now: DateTime<Utc>) -> Result<Self, ProtocolError> {
        Ok(Self {
            kind: MSG_UPDATE_PROGRESS.to_string(),
            data: serde_json::to_value(event)?,
            timestamp: Some(now),
        })
    }
}

/// Typed view of an inbound envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Command(AgentCommand),
    /// `None` clears the stored fleet policy.
    FleetPolicy(Option<FleetUpdatePolicy>),
}

impl InboundMessage {
    /// Parse one JSON envelope.
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        let message: WireMessage = serde_json::from_str(raw)?;
        Self::from_wire(message)
    }

    pub fn from_wire(message: WireMessage) -> Result<Self, ProtocolError> {
        match message.kind.as_str() {
            MSG_COMMAND => {
                let payload = match message.data {
                    Value::Object(map) => map,
                    other => {
                        return Err(ProtocolError::Malformed(format!(
                            "command data must be an object, got {}",
                            other
                        )))
                    }
                };
                let name = payload
                    .get("command")
                    .and_then(Value::as_str)
                    .ok_or_else(|| ProtocolError::Malformed("command name missing".to_string()))?
                    .to_string();
                AgentCommand::from_wire(&name, &payload).map(InboundMessage::Command)
            }
            MSG_UPDATE_POLICY => {
                let policy: Option<FleetUpdatePolicy> = serde_json::from_value(message.data)?;
                Ok(InboundMessage::FleetPolicy(policy))
            }
            other => Err(ProtocolError::UnsupportedMessage(other.to_string())),
        }
    }
}
