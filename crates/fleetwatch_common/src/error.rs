//! Error types shared between the agent daemon and its wire boundary.

use thiserror::Error;

/// Errors raised while parsing policy values that arrive as strings
/// (config files, fleet payloads).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PolicyError {
    #[error("unrecognized auto-update mode: {0:?}")]
    UnrecognizedMode(String),

    #[error("unrecognized version pin strategy: {0:?}")]
    UnrecognizedStrategy(String),

    #[error("invalid version {version:?}: {reason}")]
    InvalidVersion { version: String, reason: String },
}

/// Errors raised at the command/progress wire edge.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("unsupported message type: {0}")]
    UnsupportedMessage(String),

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ProtocolError {
    /// Unknown names are expected traffic from newer servers; everything
    /// else indicates a broken peer.
    pub fn is_unknown(&self) -> bool {
        matches!(
            self,
            ProtocolError::UnknownCommand(_) | ProtocolError::UnsupportedMessage(_)
        )
    }
}
