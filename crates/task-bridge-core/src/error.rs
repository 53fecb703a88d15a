//! Error taxonomy surfaced to bridge callers.

use std::time::Duration;

use thiserror::Error;

use crate::command::ValidationError;

/// Bridge error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    /// The link did not open within the timeout.
    #[error("Connection timed out after {}s", .timeout.as_secs())]
    ConnectionTimeout { timeout: Duration },
    /// Socket-level error, before or during open.
    #[error("Transport error: {0}")]
    Transport(String),
    /// A send was attempted while the session is not open.
    #[error("Session is not connected")]
    NotConnected,
    /// A connect was superseded by a local disconnect.
    #[error("Connection aborted by disconnect")]
    ConnectionAborted,
    /// Rejected locally before anything was sent.
    #[error("Invalid request: {0}")]
    Validation(#[from] ValidationError),
    /// Another run is still active.
    #[error("A task run is already in progress")]
    RunInProgress,
    /// No run is waiting for a passcode.
    #[error("No one-time passcode was requested")]
    NoOtpPending,
    /// The command could not be serialized.
    #[error("Failed to encode command: {0}")]
    Encode(String),
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        Self::Encode(err.to_string())
    }
}
