//! Link-level messages between a transport session and its connector.

use std::time::Duration;

use task_bridge_core::BridgeError;
use thiserror::Error;

/// Normal closure.
pub const CLOSE_NORMAL: u16 = 1000;
/// Close frame without a status code.
pub const CLOSE_NO_STATUS: u16 = 1005;
/// Link dropped without a close frame.
pub const CLOSE_ABNORMAL: u16 = 1006;

/// Close code and reason of a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
}

impl CloseInfo {
    #[must_use]
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Normal closure (1000).
    #[must_use]
    pub fn normal() -> Self {
        Self::new(CLOSE_NORMAL, "")
    }

    /// Abnormal closure (1006).
    #[must_use]
    pub fn abnormal(reason: impl Into<String>) -> Self {
        Self::new(CLOSE_ABNORMAL, reason)
    }

    #[must_use]
    pub const fn is_normal(&self) -> bool {
        self.code == CLOSE_NORMAL
    }
}

/// What the connector reports upward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportSignal {
    /// One complete text frame.
    Message(String),
    /// The link is gone. Emitted at most once, always last.
    Closed(CloseInfo),
}

/// What the session asks the connector to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    /// Close with code 1000.
    Close,
}

/// Transport error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Connection timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("Connection failed: {0}")]
    Refused(String),
    #[error("Link is not open")]
    NotOpen,
}

impl From<TransportError> for BridgeError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout(timeout) => Self::ConnectionTimeout { timeout },
            TransportError::Refused(message) => Self::Transport(message),
            TransportError::NotOpen => Self::NotConnected,
        }
    }
}
