//! Command dispatcher: one command, one JSON text frame.

use task_bridge_core::{BridgeError, Command};
use task_bridge_transport::TransportSession;

/// Encode `command` and hand it to the open transport.
///
/// Fire-and-forget: the outcome arrives later as inbound events.
///
/// # Errors
/// Returns `BridgeError::Encode` if serialization fails, or
/// `BridgeError::NotConnected` if the transport is closed.
pub fn dispatch(session: &TransportSession, command: &Command) -> Result<(), BridgeError> {
    let frame = command.encode()?;
    session.send(frame)?;
    tracing::debug!("Sent {} to {}", command.kind(), session.url());
    Ok(())
}
