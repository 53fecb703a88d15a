//! Transport layer for the task bridge.
//!
//! Provides:
//! - Link signals and transport errors (`protocol`)
//! - `TransportSession` over any `Connector` (`session`)
//! - WebSocket connector (feature: websocket)
//! - In-process loopback connector for tests and demos (feature: loopback)

pub mod protocol;
pub mod session;

#[cfg(feature = "websocket")]
pub mod websocket;

#[cfg(any(test, feature = "loopback"))]
pub mod loopback;

pub use protocol::{CloseInfo, Outbound, TransportError, TransportSignal};
pub use session::{Connector, Link, Signals, TransportSession};

#[cfg(feature = "websocket")]
pub use websocket::WsConnector;

#[cfg(any(test, feature = "loopback"))]
pub use loopback::{LoopbackConnector, LoopbackListener, RemotePeer};
