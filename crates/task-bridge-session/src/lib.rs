//! Session orchestration for the realtime task bridge.
//!
//! Provides:
//! - `SessionController` - Connection lifecycle over one transport session
//! - `dispatcher` - Command encoding onto the open session
//! - `Demultiplexer` - Inbound frame decoding and fan-out
//! - `TaskRunner` - Drives one task run end-to-end
//! - History storage implementations (memory, JSON file)

pub mod controller;
pub mod demux;
pub mod dispatcher;
pub mod runner;
pub mod storage;

#[cfg(test)]
mod testing;

pub use controller::{SessionController, SessionState};
pub use demux::{BridgeEvent, CloseCause, Demultiplexer, Routed, SessionClosed, Subscription};
pub use runner::TaskRunner;
