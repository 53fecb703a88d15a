//! Core model for the realtime task bridge.
//!
//! This crate provides the fundamental building blocks:
//! - `Command` / `TaskRequest` - Outbound commands and dispatch validation
//! - `InboundEvent` - Tagged events streamed back by the worker cluster
//! - `TaskRun` - Per-job lifecycle state machine
//! - `RunFeed` - Broadcast + history of run updates for late subscribers
//! - `HistoryRecord` / `HistoryStore` - Persistence boundary for finished jobs
//! - `BridgeConfig` and the `BridgeError` taxonomy

pub mod command;
pub mod config;
pub mod error;
pub mod event;
pub mod feed;
pub mod history;
pub mod run;

pub use command::{Command, Parameters, TaskKind, TaskRequest, ValidationError};
pub use config::{BridgeConfig, ConfigError, Environment};
pub use error::BridgeError;
pub use event::{DecodeError, FinishStatus, InboundEvent, LogStream, TaskFinished, TaskOutput};
pub use feed::{RunFeed, RunUpdate};
pub use history::{HistoryError, HistoryFilter, HistoryRecord, HistoryStore};
pub use run::{FailureReason, LogLine, RunId, RunStatus, TaskRun, Transition};
