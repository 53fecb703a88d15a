//! Task run state machine.
//!
//! ```text
//! Idle --dispatch--> Dispatching --sent / first log--> Running
//! Running --OTP_REQUIRED--> AwaitingOtp --OTP_RESPONSE--> Running
//! Running | AwaitingOtp --task_finished--> Succeeded | Failed
//! any active state --cancel / close / connect error--> Failed
//! ```
//!
//! A run becomes terminal at most once; every later event is ignored.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::command::{Parameters, TaskKind, TaskRequest, describe};
use crate::event::{FinishStatus, InboundEvent, LogStream, TaskFinished, TaskOutput};
use crate::history::HistoryRecord;
use crate::BridgeError;

/// Client-side identifier of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(Uuid);

impl RunId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Run status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Nothing dispatched yet.
    #[default]
    Idle,
    /// Waiting for the session and the command send.
    Dispatching,
    /// The worker asked for a one-time passcode.
    AwaitingOtp,
    /// Command sent; waiting for progress.
    Running,
    Succeeded,
    Failed,
}

impl RunStatus {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Dispatching | Self::AwaitingOtp | Self::Running)
    }
}

/// Why a run failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// The session never opened within the timeout.
    ConnectionTimeout,
    /// Socket-level error before or during open.
    TransportError { message: String },
    /// The link dropped without a local disconnect.
    UnexpectedClose { code: u16, reason: String },
    /// The worker or relay reported a failure.
    RemoteFailure { message: String },
    /// `task_finished` claimed success without a usable output reference.
    MissingOutput,
    /// The caller stopped the run.
    Cancelled,
    /// The session was closed locally by someone else.
    Disconnected,
    /// The command could not be sent.
    DispatchFailed { message: String },
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionTimeout => f.write_str("connection timed out"),
            Self::TransportError { message } => write!(f, "transport error: {message}"),
            Self::UnexpectedClose { code, reason } => {
                write!(f, "connection closed unexpectedly ({code}): {reason}")
            }
            Self::RemoteFailure { message } => write!(f, "remote failure: {message}"),
            Self::MissingOutput => f.write_str("finished without a usable output"),
            Self::Cancelled => f.write_str("cancelled"),
            Self::Disconnected => f.write_str("session disconnected"),
            Self::DispatchFailed { message } => write!(f, "dispatch failed: {message}"),
        }
    }
}

impl From<&BridgeError> for FailureReason {
    fn from(err: &BridgeError) -> Self {
        match err {
            BridgeError::ConnectionTimeout { .. } => Self::ConnectionTimeout,
            BridgeError::Transport(message) => Self::TransportError {
                message: message.clone(),
            },
            BridgeError::ConnectionAborted => Self::Cancelled,
            other => Self::DispatchFailed {
                message: other.to_string(),
            },
        }
    }
}

/// One line of worker output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    pub stream: LogStream,
    pub line: String,
}

/// Effect of feeding an event or action into a run.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// No state change (terminal run, foreign task id, unknown event).
    Ignored,
    /// The relay assigned a task id.
    Accepted(String),
    /// A log line was appended.
    Logged(LogLine),
    /// The run is waiting for a passcode.
    OtpRequested(String),
    /// Status changed without a terminal outcome.
    Status(RunStatus),
    Succeeded,
    Failed(FailureReason),
}

impl Transition {
    #[must_use]
    pub const fn is_change(&self) -> bool {
        !matches!(self, Self::Ignored)
    }

    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed(_))
    }
}

/// Client-side lifecycle of one dispatched job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskRun {
    pub id: RunId,
    pub task: Option<TaskKind>,
    /// Id assigned by the remote side, once echoed.
    pub task_id: Option<String>,
    pub status: RunStatus,
    pub log: Vec<LogLine>,
    pub parameters: Parameters,
    pub otp_prompt: Option<String>,
    pub output: Option<TaskOutput>,
    pub failure: Option<FailureReason>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskRun {
    /// Start a fresh run for a request, in `Dispatching`.
    #[must_use]
    pub fn dispatching(request: &TaskRequest) -> Self {
        Self {
            id: RunId::new(),
            task: Some(request.task().clone()),
            parameters: request.parameters().clone(),
            status: RunStatus::Dispatching,
            started_at: Some(Utc::now()),
            ..Self::default()
        }
    }

    /// Human-readable description of the job.
    #[must_use]
    pub fn description(&self) -> String {
        self.task.as_ref().map_or_else(String::new, |task| {
            describe(task, &self.parameters)
        })
    }

    /// The command went out: `Dispatching -> Running`.
    pub fn mark_sent(&mut self) -> Transition {
        if self.status == RunStatus::Dispatching {
            self.status = RunStatus::Running;
            Transition::Status(RunStatus::Running)
        } else {
            Transition::Ignored
        }
    }

    /// The passcode went out: `AwaitingOtp -> Running`.
    pub fn otp_submitted(&mut self) -> Transition {
        if self.status == RunStatus::AwaitingOtp {
            self.status = RunStatus::Running;
            self.otp_prompt = None;
            Transition::Status(RunStatus::Running)
        } else {
            Transition::Ignored
        }
    }

    /// Caller-initiated stop.
    pub fn cancel(&mut self) -> Transition {
        self.fail(FailureReason::Cancelled)
    }

    /// Move to `Failed` unless already terminal or never dispatched.
    pub fn fail(&mut self, reason: FailureReason) -> Transition {
        if !self.status.is_active() {
            return Transition::Ignored;
        }
        self.status = RunStatus::Failed;
        self.otp_prompt = None;
        self.failure = Some(reason.clone());
        self.finished_at = Some(Utc::now());
        Transition::Failed(reason)
    }

    /// Feed one inbound event into the run.
    pub fn apply(&mut self, event: &InboundEvent) -> Transition {
        if !self.status.is_active() {
            return Transition::Ignored;
        }
        if let Some(id) = event.task_id() {
            match &self.task_id {
                Some(own) if own != id => return Transition::Ignored,
                Some(_) => {}
                None => self.task_id = Some(id.to_string()),
            }
        }

        match event {
            InboundEvent::TaskAccepted { task_id, .. } => {
                self.mark_sent();
                Transition::Accepted(task_id.clone())
            }
            InboundEvent::TaskLog { stream, line, .. } => {
                self.mark_sent();
                let entry = LogLine {
                    stream: *stream,
                    line: line.clone(),
                };
                self.log.push(entry.clone());
                Transition::Logged(entry)
            }
            InboundEvent::OtpRequired { prompt, .. } => {
                self.status = RunStatus::AwaitingOtp;
                self.otp_prompt = Some(prompt.clone());
                Transition::OtpRequested(prompt.clone())
            }
            InboundEvent::TaskFinished(finished) => self.finish(finished),
            InboundEvent::ServerError { message } => self.fail(FailureReason::RemoteFailure {
                message: message.clone(),
            }),
            InboundEvent::Unknown { .. } => Transition::Ignored,
        }
    }

    fn finish(&mut self, finished: &TaskFinished) -> Transition {
        if finished.is_success() {
            self.status = RunStatus::Succeeded;
            self.otp_prompt = None;
            self.output = finished.output.clone();
            self.finished_at = Some(Utc::now());
            return Transition::Succeeded;
        }

        self.output = finished.output.clone();
        let reason = match finished.status {
            FinishStatus::Success => FailureReason::MissingOutput,
            FinishStatus::Failure | FinishStatus::Unknown => FailureReason::RemoteFailure {
                message: finished
                    .error
                    .clone()
                    .unwrap_or_else(|| "task reported failure".to_string()),
            },
        };
        self.fail(reason)
    }

    /// Result URL of a succeeded run.
    #[must_use]
    pub fn result_url(&self) -> Option<&str> {
        if self.status == RunStatus::Succeeded {
            self.output.as_ref().and_then(TaskOutput::usable_url)
        } else {
            None
        }
    }

    /// History record for a succeeded run.
    #[must_use]
    pub fn history_record(&self) -> Option<HistoryRecord> {
        let url = self.result_url()?;
        let task = self.task.as_ref()?;
        Some(HistoryRecord::new(
            task.history_type(),
            self.description(),
            url,
            self.parameters.clone(),
        ))
    }
}
