//! Inbound events streamed back over the bridge.
//!
//! Every text frame is decoded into an [`InboundEvent`]. Frames that are not
//! JSON objects, or that carry a known tag with the wrong shape, produce a
//! [`DecodeError`] and are dropped by the caller. Frames with an unknown tag
//! decode to [`InboundEvent::Unknown`] so new event types never break the
//! channel.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

const DEFAULT_OTP_PROMPT: &str = "OTP Required";
const DEFAULT_SERVER_ERROR: &str = "Remote error";

/// Output stream a log line came from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    #[default]
    Stdout,
    Stderr,
}

/// Status reported by a terminal event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinishStatus {
    Success,
    Failure,
    /// Missing or unrecognized status. Treated as a failure.
    #[default]
    #[serde(other)]
    Unknown,
}

/// Job output attached to a terminal event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskOutput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_url: Option<String>,
    /// Anything else the worker reported.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TaskOutput {
    /// The result URL, if present and non-blank.
    #[must_use]
    pub fn usable_url(&self) -> Option<&str> {
        self.public_url
            .as_deref()
            .filter(|url| !url.trim().is_empty())
    }
}

/// Terminal event for a job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskFinished {
    #[serde(default)]
    pub status: FinishStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<TaskOutput>,
    #[serde(default, alias = "message", skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskFinished {
    /// The result URL, if the worker reported a usable one.
    #[must_use]
    pub fn output_url(&self) -> Option<&str> {
        self.output.as_ref().and_then(TaskOutput::usable_url)
    }

    /// Success requires both the status and a usable output reference.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == FinishStatus::Success && self.output_url().is_some()
    }
}

/// Inbound event decoded from one text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    /// `TASK_LOG` - one line of worker output.
    TaskLog {
        stream: LogStream,
        line: String,
        task_id: Option<String>,
    },
    /// `OTP_REQUIRED` - the worker needs a one-time passcode.
    OtpRequired {
        prompt: String,
        task_id: Option<String>,
    },
    /// `TASK_ACCEPTED` - the relay assigned a task id to the dispatch.
    TaskAccepted {
        task_id: String,
        gpu_id: Option<String>,
    },
    /// `task_finished`, bare or inside a `TASK_RESULT` envelope.
    TaskFinished(TaskFinished),
    /// Untagged `{"status": "error", "message": ...}` from the relay.
    ServerError { message: String },
    /// Any other tag. Ignored by consumers.
    Unknown { kind: Option<String>, raw: Value },
}

/// Inbound frame could not be decoded.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Frame is not a JSON object")]
    NotAnObject,
    #[error("Malformed {kind} event: {source}")]
    Invalid {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Deserialize)]
struct LogFrame {
    #[serde(default)]
    stream: LogStream,
    line: String,
    #[serde(default)]
    task_id: Option<String>,
}

#[derive(Deserialize)]
struct PromptFrame {
    #[serde(default)]
    prompt: Option<String>,
    #[serde(default)]
    task_id: Option<String>,
}

#[derive(Deserialize)]
struct AcceptedFrame {
    task_id: String,
    #[serde(default)]
    gpu_id: Option<String>,
}

#[derive(Deserialize)]
struct ResultEnvelope {
    #[serde(default)]
    task_id: Option<String>,
    result: Value,
}

impl InboundEvent {
    /// Decode a raw text frame.
    ///
    /// # Errors
    /// Returns error if the frame is not a well-formed event.
    pub fn decode(raw: &str) -> Result<Self, DecodeError> {
        Self::from_value(serde_json::from_str(raw)?)
    }

    /// Decode an already-parsed JSON value.
    ///
    /// # Errors
    /// Returns error if the value is not a well-formed event.
    pub fn from_value(value: Value) -> Result<Self, DecodeError> {
        let Value::Object(map) = value else {
            return Err(DecodeError::NotAnObject);
        };
        let kind = map.get("type").and_then(Value::as_str).map(str::to_owned);

        match kind.as_deref() {
            Some("TASK_LOG") => {
                let frame: LogFrame = parse(map, "TASK_LOG")?;
                Ok(Self::TaskLog {
                    stream: frame.stream,
                    line: frame.line,
                    task_id: frame.task_id,
                })
            }
            Some("OTP_REQUIRED") => {
                let frame: PromptFrame = parse(map, "OTP_REQUIRED")?;
                let prompt = frame
                    .prompt
                    .filter(|p| !p.trim().is_empty())
                    .unwrap_or_else(|| DEFAULT_OTP_PROMPT.to_string());
                Ok(Self::OtpRequired {
                    prompt,
                    task_id: frame.task_id,
                })
            }
            Some("TASK_ACCEPTED") => {
                let frame: AcceptedFrame = parse(map, "TASK_ACCEPTED")?;
                Ok(Self::TaskAccepted {
                    task_id: frame.task_id,
                    gpu_id: frame.gpu_id,
                })
            }
            Some("task_finished") => Ok(Self::TaskFinished(parse(map, "task_finished")?)),
            Some("TASK_RESULT") => {
                let envelope: ResultEnvelope = parse(map, "TASK_RESULT")?;
                let mut finished: TaskFinished = serde_json::from_value(envelope.result)
                    .map_err(|source| DecodeError::Invalid {
                        kind: "TASK_RESULT",
                        source,
                    })?;
                if finished.task_id.is_none() {
                    finished.task_id = envelope.task_id;
                }
                Ok(Self::TaskFinished(finished))
            }
            None if map.get("status").and_then(Value::as_str) == Some("error") => {
                let message = map
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or(DEFAULT_SERVER_ERROR)
                    .to_string();
                Ok(Self::ServerError { message })
            }
            _ => Ok(Self::Unknown {
                kind,
                raw: Value::Object(map),
            }),
        }
    }

    /// Task id carried by the event, if any.
    #[must_use]
    pub fn task_id(&self) -> Option<&str> {
        match self {
            Self::TaskLog { task_id, .. } | Self::OtpRequired { task_id, .. } => task_id.as_deref(),
            Self::TaskAccepted { task_id, .. } => Some(task_id),
            Self::TaskFinished(finished) => finished.task_id.as_deref(),
            Self::ServerError { .. } | Self::Unknown { .. } => None,
        }
    }

    /// Short name for logging.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::TaskLog { .. } => "TASK_LOG",
            Self::OtpRequired { .. } => "OTP_REQUIRED",
            Self::TaskAccepted { .. } => "TASK_ACCEPTED",
            Self::TaskFinished(_) => "task_finished",
            Self::ServerError { .. } => "server_error",
            Self::Unknown { kind, .. } => kind.as_deref().unwrap_or("untagged"),
        }
    }

    #[must_use]
    pub const fn is_unknown(&self) -> bool {
        matches!(self, Self::Unknown { .. })
    }
}

fn parse<T: DeserializeOwned>(map: Map<String, Value>, kind: &'static str) -> Result<T, DecodeError> {
    serde_json::from_value(Value::Object(map)).map_err(|source| DecodeError::Invalid { kind, source })
}
