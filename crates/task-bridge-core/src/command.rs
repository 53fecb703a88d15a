//! Outbound commands and dispatch-time validation.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Opaque job parameters. The bridge never interprets them beyond
/// required-field validation and the history prompt.
pub type Parameters = Map<String, Value>;

/// Parameter keys used as the human-readable description of a job.
const DESCRIPTION_KEYS: [&str; 2] = ["prompt", "description"];

/// Task kind tag understood by the worker cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskKind(String);

impl TaskKind {
    pub const VIDEO_GENERATION: &'static str = "VIDEO_GENERATION";
    pub const IMAGE_GENERATION: &'static str = "IMAGE_GENERATION";
    pub const AMAZON_POLLUTION: &'static str = "AMAZON_POLLUTION";

    #[must_use]
    pub fn new(kind: impl Into<String>) -> Self {
        Self(kind.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The `type` written into history records for this kind.
    #[must_use]
    pub fn history_type(&self) -> String {
        match self.0.as_str() {
            Self::VIDEO_GENERATION => "video".to_string(),
            Self::IMAGE_GENERATION => "image".to_string(),
            other => other.to_ascii_lowercase(),
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskKind {
    fn from(kind: &str) -> Self {
        Self::new(kind)
    }
}

impl From<String> for TaskKind {
    fn from(kind: String) -> Self {
        Self(kind)
    }
}

/// Locally detected problem with a command. Never sent upstream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Task kind is empty")]
    EmptyTask,
    #[error("Required parameter '{0}' is empty")]
    MissingField(String),
    #[error("One-time passcode is empty")]
    EmptyOtp,
}

/// Message from client to worker cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Command {
    /// Dispatch a job.
    #[serde(rename = "TASK_EXECUTION")]
    TaskExecution {
        task: TaskKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
        timestamp: DateTime<Utc>,
        parameters: Parameters,
    },
    /// Answer an `OTP_REQUIRED` prompt.
    #[serde(rename = "OTP_RESPONSE")]
    OtpResponse { otp: String },
}

impl Command {
    /// Build an OTP response from user input.
    ///
    /// # Errors
    /// Returns `ValidationError::EmptyOtp` if the code is blank.
    pub fn otp_response(code: &str) -> Result<Self, ValidationError> {
        let otp = code.trim();
        if otp.is_empty() {
            return Err(ValidationError::EmptyOtp);
        }
        Ok(Self::OtpResponse {
            otp: otp.to_string(),
        })
    }

    /// Wire tag of this command.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::TaskExecution { .. } => "TASK_EXECUTION",
            Self::OtpResponse { .. } => "OTP_RESPONSE",
        }
    }

    /// Encode as a single self-contained JSON text frame.
    ///
    /// # Errors
    /// Returns error if a parameter value cannot be serialized.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// A job the caller wants dispatched, before it becomes a `Command`.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRequest {
    task: TaskKind,
    parameters: Parameters,
    required: Vec<String>,
    token: Option<String>,
}

impl TaskRequest {
    /// Create a request with no parameters.
    #[must_use]
    pub fn new(task: impl Into<TaskKind>) -> Self {
        Self {
            task: task.into(),
            parameters: Parameters::new(),
            required: Vec::new(),
            token: None,
        }
    }

    /// Set one parameter.
    #[must_use]
    pub fn param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// Replace all parameters.
    #[must_use]
    pub fn with_parameters(mut self, parameters: Parameters) -> Self {
        self.parameters = parameters;
        self
    }

    /// Mark parameters that must be present and non-empty.
    #[must_use]
    pub fn require<I>(mut self, fields: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.required.extend(fields.into_iter().map(Into::into));
        self
    }

    /// Attach the caller's bearer token.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    #[must_use]
    pub const fn task(&self) -> &TaskKind {
        &self.task
    }

    #[must_use]
    pub const fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    #[must_use]
    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    /// Human-readable description: the `prompt` or `description`
    /// parameter, falling back to the task kind.
    #[must_use]
    pub fn description(&self) -> String {
        describe(&self.task, &self.parameters)
    }

    /// Check the task kind and every required parameter.
    ///
    /// # Errors
    /// Returns the first problem found.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.task.as_str().trim().is_empty() {
            return Err(ValidationError::EmptyTask);
        }
        for field in &self.required {
            if self.parameters.get(field).is_none_or(is_blank) {
                return Err(ValidationError::MissingField(field.clone()));
            }
        }
        Ok(())
    }

    /// Validate and stamp a `TASK_EXECUTION` command.
    ///
    /// # Errors
    /// Returns error if validation fails.
    pub fn to_command(&self) -> Result<Command, ValidationError> {
        self.validate()?;
        Ok(Command::TaskExecution {
            task: self.task.clone(),
            token: self.token.clone(),
            timestamp: Utc::now(),
            parameters: self.parameters.clone(),
        })
    }
}

pub(crate) fn describe(task: &TaskKind, parameters: &Parameters) -> String {
    DESCRIPTION_KEYS
        .iter()
        .filter_map(|key| parameters.get(*key).and_then(Value::as_str))
        .find(|s| !s.trim().is_empty())
        .map_or_else(|| task.to_string(), str::to_string)
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}
