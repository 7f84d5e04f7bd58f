//! Core data models for the remexec agent

use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of work carried by an inbound message
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    Info,
    Detect,
    Gather,
    Scan,
    Site,
    Unknown,
}

impl TaskType {
    /// Parse the wire name of a task type. Unrecognized names yield `None`.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "info" => Some(TaskType::Info),
            "detect" => Some(TaskType::Detect),
            "gather" => Some(TaskType::Gather),
            "scan" => Some(TaskType::Scan),
            "site" => Some(TaskType::Site),
            "unknown" => Some(TaskType::Unknown),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Info => "info",
            TaskType::Detect => "detect",
            TaskType::Gather => "gather",
            TaskType::Scan => "scan",
            TaskType::Site => "site",
            TaskType::Unknown => "unknown",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Remote access protocol of a gather target
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Ssh,
    Winrm,
    Telnet,
}

impl Protocol {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ssh" => Some(Protocol::Ssh),
            "winrm" => Some(Protocol::Winrm),
            "telnet" => Some(Protocol::Telnet),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Ssh => "ssh",
            Protocol::Winrm => "winrm",
            Protocol::Telnet => "telnet",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome code carried in every command reply
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(into = "i32", try_from = "i32")]
pub enum StatusCode {
    Success,
    ConnectionTimeOut,
    PermissionDenied,
    ManualCancelled,
    HitEofTimeOut,
    ErrorDecoding,
    AuthenticatedFailed,
    UnknownError,
}

impl StatusCode {
    pub fn code(&self) -> i32 {
        match self {
            StatusCode::Success => 0,
            StatusCode::ConnectionTimeOut => -1,
            StatusCode::PermissionDenied => -2,
            StatusCode::ManualCancelled => -3,
            StatusCode::HitEofTimeOut => -4,
            StatusCode::ErrorDecoding => -5,
            StatusCode::AuthenticatedFailed => -6,
            StatusCode::UnknownError => -999,
        }
    }

    /// Human readable message paired with the code
    pub fn message(&self) -> &'static str {
        match self {
            StatusCode::Success => "success",
            StatusCode::ConnectionTimeOut => "connection time out",
            StatusCode::PermissionDenied => "permission denied",
            StatusCode::ManualCancelled => "manual cancelled",
            StatusCode::HitEofTimeOut => "hit eof time out",
            StatusCode::ErrorDecoding => "error decoding",
            StatusCode::AuthenticatedFailed => "authenticated failed",
            StatusCode::UnknownError => "unknown error",
        }
    }

    pub fn is_success(&self) -> bool {
        self.code() >= 0
    }
}

impl From<StatusCode> for i32 {
    fn from(code: StatusCode) -> Self {
        code.code()
    }
}

impl TryFrom<i32> for StatusCode {
    type Error = String;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(StatusCode::Success),
            -1 => Ok(StatusCode::ConnectionTimeOut),
            -2 => Ok(StatusCode::PermissionDenied),
            -3 => Ok(StatusCode::ManualCancelled),
            -4 => Ok(StatusCode::HitEofTimeOut),
            -5 => Ok(StatusCode::ErrorDecoding),
            -6 => Ok(StatusCode::AuthenticatedFailed),
            -999 => Ok(StatusCode::UnknownError),
            other => Err(format!("unknown status code {}", other)),
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message(), self.code())
    }
}

/// Current wall clock as Unix epoch seconds
pub fn epoch_seconds() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Reply published for every gather task
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandResult {
    pub id: Option<String>,
    pub cmd: String,
    pub encoding: String,
    pub stdout: String,
    pub stderr: String,
    pub returncode: Option<i32>,
    pub code: StatusCode,
    pub err_info: String,
    pub start_time: f64,
    pub end_time: f64,
}

impl CommandResult {
    /// Synthetic reply for a task that never reached an executor
    pub fn rejected(id: Option<String>, encoding: Option<&str>, err_info: impl Into<String>) -> Self {
        let now = epoch_seconds();
        Self {
            id,
            cmd: String::new(),
            encoding: encoding.unwrap_or_default().to_string(),
            stdout: String::new(),
            stderr: String::new(),
            returncode: None,
            code: StatusCode::AuthenticatedFailed,
            err_info: err_info.into(),
            start_time: now,
            end_time: now,
        }
    }
}

/// Captured output of one remote command, already rendered for the wire
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub returncode: Option<i32>,
}

/// Mutable result state owned by a single command unit
///
/// Filled in while the unit runs and turned into an immutable
/// [`CommandResult`] exactly once by [`CommandResultBuilder::finish`].
#[derive(Debug, Clone)]
pub struct CommandResultBuilder {
    id: Option<String>,
    cmd: String,
    encoding: Option<String>,
    stdout: String,
    stderr: String,
    returncode: Option<i32>,
    code: StatusCode,
    err_info: String,
    start_time: Option<f64>,
}

impl CommandResultBuilder {
    pub fn new(id: Option<String>, cmd: impl Into<String>, encoding: Option<String>) -> Self {
        Self {
            id,
            cmd: cmd.into(),
            encoding,
            stdout: String::new(),
            stderr: String::new(),
            returncode: None,
            code: StatusCode::Success,
            err_info: String::new(),
            start_time: None,
        }
    }

    pub fn start(&mut self) {
        self.start_time = Some(epoch_seconds());
    }

    /// Record captured output
    ///
    /// A negative return code overrides the status with `UnknownError`.
    pub fn output(&mut self, output: CommandOutput) {
        self.stdout = output.stdout;
        self.stderr = output.stderr;
        self.returncode = output.returncode;
        if matches!(output.returncode, Some(rc) if rc < 0) {
            self.fail(
                StatusCode::UnknownError,
                StatusCode::UnknownError.message(),
            );
        }
    }

    pub fn fail(&mut self, code: StatusCode, err_info: impl Into<String>) {
        self.code = code;
        self.err_info = err_info.into();
    }

    pub fn status(&self) -> StatusCode {
        self.code
    }

    pub fn finish(self) -> CommandResult {
        let end_time = epoch_seconds();
        CommandResult {
            id: self.id,
            cmd: self.cmd,
            encoding: self.encoding.unwrap_or_default(),
            stdout: self.stdout,
            stderr: self.stderr,
            returncode: self.returncode,
            code: self.code,
            err_info: self.err_info,
            start_time: self.start_time.unwrap_or(end_time),
            end_time,
        }
    }
}

/// Reply published for info tasks
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskResult {
    pub id: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    #[serde(rename = "result")]
    pub payload: serde_json::Value,
    pub extra: serde_json::Value,
    pub start_time: Option<f64>,
    pub end_time: Option<f64>,
}

impl TaskResult {
    pub fn new(id: impl Into<String>, task_type: TaskType, extra: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            task_type,
            payload: serde_json::Value::Null,
            extra,
            start_time: None,
            end_time: None,
        }
    }
}
