//! Error types for remexec

use thiserror::Error;

/// remexec error types
#[derive(Error, Debug)]
pub enum AgentError {
    /// Inbound task failed structural validation
    #[error("{0}")]
    Validation(String),

    /// Invalid IP literal in a connection descriptor
    #[error("Invalid ip: {0}")]
    InvalidIp(String),

    /// IPv6 targets are rejected
    #[error("Not support ipv6 yet: {0}")]
    Ipv6Unsupported(String),

    /// Invalid port in a connection descriptor
    #[error("Invalid port: {0}")]
    InvalidPort(String),

    /// Unknown remote protocol
    #[error("No support protocol {0}")]
    UnsupportedProtocol(String),

    /// Malformed reply address
    #[error("Invalid reply_to '{0}': expected <exchange>/<routing_key>")]
    InvalidReplyTarget(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// JSON (de)serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Broker errors
    #[error("Broker error: {0}")]
    Broker(String),

    /// Scheduled unit lookup failed
    #[error("Task {0} does not exist")]
    NotFound(String),

    /// A live unit already holds the name
    #[error("Task {0} already exists")]
    AlreadyExists(String),

    /// Scheduler run-loop is no longer running
    #[error("Scheduler is stopped")]
    SchedulerStopped,

    /// Generic error
    #[error("Error: {0}")]
    Other(String),
}

/// Result type alias using AgentError
pub type Result<T> = std::result::Result<T, AgentError>;

impl From<lapin::Error> for AgentError {
    fn from(err: lapin::Error) -> Self {
        AgentError::Broker(err.to_string())
    }
}
