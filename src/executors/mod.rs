//! Remote command executors
//!
//! Every protocol implements [`ProtocolDriver`]; the shared lifecycle around
//! it (deadlines, cancellation, reconnects, the single reply) lives in
//! [`unit::CommandUnit`].

pub mod ssh;
pub mod telnet;
pub mod unit;
pub mod winrm;

use crate::codec::DecodeError;
use crate::config::ExecutorConfig;
use crate::connection::Connection;
use crate::models::{CommandOutput, Protocol, StatusCode};
use crate::retry::RetryConfig;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Longest error text sent back to the caller for unexpected failures
const MAX_ERR_INFO_LEN: usize = 200;

/// Failure of a remote session, already classified
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecError {
    #[error("manual cancelled")]
    Cancelled,

    #[error("permission denied")]
    PermissionDenied,

    #[error("connection time out")]
    ConnectTimeout,

    #[error("hit eof time out")]
    CommandTimeout,

    /// Session dropped mid-flight; may be retried
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("{0}")]
    Decoding(String),

    #[error("{0}")]
    Other(String),
}

impl ExecError {
    pub fn status(&self) -> StatusCode {
        match self {
            ExecError::Cancelled => StatusCode::ManualCancelled,
            ExecError::PermissionDenied => StatusCode::PermissionDenied,
            ExecError::ConnectTimeout | ExecError::ConnectionLost(_) => {
                StatusCode::ConnectionTimeOut
            }
            ExecError::CommandTimeout => StatusCode::HitEofTimeOut,
            ExecError::Decoding(_) => StatusCode::ErrorDecoding,
            ExecError::Other(_) => StatusCode::UnknownError,
        }
    }

    /// Error text for the reply
    ///
    /// Unexpected errors are cut down to their first line.
    pub fn err_info(&self) -> String {
        match self {
            ExecError::Decoding(detail) => detail.clone(),
            ExecError::Other(detail) => abbreviate(detail),
            other => other.status().message().to_string(),
        }
    }
}

impl From<DecodeError> for ExecError {
    fn from(err: DecodeError) -> Self {
        ExecError::Decoding(err.to_string())
    }
}

fn abbreviate(detail: &str) -> String {
    let first_line = detail.lines().next().unwrap_or_default().trim();
    if first_line.chars().count() <= MAX_ERR_INFO_LEN {
        first_line.to_string()
    } else {
        let cut: String = first_line.chars().take(MAX_ERR_INFO_LEN).collect();
        format!("{}...", cut)
    }
}

/// Step of the session an error happened in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Connect,
    Command,
}

impl Phase {
    pub(crate) fn timeout(self) -> ExecError {
        match self {
            Phase::Connect => ExecError::ConnectTimeout,
            Phase::Command => ExecError::CommandTimeout,
        }
    }
}

/// One remote session speaking a specific protocol
#[async_trait]
pub trait ProtocolDriver: Send {
    /// Open and authenticate a session
    async fn connect(&mut self, timeout: Duration) -> Result<(), ExecError>;

    /// Run `cmd`, or the protocol keepalive when `None`
    ///
    /// Returns `None` when there is no output to record.
    async fn run_command(
        &mut self,
        cmd: Option<&str>,
        timeout: Duration,
    ) -> Result<Option<CommandOutput>, ExecError>;

    /// Release the session; never fails
    async fn close(&mut self);
}

/// Executor tuning shared by all units
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub connect_timeout: Duration,
    pub task_deadline: Duration,
    pub default_command_timeout: Duration,
    pub ssh_retry: RetryConfig,
    pub telnet_drain_pause: Duration,
    pub winrm_path: String,
    pub winrm_https: bool,
}

impl ExecutorSettings {
    /// Reconnect policy for a protocol; only SSH reconnects
    pub fn retry_policy(&self, protocol: Protocol) -> RetryConfig {
        match protocol {
            Protocol::Ssh => self.ssh_retry.clone(),
            Protocol::Winrm | Protocol::Telnet => RetryConfig::none(),
        }
    }
}

impl From<&ExecutorConfig> for ExecutorSettings {
    fn from(config: &ExecutorConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            task_deadline: config.task_deadline(),
            default_command_timeout: Duration::from_secs(config.default_command_timeout_secs),
            ssh_retry: RetryConfig::fixed(
                config.ssh_retries,
                Duration::from_secs(config.ssh_retry_delay_secs),
            ),
            telnet_drain_pause: config.telnet_drain_pause(),
            winrm_path: config.winrm_path.clone(),
            winrm_https: config.winrm_https,
        }
    }
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self::from(&ExecutorConfig::default())
    }
}

/// Build the driver for a connection's protocol
pub fn driver_for(
    connection: &Connection,
    encoding: Option<String>,
    settings: &ExecutorSettings,
) -> Box<dyn ProtocolDriver> {
    match connection.protocol() {
        Protocol::Ssh => Box::new(ssh::SshDriver::new(connection, encoding)),
        Protocol::Telnet => Box::new(telnet::TelnetDriver::new(
            connection,
            encoding,
            settings.telnet_drain_pause,
        )),
        Protocol::Winrm => Box::new(winrm::WinrmDriver::new(
            connection,
            encoding,
            &settings.winrm_path,
            settings.winrm_https,
        )),
    }
}
