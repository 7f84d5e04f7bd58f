//! SSH driver using password authentication
//!
//! libssh2 is blocking, so every session step runs on the runtime's blocking
//! pool. The session keeps its own socket timeout as a backstop for the async
//! deadlines applied by the unit.

use super::{ExecError, Phase, ProtocolDriver};
use crate::codec::decode_strict;
use crate::connection::Connection;
use crate::models::CommandOutput;
use async_trait::async_trait;
use ssh2::{Channel, ErrorCode, Session};
use std::io::{self, Read};
use std::net::{SocketAddr, TcpStream};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Command run when a task carries no command
const KEEPALIVE_COMMAND: &str = "exit";

const STDOUT_STREAM: i32 = 0;
const STDERR_STREAM: i32 = 1;
const READ_CHUNK: usize = 16 * 1024;
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

const DEFAULT_ENCODING: &str = "utf-8";

// libssh2 session error codes
const LIBSSH2_ERROR_SOCKET_NONE: i32 = -1;
const LIBSSH2_ERROR_SOCKET_SEND: i32 = -7;
const LIBSSH2_ERROR_TIMEOUT: i32 = -9;
const LIBSSH2_ERROR_SOCKET_DISCONNECT: i32 = -13;
const LIBSSH2_ERROR_PASSWORD_EXPIRED: i32 = -15;
const LIBSSH2_ERROR_AUTHENTICATION_FAILED: i32 = -18;
const LIBSSH2_ERROR_PUBLICKEY_UNVERIFIED: i32 = -19;
const LIBSSH2_ERROR_SOCKET_RECV: i32 = -43;

pub struct SshDriver {
    addr: SocketAddr,
    username: String,
    password: String,
    encoding: Option<String>,
    session: Option<Session>,
}

impl SshDriver {
    pub fn new(connection: &Connection, encoding: Option<String>) -> Self {
        Self {
            addr: SocketAddr::from((connection.ip(), connection.port())),
            username: connection.account().username().to_string(),
            password: connection.account().password().to_string(),
            encoding,
            session: None,
        }
    }
}

#[async_trait]
impl ProtocolDriver for SshDriver {
    async fn connect(&mut self, timeout: Duration) -> Result<(), ExecError> {
        let addr = self.addr;
        let username = self.username.clone();
        let password = self.password.clone();

        let session = tokio::task::spawn_blocking(move || {
            create_session(addr, &username, &password, timeout)
        })
        .await
        .map_err(|e| ExecError::Other(format!("SSH worker failed: {}", e)))??;

        info!("SSH session established to {}", self.addr);
        self.session = Some(session);
        Ok(())
    }

    async fn run_command(
        &mut self,
        cmd: Option<&str>,
        timeout: Duration,
    ) -> Result<Option<CommandOutput>, ExecError> {
        let session = self
            .session
            .clone()
            .ok_or_else(|| ExecError::Other("SSH session is not connected".to_string()))?;
        let command = cmd.unwrap_or(KEEPALIVE_COMMAND).to_string();

        let (stdout, stderr, returncode) =
            tokio::task::spawn_blocking(move || exec_blocking(&session, &command, timeout))
                .await
                .map_err(|e| ExecError::Other(format!("SSH worker failed: {}", e)))??;

        if cmd.is_none() {
            return Ok(None);
        }

        let label = self.encoding.as_deref().unwrap_or(DEFAULT_ENCODING);
        Ok(Some(CommandOutput {
            stdout: decode_strict(&stdout, label)?,
            stderr: decode_strict(&stderr, label)?,
            returncode: Some(returncode),
        }))
    }

    async fn close(&mut self) {
        if let Some(session) = self.session.take() {
            let _ = tokio::task::spawn_blocking(move || {
                let _ = session.disconnect(None, "closing", None);
            })
            .await;
            debug!("SSH session to {} closed", self.addr);
        }
    }
}

fn create_session(
    addr: SocketAddr,
    username: &str,
    password: &str,
    timeout: Duration,
) -> Result<Session, ExecError> {
    debug!("Creating SSH session to {}", addr);

    let tcp = TcpStream::connect_timeout(&addr, timeout)
        .map_err(|e| map_io_error(&e, Phase::Connect))?;

    let mut session = Session::new().map_err(|e| map_ssh_error(&e, Phase::Connect))?;
    session.set_timeout(timeout.as_millis().min(u32::MAX as u128) as u32);
    session.set_tcp_stream(tcp);
    session
        .handshake()
        .map_err(|e| map_ssh_error(&e, Phase::Connect))?;

    session
        .userauth_password(username, password)
        .map_err(|e| map_ssh_error(&e, Phase::Connect))?;
    if !session.authenticated() {
        return Err(ExecError::PermissionDenied);
    }

    Ok(session)
}

fn exec_blocking(
    session: &Session,
    command: &str,
    timeout: Duration,
) -> Result<(Vec<u8>, Vec<u8>, i32), ExecError> {
    session.set_timeout(timeout.as_millis().min(u32::MAX as u128) as u32);

    let mut channel = session
        .channel_session()
        .map_err(|e| map_ssh_error(&e, Phase::Command))?;
    channel
        .exec(command)
        .map_err(|e| map_ssh_error(&e, Phase::Command))?;

    session.set_blocking(false);
    let drained = drain_output(&mut channel, Instant::now() + timeout);
    session.set_blocking(true);
    let (stdout, stderr) = drained?;

    channel
        .wait_close()
        .map_err(|e| map_ssh_error(&e, Phase::Command))?;
    let exit_code = channel
        .exit_status()
        .map_err(|e| map_ssh_error(&e, Phase::Command))?;

    debug!("SSH command exit code: {}", exit_code);
    Ok((stdout, stderr, exit_code))
}

/// The two output streams of an exec channel, read without blocking
trait OutputStreams {
    fn read_stream(&mut self, stream_id: i32, buf: &mut [u8]) -> io::Result<usize>;
    fn at_eof(&self) -> bool;
}

impl OutputStreams for Channel {
    fn read_stream(&mut self, stream_id: i32, buf: &mut [u8]) -> io::Result<usize> {
        self.stream(stream_id).read(buf)
    }

    fn at_eof(&self) -> bool {
        self.eof()
    }
}

/// Read stdout and stderr in turn until the remote side sends EOF
///
/// Either stream filling the channel window would otherwise stall the other.
fn drain_output(
    streams: &mut impl OutputStreams,
    deadline: Instant,
) -> Result<(Vec<u8>, Vec<u8>), ExecError> {
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut buf = [0u8; READ_CHUNK];

    loop {
        let mut progressed = false;
        for (stream_id, sink) in [(STDOUT_STREAM, &mut stdout), (STDERR_STREAM, &mut stderr)] {
            match streams.read_stream(stream_id, &mut buf) {
                Ok(0) => {}
                Ok(n) => {
                    sink.extend_from_slice(&buf[..n]);
                    progressed = true;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(map_io_error(&e, Phase::Command)),
            }
        }

        if progressed {
            continue;
        }
        if streams.at_eof() {
            return Ok((stdout, stderr));
        }
        if Instant::now() >= deadline {
            return Err(ExecError::CommandTimeout);
        }
        std::thread::sleep(DRAIN_POLL_INTERVAL);
    }
}

pub(crate) fn map_ssh_error(err: &ssh2::Error, phase: Phase) -> ExecError {
    match err.code() {
        ErrorCode::Session(
            LIBSSH2_ERROR_AUTHENTICATION_FAILED
            | LIBSSH2_ERROR_PUBLICKEY_UNVERIFIED
            | LIBSSH2_ERROR_PASSWORD_EXPIRED,
        ) => ExecError::PermissionDenied,
        ErrorCode::Session(LIBSSH2_ERROR_TIMEOUT) => phase.timeout(),
        ErrorCode::Session(
            LIBSSH2_ERROR_SOCKET_DISCONNECT
            | LIBSSH2_ERROR_SOCKET_RECV
            | LIBSSH2_ERROR_SOCKET_SEND
            | LIBSSH2_ERROR_SOCKET_NONE,
        ) => ExecError::ConnectionLost(err.message().to_string()),
        _ => ExecError::Other(format!("SSH error: {}", err)),
    }
}

pub(crate) fn map_io_error(err: &io::Error, phase: Phase) -> ExecError {
    match err.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => phase.timeout(),
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::UnexpectedEof => ExecError::ConnectionLost(err.to_string()),
        _ => ExecError::Other(format!("SSH I/O error: {}", err)),
    }
}
