//! Telnet driver with a minimal option-refusing protocol codec
//!
//! Login is a plain prompt exchange: wait for `login:`, send the username,
//! wait for `Password:`, send the password. A banner containing
//! `Last login:` or `Last failed login:` marks a successful login, and the
//! last line of that banner is the shell prompt, which is later stripped from
//! command output.

use super::{ExecError, ProtocolDriver};
use crate::codec::render;
use crate::connection::Connection;
use crate::models::CommandOutput;
use async_trait::async_trait;
use regex::bytes::Regex;
use std::io;
use std::net::SocketAddr;
use std::sync::LazyLock;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info};

const USER_PROMPT: &[u8] = b"login:";
const PASSWORD_PROMPT: &[u8] = b"Password:";

/// How long a single read may wait before the buffer counts as drained
const READ_WINDOW: Duration = Duration::from_millis(100);

static LOGIN_SUCCESS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(Last login:|Last failed login:)").expect("valid login banner regex")
});

// Telnet command bytes
const IAC: u8 = 255;
const DONT: u8 = 254;
const DO: u8 = 253;
const WONT: u8 = 252;
const WILL: u8 = 251;
const SB: u8 = 250;
const SE: u8 = 240;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum CodecState {
    #[default]
    Data,
    Iac,
    Negotiate(u8),
    Sub,
    SubIac,
}

/// Strips Telnet commands from a byte stream and refuses every option
///
/// State survives across chunks so commands split between reads are handled.
#[derive(Debug, Default)]
pub struct TelnetCodec {
    state: CodecState,
}

impl TelnetCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append payload bytes of `input` to `data` and option refusals to `replies`
    pub fn decode(&mut self, input: &[u8], data: &mut Vec<u8>, replies: &mut Vec<u8>) {
        for &byte in input {
            self.state = match self.state {
                CodecState::Data if byte == IAC => CodecState::Iac,
                CodecState::Data => {
                    data.push(byte);
                    CodecState::Data
                }
                CodecState::Iac => match byte {
                    IAC => {
                        data.push(IAC);
                        CodecState::Data
                    }
                    DO | DONT | WILL | WONT => CodecState::Negotiate(byte),
                    SB => CodecState::Sub,
                    _ => CodecState::Data,
                },
                CodecState::Negotiate(verb) => {
                    match verb {
                        DO => replies.extend_from_slice(&[IAC, WONT, byte]),
                        WILL => replies.extend_from_slice(&[IAC, DONT, byte]),
                        _ => {}
                    }
                    CodecState::Data
                }
                CodecState::Sub if byte == IAC => CodecState::SubIac,
                CodecState::Sub => CodecState::Sub,
                CodecState::SubIac if byte == SE => CodecState::Data,
                CodecState::SubIac => CodecState::Sub,
            };
        }
    }
}

/// Escape literal 0xFF bytes for the wire
fn escape(line: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(line.len() + 1);
    for &byte in line {
        out.push(byte);
        if byte == IAC {
            out.push(IAC);
        }
    }
    out
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Logged-in Telnet session over any byte stream
pub struct TelnetSession<S> {
    stream: S,
    codec: TelnetCodec,
    pending: Vec<u8>,
    replies: Vec<u8>,
    prompt: Vec<u8>,
    drain_pause: Duration,
    eof: bool,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> TelnetSession<S> {
    pub fn new(stream: S, drain_pause: Duration) -> Self {
        Self {
            stream,
            codec: TelnetCodec::new(),
            pending: Vec::new(),
            replies: Vec::new(),
            prompt: Vec::new(),
            drain_pause,
            eof: false,
        }
    }

    /// Prompt echo captured at login
    pub fn prompt(&self) -> &[u8] {
        &self.prompt
    }

    /// Perform the login exchange
    pub async fn login(&mut self, username: &str, password: &str) -> Result<(), ExecError> {
        self.read_until(USER_PROMPT).await.map_err(io_error)?;
        self.send_line(username.as_bytes()).await.map_err(io_error)?;
        self.read_until(PASSWORD_PROMPT).await.map_err(io_error)?;
        self.send_line(password.as_bytes()).await.map_err(io_error)?;

        let banner = self.drain().await.map_err(io_error)?;
        if !LOGIN_SUCCESS.is_match(&banner) {
            debug!("Telnet login rejected");
            return Err(ExecError::PermissionDenied);
        }

        let last_line = banner.windows(2).rposition(|w| w == b"\r\n");
        self.prompt = match last_line {
            Some(pos) => banner[pos + 2..].to_vec(),
            None => banner,
        };
        Ok(())
    }

    /// Send `cmd` and collect its output without the trailing prompt
    pub async fn execute(&mut self, cmd: &str) -> Result<Vec<u8>, ExecError> {
        self.send_line(cmd.as_bytes()).await.map_err(io_error)?;
        let mut output = self.drain().await.map_err(io_error)?;

        if !self.prompt.is_empty() && output.ends_with(&self.prompt) {
            output.truncate(output.len() - self.prompt.len());
        }
        Ok(output)
    }

    pub async fn shutdown(&mut self) {
        let _ = self.stream.shutdown().await;
    }

    async fn send_line(&mut self, line: &[u8]) -> io::Result<()> {
        let mut bytes = escape(line);
        bytes.push(b'\n');
        self.stream.write_all(&bytes).await?;
        self.stream.flush().await
    }

    /// One read from the stream; returns the raw byte count, 0 on EOF
    async fn fill(&mut self) -> io::Result<usize> {
        let mut buf = [0u8; 4096];
        let n = self.stream.read(&mut buf).await?;
        if n == 0 {
            self.eof = true;
        } else {
            self.codec
                .decode(&buf[..n], &mut self.pending, &mut self.replies);
        }
        Ok(n)
    }

    async fn flush_replies(&mut self) -> io::Result<()> {
        if !self.replies.is_empty() {
            let replies = std::mem::take(&mut self.replies);
            self.stream.write_all(&replies).await?;
        }
        Ok(())
    }

    /// Read until `pattern` and consume everything up to and including it
    async fn read_until(&mut self, pattern: &[u8]) -> io::Result<Vec<u8>> {
        loop {
            if let Some(pos) = find(&self.pending, pattern) {
                let consumed: Vec<u8> = self.pending.drain(..pos + pattern.len()).collect();
                return Ok(consumed);
            }
            if self.fill().await? == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed before prompt",
                ));
            }
            self.flush_replies().await?;
        }
    }

    /// Read whatever arrives within the read window; returns payload bytes added
    async fn read_available(&mut self) -> io::Result<usize> {
        let before = self.pending.len();
        while !self.eof {
            match tokio::time::timeout(READ_WINDOW, self.fill()).await {
                Ok(Ok(_)) => self.flush_replies().await?,
                Ok(Err(e)) => return Err(e),
                Err(_) => break,
            }
        }
        Ok(self.pending.len() - before)
    }

    /// Collect output until a read after the pause finds nothing new
    async fn drain(&mut self) -> io::Result<Vec<u8>> {
        self.read_available().await?;
        while !self.eof {
            tokio::time::sleep(self.drain_pause).await;
            if self.read_available().await? == 0 {
                break;
            }
        }
        Ok(std::mem::take(&mut self.pending))
    }
}

/// Socket failures all surface as connection timeouts
fn io_error(err: io::Error) -> ExecError {
    debug!("Telnet I/O error: {}", err);
    ExecError::ConnectTimeout
}

pub struct TelnetDriver {
    addr: SocketAddr,
    username: String,
    password: String,
    encoding: Option<String>,
    drain_pause: Duration,
    session: Option<TelnetSession<TcpStream>>,
}

impl TelnetDriver {
    pub fn new(connection: &Connection, encoding: Option<String>, drain_pause: Duration) -> Self {
        Self {
            addr: SocketAddr::from((connection.ip(), connection.port())),
            username: connection.account().username().to_string(),
            password: connection.account().password().to_string(),
            encoding,
            drain_pause,
            session: None,
        }
    }
}

#[async_trait]
impl ProtocolDriver for TelnetDriver {
    async fn connect(&mut self, _timeout: Duration) -> Result<(), ExecError> {
        let stream = TcpStream::connect(self.addr).await.map_err(io_error)?;
        let mut session = TelnetSession::new(stream, self.drain_pause);
        session.login(&self.username, &self.password).await?;

        info!("Telnet session established to {}", self.addr);
        self.session = Some(session);
        Ok(())
    }

    async fn run_command(
        &mut self,
        cmd: Option<&str>,
        _timeout: Duration,
    ) -> Result<Option<CommandOutput>, ExecError> {
        let Some(cmd) = cmd else {
            return Ok(None);
        };
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| ExecError::Other("Telnet session is not connected".to_string()))?;

        let output = session.execute(cmd).await?;
        Ok(Some(CommandOutput {
            stdout: render(&output, self.encoding.as_deref())?,
            stderr: String::new(),
            returncode: None,
        }))
    }

    async fn close(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.shutdown().await;
            debug!("Telnet session to {} closed", self.addr);
        }
    }
}
