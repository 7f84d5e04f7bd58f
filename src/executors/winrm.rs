//! WinRM driver speaking WS-Management over HTTP
//!
//! A session is one remote `cmd` shell: connect creates it, each command is
//! run inside it and polled with `Receive` until the command reports `Done`,
//! close deletes it.

use super::{ExecError, Phase, ProtocolDriver};
use crate::codec::render;
use crate::connection::Connection;
use crate::models::CommandOutput;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use regex::Regex;
use reqwest::{Client, StatusCode};
use std::sync::LazyLock;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Command run when a task carries no command
const KEEPALIVE_COMMAND: &str = "echo test";

const SOAP_CONTENT_TYPE: &str = "application/soap+xml;charset=UTF-8";

/// How long the server may hold a `Receive` open before faulting with TimedOut
const OPERATION_TIMEOUT: Duration = Duration::from_secs(20);

/// Extra client-side slack on top of the operation timeout
const READ_SLACK: Duration = Duration::from_secs(10);

const SHELL_RESOURCE: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/cmd";
const ACTION_CREATE: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Create";
const ACTION_DELETE: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Delete";
const ACTION_COMMAND: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Command";
const ACTION_RECEIVE: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Receive";
const ACTION_SIGNAL: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Signal";
const SIGNAL_TERMINATE: &str =
    "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/signal/terminate";

static SHELL_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?:<(?:\w+:)?ShellId>|Name="ShellId">)\s*([^<\s]+)\s*<"#)
        .expect("valid shell id regex")
});

static COMMAND_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<(?:\w+:)?CommandId>\s*([^<\s]+)\s*<").expect("valid command id regex")
});

static STREAM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<(?:\w+:)?Stream\s+Name="(stdout|stderr)"[^>]*?>([^<]*)<"#)
        .expect("valid stream regex")
});

static COMMAND_DONE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"CommandState\s[^>]*State="[^"]*CommandState/Done""#)
        .expect("valid command state regex")
});

static EXIT_CODE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<(?:\w+:)?ExitCode>\s*(-?\d+)\s*<").expect("valid exit code regex")
});

fn xml_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            other => out.push(other),
        }
    }
    out
}

/// Wrap a body in a WS-Man envelope addressed to `endpoint`
fn envelope(endpoint: &str, action: &str, shell_id: Option<&str>, options: &str, body: &str) -> String {
    let selector = shell_id
        .map(|id| {
            format!(
                r#"<w:SelectorSet><w:Selector Name="ShellId">{}</w:Selector></w:SelectorSet>"#,
                id
            )
        })
        .unwrap_or_default();

    format!(
        concat!(
            r#"<?xml version="1.0" encoding="utf-8"?>"#,
            r#"<env:Envelope xmlns:env="http://www.w3.org/2003/05/soap-envelope" "#,
            r#"xmlns:a="http://schemas.xmlsoap.org/ws/2004/08/addressing" "#,
            r#"xmlns:w="http://schemas.dmtf.org/wbem/wsman/1/wsman.xsd" "#,
            r#"xmlns:rsp="http://schemas.microsoft.com/wbem/wsman/1/windows/shell">"#,
            "<env:Header>",
            "<a:To>{endpoint}</a:To>",
            r#"<a:ReplyTo><a:Address mustUnderstand="true">"#,
            "http://schemas.xmlsoap.org/ws/2004/08/addressing/role/anonymous",
            "</a:Address></a:ReplyTo>",
            r#"<w:MaxEnvelopeSize mustUnderstand="true">153600</w:MaxEnvelopeSize>"#,
            "<a:MessageID>uuid:{message_id}</a:MessageID>",
            r#"<w:Locale xml:lang="en-US" mustUnderstand="false"/>"#,
            "<w:OperationTimeout>PT{timeout}S</w:OperationTimeout>",
            r#"<w:ResourceURI mustUnderstand="true">{resource}</w:ResourceURI>"#,
            r#"<a:Action mustUnderstand="true">{action}</a:Action>"#,
            "{selector}{options}",
            "</env:Header>",
            "<env:Body>{body}</env:Body>",
            "</env:Envelope>"
        ),
        endpoint = endpoint,
        message_id = Uuid::new_v4().to_string().to_uppercase(),
        timeout = OPERATION_TIMEOUT.as_secs(),
        resource = SHELL_RESOURCE,
        action = action,
        selector = selector,
        options = options,
        body = body,
    )
}

/// Buffered output of one remote command
#[derive(Debug, Default)]
struct RawOutput {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    exit_code: Option<i32>,
    done: bool,
}

impl RawOutput {
    fn absorb(&mut self, response: &str) -> Result<(), ExecError> {
        for caps in STREAM.captures_iter(response) {
            let chunk = caps[2].trim();
            if chunk.is_empty() {
                continue;
            }
            let bytes = STANDARD
                .decode(chunk)
                .map_err(|e| ExecError::Other(format!("Malformed WinRM stream: {}", e)))?;
            match &caps[1] {
                "stdout" => self.stdout.extend_from_slice(&bytes),
                _ => self.stderr.extend_from_slice(&bytes),
            }
        }

        if COMMAND_DONE.is_match(response) {
            self.done = true;
            self.exit_code = EXIT_CODE
                .captures(response)
                .and_then(|caps| caps[1].parse().ok());
        }
        Ok(())
    }
}

fn capture(regex: &Regex, response: &str, what: &str) -> Result<String, ExecError> {
    regex
        .captures(response)
        .map(|caps| caps[1].to_string())
        .ok_or_else(|| ExecError::Other(format!("WinRM response carries no {}", what)))
}

fn map_http_error(err: reqwest::Error, phase: Phase) -> ExecError {
    if err.is_timeout() {
        return phase.timeout();
    }
    let detail = err.to_string();
    if detail.contains("Connection lost") {
        return ExecError::ConnectTimeout;
    }
    ExecError::Other(format!("WinRM request failed: {}", detail))
}

pub struct WinrmDriver {
    endpoint: String,
    username: String,
    password: String,
    encoding: Option<String>,
    client: Option<Client>,
    shell_id: Option<String>,
}

impl WinrmDriver {
    pub fn new(connection: &Connection, encoding: Option<String>, path: &str, https: bool) -> Self {
        let scheme = if https { "https" } else { "http" };
        Self {
            endpoint: format!("{}://{}{}", scheme, connection.target(), path),
            username: connection.account().username().to_string(),
            password: connection.account().password().to_string(),
            encoding,
            client: None,
            shell_id: None,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// POST one envelope; a TimedOut fault on a receive yields `Ok(None)`
    async fn post(&self, body: String, timeout: Duration, phase: Phase) -> Result<Option<String>, ExecError> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| ExecError::Other("WinRM session is not connected".to_string()))?;

        let response = client
            .post(&self.endpoint)
            .basic_auth(&self.username, Some(&self.password))
            .header(reqwest::header::CONTENT_TYPE, SOAP_CONTENT_TYPE)
            .timeout(timeout)
            .body(body)
            .send()
            .await
            .map_err(|e| map_http_error(e, phase))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| map_http_error(e, phase))?;

        match status {
            s if s.is_success() => Ok(Some(text)),
            StatusCode::UNAUTHORIZED => Err(ExecError::PermissionDenied),
            StatusCode::INTERNAL_SERVER_ERROR if text.contains("TimedOut") => Ok(None),
            s => Err(ExecError::Other(format!(
                "WinRM endpoint {} answered {}",
                self.endpoint, s
            ))),
        }
    }

    async fn open_shell(&self, timeout: Duration) -> Result<String, ExecError> {
        let options = concat!(
            "<w:OptionSet>",
            r#"<w:Option Name="WINRS_NOPROFILE">FALSE</w:Option>"#,
            r#"<w:Option Name="WINRS_CODEPAGE">437</w:Option>"#,
            "</w:OptionSet>"
        );
        let body = concat!(
            "<rsp:Shell>",
            "<rsp:InputStreams>stdin</rsp:InputStreams>",
            "<rsp:OutputStreams>stdout stderr</rsp:OutputStreams>",
            "</rsp:Shell>"
        );
        let request = envelope(&self.endpoint, ACTION_CREATE, None, options, body);

        let response = self
            .post(request, timeout, Phase::Connect)
            .await?
            .ok_or(ExecError::ConnectTimeout)?;
        capture(&SHELL_ID, &response, "ShellId")
    }

    async fn execute(&self, shell_id: &str, cmd: &str) -> Result<RawOutput, ExecError> {
        let options = concat!(
            "<w:OptionSet>",
            r#"<w:Option Name="WINRS_CONSOLEMODE_STDIN">TRUE</w:Option>"#,
            r#"<w:Option Name="WINRS_SKIP_CMD_SHELL">FALSE</w:Option>"#,
            "</w:OptionSet>"
        );
        let body = format!(
            "<rsp:CommandLine><rsp:Command>{}</rsp:Command></rsp:CommandLine>",
            xml_escape(cmd)
        );
        let request = envelope(&self.endpoint, ACTION_COMMAND, Some(shell_id), options, &body);
        let read_timeout = OPERATION_TIMEOUT + READ_SLACK;

        let response = self
            .post(request, read_timeout, Phase::Command)
            .await?
            .ok_or(ExecError::CommandTimeout)?;
        let command_id = capture(&COMMAND_ID, &response, "CommandId")?;
        debug!("WinRM command {} started in shell {}", command_id, shell_id);

        let mut output = RawOutput::default();
        let receive = format!(
            r#"<rsp:Receive><rsp:DesiredStream CommandId="{}">stdout stderr</rsp:DesiredStream></rsp:Receive>"#,
            command_id
        );
        while !output.done {
            let request = envelope(&self.endpoint, ACTION_RECEIVE, Some(shell_id), "", &receive);
            match self.post(request, read_timeout, Phase::Command).await? {
                Some(response) => output.absorb(&response)?,
                None => debug!("WinRM receive timed out on the server, polling again"),
            }
        }

        self.terminate(shell_id, &command_id).await;
        Ok(output)
    }

    async fn terminate(&self, shell_id: &str, command_id: &str) {
        let body = format!(
            r#"<rsp:Signal CommandId="{}"><rsp:Code>{}</rsp:Code></rsp:Signal>"#,
            command_id, SIGNAL_TERMINATE
        );
        let request = envelope(&self.endpoint, ACTION_SIGNAL, Some(shell_id), "", &body);
        if let Err(e) = self.post(request, READ_SLACK, Phase::Command).await {
            debug!("WinRM signal for command {} failed: {}", command_id, e);
        }
    }
}

#[async_trait]
impl ProtocolDriver for WinrmDriver {
    async fn connect(&mut self, timeout: Duration) -> Result<(), ExecError> {
        let client = Client::builder()
            .connect_timeout(timeout)
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| ExecError::Other(format!("Failed to build WinRM client: {}", e)))?;
        self.client = Some(client);

        let shell_id = self.open_shell(timeout).await?;
        info!("WinRM shell {} opened on {}", shell_id, self.endpoint);
        self.shell_id = Some(shell_id);
        Ok(())
    }

    async fn run_command(
        &mut self,
        cmd: Option<&str>,
        _timeout: Duration,
    ) -> Result<Option<CommandOutput>, ExecError> {
        let shell_id = self
            .shell_id
            .clone()
            .ok_or_else(|| ExecError::Other("WinRM session is not connected".to_string()))?;

        let output = self
            .execute(&shell_id, cmd.unwrap_or(KEEPALIVE_COMMAND))
            .await?;
        if cmd.is_none() {
            return Ok(None);
        }

        let encoding = self.encoding.as_deref();
        Ok(Some(CommandOutput {
            stdout: render(&output.stdout, encoding)?,
            stderr: render(&output.stderr, encoding)?,
            returncode: output.exit_code,
        }))
    }

    async fn close(&mut self) {
        if let Some(shell_id) = self.shell_id.take() {
            let request = envelope(&self.endpoint, ACTION_DELETE, Some(&shell_id), "", "");
            if let Err(e) = self.post(request, READ_SLACK, Phase::Command).await {
                warn!("Failed to delete WinRM shell {}: {}", shell_id, e);
            }
        }
        self.client = None;
    }
}
