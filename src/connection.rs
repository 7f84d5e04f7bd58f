//! Validated descriptors of a remote target and its credentials

use crate::error::{AgentError, Result};
use crate::models::Protocol;
use serde::Deserialize;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

/// Login credentials for a remote host
///
/// The password is never part of the `Display` or `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct Account {
    username: String,
    password: String,
}

impl Account {
    pub fn new(username: Option<&str>, password: Option<&str>) -> Result<Self> {
        let username = username
            .filter(|u| !u.is_empty())
            .ok_or_else(|| AgentError::Validation("Not username".to_string()))?;
        let password = password
            .filter(|p| !p.is_empty())
            .ok_or_else(|| AgentError::Validation("Not password".to_string()))?;

        Ok(Self {
            username: username.to_string(),
            password: password.to_string(),
        })
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Display for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "u:{} p:******", self.username)
    }
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("username", &self.username)
            .field("password", &"******")
            .finish()
    }
}

/// Connection block of an inbound task, as sent on the wire
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawConnection {
    pub ip: Option<String>,
    pub port: Option<serde_json::Value>,
    #[serde(rename = "sysType")]
    pub sys_type: Option<String>,
    pub proto: Option<String>,
    pub encoding: Option<String>,
}

/// A validated remote target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    ip: Ipv4Addr,
    port: u16,
    protocol: Protocol,
    sys_type: Option<String>,
    encoding: Option<String>,
    account: Account,
}

impl Connection {
    /// Validate a raw connection block
    ///
    /// `localhost` is normalized to `127.0.0.1`; IPv6 literals and ports
    /// outside 1..=65535 are rejected.
    pub fn new(raw: RawConnection, account: Account) -> Result<Self> {
        let proto = raw
            .proto
            .filter(|p| !p.is_empty())
            .ok_or_else(|| AgentError::Validation("Not protocol".to_string()))?;
        let ip = raw
            .ip
            .filter(|ip| !ip.is_empty())
            .ok_or_else(|| AgentError::Validation("Not ip".to_string()))?;
        let port = raw
            .port
            .filter(|p| !p.is_null())
            .ok_or_else(|| AgentError::Validation("Not port".to_string()))?;

        let ip = parse_ipv4(&ip)?;
        let port = parse_port(&port)?;
        let protocol =
            Protocol::parse(&proto).ok_or(AgentError::UnsupportedProtocol(proto))?;

        Ok(Self {
            ip,
            port,
            protocol,
            sys_type: raw.sys_type,
            encoding: raw.encoding.filter(|e| !e.is_empty()),
            account,
        })
    }

    pub fn ip(&self) -> Ipv4Addr {
        self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn sys_type(&self) -> Option<&str> {
        self.sys_type.as_deref()
    }

    pub fn encoding(&self) -> Option<&str> {
        self.encoding.as_deref()
    }

    pub fn account(&self) -> &Account {
        &self.account
    }

    /// `ip:port` socket address string
    pub fn target(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ip:{} port:{} proto:{}", self.ip, self.port, self.protocol)
    }
}

fn parse_ipv4(ip: &str) -> Result<Ipv4Addr> {
    let ip = ip.trim();
    if let Ok(addr) = ip.parse::<Ipv4Addr>() {
        return Ok(addr);
    }
    if ip.eq_ignore_ascii_case("localhost") {
        return Ok(Ipv4Addr::LOCALHOST);
    }
    if ip.parse::<Ipv6Addr>().is_ok() {
        return Err(AgentError::Ipv6Unsupported(ip.to_string()));
    }
    Err(AgentError::InvalidIp(ip.to_string()))
}

fn parse_port(port: &serde_json::Value) -> Result<u16> {
    let invalid = || AgentError::InvalidPort(port.to_string());
    let value = match port {
        serde_json::Value::Number(n) => n.as_i64().ok_or_else(invalid)?,
        serde_json::Value::String(s) => s.trim().parse::<i64>().map_err(|_| invalid())?,
        _ => return Err(invalid()),
    };

    if value <= 0 || value > i64::from(u16::MAX) {
        return Err(invalid());
    }
    u16::try_from(value).map_err(|_| invalid())
}
