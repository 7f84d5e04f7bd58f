//! Typed tasks built from inbound messages
//!
//! A task validates itself against the raw JSON body and its delivery
//! metadata. Gather tasks resolve into a [`CommandUnit`]; info tasks are
//! answered on the spot.

use crate::broker::{DeliveryMeta, ReplyTarget};
use crate::connection::{Account, Connection, RawConnection};
use crate::error::{AgentError, Result};
use crate::executors::unit::{CommandSpec, CommandUnit};
use crate::executors::ExecutorSettings;
use crate::metrics::AgentMetrics;
use crate::models::{epoch_seconds, CommandResult, TaskResult, TaskType};
use crate::reply::ReplyChannel;
use crate::scheduler::{SubmitOptions, TaskScheduler};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::net::{IpAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Encoding reported on synthetic rejection replies
const REJECTION_ENCODING: &str = "utf-8";

/// Everything a task needs to run and reply
#[derive(Clone)]
pub struct TaskContext {
    pub scheduler: TaskScheduler,
    pub reply: ReplyChannel,
    pub executor: Arc<ExecutorSettings>,
    pub metrics: Option<AgentMetrics>,
    pub version: String,
}

impl TaskContext {
    /// Publish from a thread outside the run-loop
    ///
    /// The publish runs as an unlimited unit that is reaped on completion.
    pub fn reply_detached<T>(&self, result: T, target: ReplyTarget) -> Option<String>
    where
        T: Serialize + Send + 'static,
    {
        let reply = self.reply.clone();
        self.scheduler.submit(SubmitOptions::default().reap_on_finish(), move |_token| async move {
            let published = reply.reply(result, &target).await;
            Ok(json!(published))
        })
    }
}

fn non_empty_str<'a>(object: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    object
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

/// Task id as sent by the caller; numbers are accepted and stringified
fn task_id(object: &Map<String, Value>) -> Option<String> {
    match object.get("id") {
        Some(Value::String(id)) if !id.is_empty() => Some(id.clone()),
        Some(Value::Number(id)) => Some(id.to_string()),
        _ => None,
    }
}

/// A remote command request
pub struct GatherTask {
    body: Value,
    meta: DeliveryMeta,
    id: Option<String>,
    reply_to: Option<ReplyTarget>,
    unit: Option<CommandUnit>,
}

impl GatherTask {
    pub fn new(body: Value, meta: DeliveryMeta) -> Self {
        Self {
            body,
            meta,
            id: None,
            reply_to: None,
            unit: None,
        }
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn reply_to(&self) -> Option<&ReplyTarget> {
        self.reply_to.as_ref()
    }

    /// Validate the task and resolve its executor
    ///
    /// On failure a rejection is published if a reply target was parsed
    /// before the failing step.
    pub fn check(&mut self, ctx: &TaskContext) -> Result<()> {
        match self.resolve(&ctx.executor) {
            Ok(unit) => {
                self.unit = Some(unit);
                Ok(())
            }
            Err(e) => {
                warn!("Gather task {:?} rejected: {}", self.id, e);
                if let Some(target) = self.reply_to.clone() {
                    let rejection = CommandResult::rejected(
                        self.id.clone(),
                        Some(REJECTION_ENCODING),
                        e.to_string(),
                    );
                    ctx.reply_detached(rejection, target);
                }
                Err(e)
            }
        }
    }

    /// Resolve the reply target first so every later failure can be answered
    fn resolve(&mut self, settings: &ExecutorSettings) -> Result<CommandUnit> {
        self.id = self.body.as_object().and_then(task_id);

        let reply_to = self
            .meta
            .reply_to
            .as_deref()
            .ok_or_else(|| AgentError::Validation("Task without reply_to".to_string()))?;
        let target = ReplyTarget::parse(reply_to)?;
        self.reply_to = Some(target.clone());

        let body = self
            .body
            .as_object()
            .filter(|object| !object.is_empty())
            .ok_or_else(|| AgentError::Validation("Task body is empty".to_string()))?;
        let id = self
            .id
            .clone()
            .ok_or_else(|| AgentError::Validation("Not id".to_string()))?;
        info!("Start parsing task id : {}", id);

        let account = body
            .get("account")
            .and_then(Value::as_object)
            .ok_or_else(|| AgentError::Validation("Not account info".to_string()))?;
        let account = Account::new(
            non_empty_str(account, "username"),
            non_empty_str(account, "password"),
        )?;

        let conn = body
            .get("conn")
            .filter(|conn| conn.is_object())
            .ok_or_else(|| AgentError::Validation("Not connection info".to_string()))?;
        let raw: RawConnection = serde_json::from_value(conn.clone())
            .map_err(|e| AgentError::Validation(format!("Invalid connection info: {}", e)))?;
        let connection = Connection::new(raw, account)?;

        let task = body.get("task").and_then(Value::as_object);
        let cmd = task.and_then(|t| non_empty_str(t, "cmd")).map(str::to_string);
        let timeout = task
            .and_then(|t| t.get("mto"))
            .and_then(Value::as_u64)
            .filter(|mto| *mto > 0)
            .map(Duration::from_secs)
            .unwrap_or(settings.default_command_timeout);
        let encoding = non_empty_str(body, "encoding").map(str::to_string);

        debug!(
            "Task {} resolved to {} (timeout {:?}, encoding {:?})",
            id, connection, timeout, encoding
        );

        let spec = CommandSpec {
            id,
            cmd,
            timeout,
            encoding,
        };
        Ok(CommandUnit::new(spec, &connection, target, settings))
    }

    /// Submit the resolved unit; `None` if the task was not checked or the scheduler is stopped
    pub fn run(self, ctx: &TaskContext) -> Option<String> {
        let unit = self.unit?;
        unit.run(&ctx.scheduler, ctx.reply.clone(), ctx.metrics.clone())
    }
}

/// Local facts about the agent host
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineInfo {
    pub hostname: String,
    pub ip: Option<String>,
    pub version: String,
}

impl EngineInfo {
    pub fn collect(version: &str) -> Self {
        let hostname = hostname::get()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let ip = resolve_ipv4(&hostname);
        Self {
            hostname,
            ip,
            version: version.to_string(),
        }
    }
}

fn resolve_ipv4(hostname: &str) -> Option<String> {
    if hostname.is_empty() {
        return None;
    }
    match (hostname, 0).to_socket_addrs() {
        Ok(addrs) => addrs
            .map(|addr| addr.ip())
            .find(IpAddr::is_ipv4)
            .map(|ip| ip.to_string()),
        Err(e) => {
            debug!("Could not resolve {}: {}", hostname, e);
            None
        }
    }
}

/// A request for the agent's host facts
pub struct InfoTask {
    id: String,
    extra: Value,
    reply_to: Option<ReplyTarget>,
}

impl InfoTask {
    /// Build from a message; id and type are required
    pub fn new(body: &Value, meta: &DeliveryMeta) -> Result<Self> {
        let object = body
            .as_object()
            .ok_or_else(|| AgentError::Validation("Task body is empty".to_string()))?;
        let id = task_id(object).ok_or_else(|| AgentError::Validation("Not id".to_string()))?;
        let task_type = non_empty_str(object, "type")
            .ok_or_else(|| AgentError::Validation("Not type".to_string()))?;
        if TaskType::parse(task_type) != Some(TaskType::Info) {
            return Err(AgentError::Validation("Task type mismatch".to_string()));
        }

        let reply_to = match meta.reply_to.as_deref() {
            Some(reply_to) => Some(ReplyTarget::parse(reply_to)?),
            None => None,
        };

        Ok(Self {
            id,
            extra: object.get("extra").cloned().unwrap_or(Value::Null),
            reply_to,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Collect host facts into a result
    pub fn execute(&self, version: &str) -> TaskResult {
        info!("Task {} start!", self.id);
        let mut result = TaskResult::new(self.id.clone(), TaskType::Info, self.extra.clone());
        result.start_time = Some(epoch_seconds());
        result.payload = json!(EngineInfo::collect(version));
        result.end_time = Some(epoch_seconds());
        result
    }

    /// Execute and reply when the message carried a reply address
    pub fn run(self, ctx: &TaskContext) -> TaskResult {
        let result = self.execute(&ctx.version);
        if let Some(target) = self.reply_to.clone() {
            ctx.reply_detached(result.clone(), target);
        }
        info!("Task {} end!", self.id);
        result
    }
}
