//! Lifecycle of one remote command
//!
//! A [`CommandUnit`] owns a protocol driver and walks it through
//! connect → run → reply → close as a single scheduled unit. Every await is
//! raced against the unit's cancellation token and bounded by both its own
//! timeout and the overall task deadline.

use super::{driver_for, ExecError, ExecutorSettings, ProtocolDriver};
use crate::broker::ReplyTarget;
use crate::connection::Connection;
use crate::metrics::AgentMetrics;
use crate::models::{CommandOutput, CommandResult, CommandResultBuilder, Protocol};
use crate::reply::{ReplyChannel, ReplyGuard};
use crate::retry::{RetryConfig, RetryState};
use crate::scheduler::{SubmitOptions, TaskScheduler};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What to run, as requested by the caller
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub id: String,
    /// `None` runs the protocol keepalive
    pub cmd: Option<String>,
    pub timeout: Duration,
    /// Output charset; `None` returns base64 where the protocol supports it
    pub encoding: Option<String>,
}

pub struct CommandUnit {
    spec: CommandSpec,
    protocol: Protocol,
    remote: String,
    reply_to: ReplyTarget,
    driver: Box<dyn ProtocolDriver>,
    retry: RetryConfig,
    connect_timeout: Duration,
    task_deadline: Duration,
}

impl CommandUnit {
    pub fn new(
        spec: CommandSpec,
        connection: &Connection,
        reply_to: ReplyTarget,
        settings: &ExecutorSettings,
    ) -> Self {
        let driver = driver_for(connection, spec.encoding.clone(), settings);
        Self::with_driver(spec, connection, reply_to, settings, driver)
    }

    /// Build a unit around an already constructed driver
    pub fn with_driver(
        spec: CommandSpec,
        connection: &Connection,
        reply_to: ReplyTarget,
        settings: &ExecutorSettings,
        driver: Box<dyn ProtocolDriver>,
    ) -> Self {
        Self {
            spec,
            protocol: connection.protocol(),
            remote: connection.to_string(),
            reply_to,
            driver,
            retry: settings.retry_policy(connection.protocol()),
            connect_timeout: settings.connect_timeout,
            task_deadline: settings.task_deadline,
        }
    }

    pub fn id(&self) -> &str {
        &self.spec.id
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn spec(&self) -> &CommandSpec {
        &self.spec
    }

    /// Timestamp the start and hand the body to the scheduler
    ///
    /// Every run gets its own generated unit name, so redelivered task ids
    /// still execute and reply. Returns `None` once the scheduler is stopped.
    pub fn run(
        self,
        scheduler: &TaskScheduler,
        reply: ReplyChannel,
        metrics: Option<AgentMetrics>,
    ) -> Option<String> {
        let deadline = Instant::now() + self.task_deadline;
        let mut builder = CommandResultBuilder::new(
            Some(self.spec.id.clone()),
            self.spec.cmd.clone().unwrap_or_default(),
            self.spec.encoding.clone(),
        );
        builder.start();

        let id = self.spec.id.clone();
        let options = SubmitOptions::default().limited().reap_on_finish();
        let submitted = scheduler.submit(options, move |token| async move {
            let result = self
                .execute(builder, deadline, &token, &reply, metrics.as_ref())
                .await;
            Ok(serde_json::to_value(&result)?)
        });

        match &submitted {
            Some(name) => debug!("Task {} scheduled as {}", id, name),
            None => warn!("Task {} not scheduled, scheduler is stopped", id),
        }
        submitted
    }

    /// Run the body to completion, reply once and release the session
    pub async fn execute(
        mut self,
        mut builder: CommandResultBuilder,
        deadline: Instant,
        token: &CancellationToken,
        reply: &ReplyChannel,
        metrics: Option<&AgentMetrics>,
    ) -> CommandResult {
        let started = Instant::now();
        let guard = ReplyGuard::new();
        if let Some(metrics) = metrics {
            metrics.session_started();
        }
        debug!("Task {} connecting to {}", self.spec.id, self.remote);

        match self.drive(&guard, deadline, token).await {
            Ok(Some(output)) => builder.output(output),
            Ok(None) => {}
            Err(e) => {
                match &e {
                    ExecError::Other(detail) => {
                        error!("Task {} on {} failed: {}", self.spec.id, self.remote, detail)
                    }
                    other => info!("Task {} on {}: {}", self.spec.id, self.remote, other),
                }
                builder.fail(e.status(), e.err_info());
            }
        }

        let result = builder.finish();
        if result.code.is_success() {
            info!("Task {} Success!", self.spec.id);
        } else {
            info!("Task {} Failed!", self.spec.id);
        }
        debug!("Result: {:?}", result);

        if let Some(metrics) = metrics {
            metrics.record_task(self.protocol, result.code, started.elapsed().as_secs_f64());
            metrics.session_finished();
        }

        reply.reply_once(&guard, &result, &self.reply_to).await;
        self.driver.close().await;
        result
    }

    /// Connect and run, reconnecting on lost sessions while policy allows
    async fn drive(
        &mut self,
        guard: &ReplyGuard,
        deadline: Instant,
        token: &CancellationToken,
    ) -> Result<Option<CommandOutput>, ExecError> {
        let mut state = RetryState::new();

        loop {
            match self.attempt(deadline, token).await {
                Err(ExecError::ConnectionLost(reason)) => {
                    warn!(
                        "Task {} lost its session to {}: {}",
                        self.spec.id, self.remote, reason
                    );
                    self.driver.close().await;

                    if guard.is_claimed() || !state.should_retry(&self.retry) {
                        return Err(ExecError::ConnectTimeout);
                    }

                    let pause = state.calculate_delay(&self.retry);
                    let wake = deadline.min(Instant::now() + pause);
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => return Err(ExecError::Cancelled),
                        _ = tokio::time::sleep_until(wake) => {}
                    }
                    state.record_retry();
                }
                other => return other,
            }
        }
    }

    async fn attempt(
        &mut self,
        deadline: Instant,
        token: &CancellationToken,
    ) -> Result<Option<CommandOutput>, ExecError> {
        if token.is_cancelled() {
            return Err(ExecError::Cancelled);
        }

        let connect_by = deadline.min(Instant::now() + self.connect_timeout);
        let connect_timeout = connect_by.saturating_duration_since(Instant::now());
        bounded(
            token,
            connect_by,
            self.driver.connect(connect_timeout),
            ExecError::ConnectTimeout,
        )
        .await?;

        let run_by = deadline.min(Instant::now() + self.spec.timeout);
        let run_timeout = run_by.saturating_duration_since(Instant::now());
        bounded(
            token,
            run_by,
            self.driver.run_command(self.spec.cmd.as_deref(), run_timeout),
            ExecError::CommandTimeout,
        )
        .await
    }
}

/// Race `work` against cancellation and a deadline
async fn bounded<T>(
    token: &CancellationToken,
    until: Instant,
    work: impl Future<Output = Result<T, ExecError>>,
    on_elapsed: ExecError,
) -> Result<T, ExecError> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(ExecError::Cancelled),
        result = tokio::time::timeout_at(until, work) => result.unwrap_or(Err(on_elapsed)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Publisher;
    use crate::connection::{Account, RawConnection};
    use crate::models::StatusCode;
    use crate::scheduler::SchedulerSettings;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::{json, Value};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct RecordingPublisher {
        sent: Mutex<Vec<Value>>,
    }

    #[async_trait]
    impl Publisher for RecordingPublisher {
        async fn publish(
            &self,
            payload: Vec<u8>,
            _target: &ReplyTarget,
            _block: bool,
        ) -> crate::error::Result<()> {
            self.sent.lock().push(serde_json::from_slice(&payload)?);
            Ok(())
        }
    }

    #[derive(Default, Clone)]
    struct Counters {
        connects: Arc<AtomicUsize>,
        closes: Arc<AtomicUsize>,
    }

    /// Driver answering from scripts; empty scripts succeed
    #[derive(Default)]
    struct ScriptedDriver {
        connect_script: VecDeque<Result<(), ExecError>>,
        run_script: VecDeque<Result<Option<CommandOutput>, ExecError>>,
        run_delay: Duration,
        counters: Counters,
    }

    #[async_trait]
    impl ProtocolDriver for ScriptedDriver {
        async fn connect(&mut self, _timeout: Duration) -> Result<(), ExecError> {
            self.counters.connects.fetch_add(1, Ordering::SeqCst);
            self.connect_script.pop_front().unwrap_or(Ok(()))
        }

        async fn run_command(
            &mut self,
            cmd: Option<&str>,
            _timeout: Duration,
        ) -> Result<Option<CommandOutput>, ExecError> {
            tokio::time::sleep(self.run_delay).await;
            self.run_script.pop_front().unwrap_or_else(|| {
                Ok(cmd.map(|c| CommandOutput {
                    stdout: format!("ran {}", c),
                    stderr: String::new(),
                    returncode: Some(0),
                }))
            })
        }

        async fn close(&mut self) {
            self.counters.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn connection(proto: &str) -> Connection {
        let account = Account::new(Some("root"), Some("pw")).unwrap();
        let raw = RawConnection {
            ip: Some("10.0.0.9".to_string()),
            port: Some(json!(22)),
            sys_type: Some("linux".to_string()),
            proto: Some(proto.to_string()),
            encoding: None,
        };
        Connection::new(raw, account).unwrap()
    }

    fn settings() -> ExecutorSettings {
        ExecutorSettings {
            ssh_retry: RetryConfig::fixed(3, Duration::from_millis(10)),
            ..ExecutorSettings::default()
        }
    }

    fn spec(id: &str, cmd: Option<&str>, timeout: Duration) -> CommandSpec {
        CommandSpec {
            id: id.to_string(),
            cmd: cmd.map(str::to_string),
            timeout,
            encoding: Some("utf-8".to_string()),
        }
    }

    fn unit(proto: &str, spec: CommandSpec, driver: ScriptedDriver) -> CommandUnit {
        CommandUnit::with_driver(
            spec,
            &connection(proto),
            ReplyTarget::new("results", "agent"),
            &settings(),
            Box::new(driver),
        )
    }

    async fn execute(unit: CommandUnit, publisher: Arc<RecordingPublisher>) -> CommandResult {
        let builder = CommandResultBuilder::new(
            Some(unit.id().to_string()),
            unit.spec.cmd.clone().unwrap_or_default(),
            unit.spec.encoding.clone(),
        );
        let deadline = Instant::now() + Duration::from_secs(30);
        let reply = ReplyChannel::new(publisher, false);
        unit.execute(builder, deadline, &CancellationToken::new(), &reply, None)
            .await
    }

    #[tokio::test]
    async fn test_success_replies_once() {
        let publisher = Arc::new(RecordingPublisher::default());
        let counters = Counters::default();
        let driver = ScriptedDriver {
            counters: counters.clone(),
            ..Default::default()
        };

        let result = execute(
            unit("ssh", spec("t-1", Some("uptime"), Duration::from_secs(5)), driver),
            publisher.clone(),
        )
        .await;

        assert_eq!(result.code, StatusCode::Success);
        assert_eq!(result.stdout, "ran uptime");
        assert_eq!(result.encoding, "utf-8");

        let sent = publisher.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["id"], "t-1");
        assert_eq!(sent[0]["code"], 0);
        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_ssh_reconnects_after_lost_session() {
        let publisher = Arc::new(RecordingPublisher::default());
        let counters = Counters::default();
        let driver = ScriptedDriver {
            run_script: VecDeque::from(vec![
                Err(ExecError::ConnectionLost("reset by peer".into())),
                Err(ExecError::ConnectionLost("reset by peer".into())),
            ]),
            counters: counters.clone(),
            ..Default::default()
        };

        let result = execute(
            unit("ssh", spec("t-2", Some("df"), Duration::from_secs(5)), driver),
            publisher.clone(),
        )
        .await;

        assert_eq!(result.code, StatusCode::Success);
        assert_eq!(counters.connects.load(Ordering::SeqCst), 3);
        assert_eq!(publisher.sent.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_ssh_retries_exhausted() {
        let publisher = Arc::new(RecordingPublisher::default());
        let counters = Counters::default();
        let driver = ScriptedDriver {
            connect_script: (0..4)
                .map(|_| Err(ExecError::ConnectionLost("lost".into())))
                .collect(),
            counters: counters.clone(),
            ..Default::default()
        };

        let result = execute(
            unit("ssh", spec("t-3", Some("df"), Duration::from_secs(5)), driver),
            publisher.clone(),
        )
        .await;

        assert_eq!(result.code, StatusCode::ConnectionTimeOut);
        assert_eq!(result.err_info, "connection time out");
        // initial attempt plus three reconnects
        assert_eq!(counters.connects.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_telnet_never_reconnects() {
        let publisher = Arc::new(RecordingPublisher::default());
        let counters = Counters::default();
        let driver = ScriptedDriver {
            run_script: VecDeque::from(vec![Err(ExecError::ConnectionLost("eof".into()))]),
            counters: counters.clone(),
            ..Default::default()
        };

        let result = execute(
            unit("telnet", spec("t-4", Some("ls"), Duration::from_secs(5)), driver),
            publisher,
        )
        .await;

        assert_eq!(result.code, StatusCode::ConnectionTimeOut);
        assert_eq!(counters.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_command_timeout() {
        let publisher = Arc::new(RecordingPublisher::default());
        let driver = ScriptedDriver {
            run_delay: Duration::from_millis(500),
            ..Default::default()
        };

        let result = execute(
            unit("ssh", spec("t-5", Some("sleep 60"), Duration::from_millis(50)), driver),
            publisher.clone(),
        )
        .await;

        assert_eq!(result.code, StatusCode::HitEofTimeOut);
        assert_eq!(publisher.sent.lock()[0]["code"], -4);
    }

    #[tokio::test]
    async fn test_permission_denied() {
        let publisher = Arc::new(RecordingPublisher::default());
        let driver = ScriptedDriver {
            connect_script: VecDeque::from(vec![Err(ExecError::PermissionDenied)]),
            ..Default::default()
        };

        let result = execute(
            unit("ssh", spec("t-6", Some("id"), Duration::from_secs(5)), driver),
            publisher,
        )
        .await;

        assert_eq!(result.code, StatusCode::PermissionDenied);
        assert_eq!(result.err_info, "permission denied");
        assert_eq!(result.stdout, "");
    }

    #[tokio::test]
    async fn test_unexpected_error_is_abbreviated() {
        let publisher = Arc::new(RecordingPublisher::default());
        let driver = ScriptedDriver {
            run_script: VecDeque::from(vec![Err(ExecError::Other(
                "channel closed unexpectedly\n  at frame 1\n  at frame 2".into(),
            ))]),
            ..Default::default()
        };

        let result = execute(
            unit("winrm", spec("t-7", Some("dir"), Duration::from_secs(5)), driver),
            publisher,
        )
        .await;

        assert_eq!(result.code, StatusCode::UnknownError);
        assert_eq!(result.err_info, "channel closed unexpectedly");
    }

    #[tokio::test]
    async fn test_keepalive_leaves_output_empty() {
        let publisher = Arc::new(RecordingPublisher::default());
        let result = execute(
            unit("ssh", spec("t-8", None, Duration::from_secs(5)), ScriptedDriver::default()),
            publisher,
        )
        .await;

        assert_eq!(result.code, StatusCode::Success);
        assert_eq!(result.cmd, "");
        assert_eq!(result.returncode, None);
    }

    #[tokio::test]
    async fn test_metrics_recorded() {
        let publisher = Arc::new(RecordingPublisher::default());
        let metrics = AgentMetrics::new().unwrap();
        let unit = unit("ssh", spec("t-9", Some("w"), Duration::from_secs(5)), ScriptedDriver::default());
        let builder = CommandResultBuilder::new(Some("t-9".to_string()), "w", None);
        let reply = ReplyChannel::new(publisher, false);

        unit.execute(
            builder,
            Instant::now() + Duration::from_secs(5),
            &CancellationToken::new(),
            &reply,
            Some(&metrics),
        )
        .await;

        let rendered = metrics.render().unwrap();
        assert!(rendered.contains("remexec_active_sessions 0"));
        assert!(rendered.contains(r#"remexec_tasks_total{code="0",protocol="ssh"} 1"#));
    }

    async fn wait_for_reply(publisher: &RecordingPublisher) -> Value {
        for _ in 0..200 {
            if let Some(reply) = publisher.sent.lock().first() {
                return reply.clone();
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no reply published");
    }

    #[tokio::test]
    async fn test_cancel_through_scheduler() {
        let scheduler = TaskScheduler::start(SchedulerSettings::new("unit-cancel", 4)).unwrap();
        let publisher = Arc::new(RecordingPublisher::default());
        let reply = ReplyChannel::new(publisher.clone(), false);
        let driver = ScriptedDriver {
            run_delay: Duration::from_secs(30),
            ..Default::default()
        };

        let name = unit("ssh", spec("t-10", Some("sleep 30"), Duration::from_secs(60)), driver)
            .run(&scheduler, reply, None)
            .unwrap();
        assert!(name.starts_with("unit-"));

        tokio::time::sleep(Duration::from_millis(50)).await;
        scheduler.cancel(&name, false).await.unwrap();

        let sent = wait_for_reply(&publisher).await;
        assert_eq!(sent["code"], StatusCode::ManualCancelled.code());
        assert_eq!(sent["err_info"], "manual cancelled");
        scheduler.stop();
    }

    #[tokio::test]
    async fn test_repeated_task_id_runs_and_replies_each_time() {
        let scheduler = TaskScheduler::start(SchedulerSettings::new("unit-dup", 4)).unwrap();
        let publisher = Arc::new(RecordingPublisher::default());
        let reply = ReplyChannel::new(publisher.clone(), false);
        let slow = || ScriptedDriver {
            run_delay: Duration::from_millis(300),
            ..Default::default()
        };

        let first = unit("ssh", spec("dup", Some("ls"), Duration::from_secs(5)), slow())
            .run(&scheduler, reply.clone(), None)
            .unwrap();
        let second = unit("ssh", spec("dup", Some("ls"), Duration::from_secs(5)), slow())
            .run(&scheduler, reply, None)
            .unwrap();
        assert_ne!(first, second);

        for _ in 0..200 {
            if publisher.sent.lock().len() >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let sent = publisher.sent.lock().clone();
        assert_eq!(sent.len(), 2);
        for reply in sent {
            assert_eq!(reply["id"], "dup");
            assert_eq!(reply["stdout"], "ran ls");
        }
        scheduler.stop();
    }

    #[tokio::test]
    async fn test_ssh_reconnects_after_lost_connect() {
        let scheduler = TaskScheduler::start(SchedulerSettings::new("unit-reconnect", 4)).unwrap();
        let publisher = Arc::new(RecordingPublisher::default());
        let reply = ReplyChannel::new(publisher.clone(), false);
        let metrics = AgentMetrics::new().unwrap();
        let counters = Counters::default();
        let driver = ScriptedDriver {
            connect_script: VecDeque::from(vec![
                Err(ExecError::ConnectionLost("reset by peer".into())),
                Err(ExecError::ConnectionLost("reset by peer".into())),
            ]),
            counters: counters.clone(),
            ..Default::default()
        };

        let name = unit("ssh", spec("t-11", Some("df"), Duration::from_secs(5)), driver)
            .run(&scheduler, reply, Some(metrics.clone()))
            .unwrap();

        let sent = wait_for_reply(&publisher).await;
        assert_eq!(sent["code"], StatusCode::Success.code());
        assert_eq!(sent["stdout"], "ran df");
        assert_eq!(counters.connects.load(Ordering::SeqCst), 3);

        for _ in 0..200 {
            if scheduler.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(scheduler.is_empty());
        assert!(!scheduler.is_done(&name));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(publisher.sent.lock().len(), 1);
        let rendered = metrics.render().unwrap();
        assert!(rendered.contains(r#"remexec_tasks_total{code="0",protocol="ssh"} 1"#));
        scheduler.stop();
    }

    #[tokio::test]
    async fn test_run_after_stop_is_not_scheduled() {
        let scheduler = TaskScheduler::start(SchedulerSettings::new("unit-stopped", 4)).unwrap();
        let reply = ReplyChannel::new(Arc::new(RecordingPublisher::default()), false);
        scheduler.stop();

        let submitted = unit("ssh", spec("late", Some("ls"), Duration::from_secs(5)), ScriptedDriver::default())
            .run(&scheduler, reply, None);
        assert!(submitted.is_none());
    }
}
