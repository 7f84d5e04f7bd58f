//! Agent process lifecycle
//!
//! [`AgentContext`] is built once at startup and shared by `Arc`; it owns the
//! scheduler, the reply channel and the metrics registry. [`Agent::run`]
//! connects to the broker, feeds deliveries into the front door and waits
//! for SIGTERM or SIGINT before shutting everything down in reverse order.
//!
//! # Example
//!
//! ```no_run
//! use remexec::agent::Agent;
//! use remexec::config::AgentConfig;
//!
//! # async fn example() -> anyhow::Result<()> {
//! Agent::new(AgentConfig::default()).run().await?;
//! # Ok(())
//! # }
//! ```

use crate::broker::amqp::AmqpTransport;
use crate::broker::Publisher;
use crate::config::AgentConfig;
use crate::dispatch::{Dispatcher, FrontDoor};
use crate::error::{AgentError, Result};
use crate::executors::ExecutorSettings;
use crate::metrics::AgentMetrics;
use crate::reply::ReplyChannel;
use crate::scheduler::{SchedulerSettings, TaskScheduler};
use crate::task::TaskContext;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Shared services of a running agent
pub struct AgentContext {
    pub config: AgentConfig,
    pub scheduler: TaskScheduler,
    pub reply: ReplyChannel,
    pub metrics: AgentMetrics,
    pub executor: Arc<ExecutorSettings>,
}

impl AgentContext {
    pub fn new(config: AgentConfig, publisher: Arc<dyn Publisher>) -> Result<Arc<Self>> {
        let metrics = AgentMetrics::new()
            .map_err(|e| AgentError::Other(format!("failed to register metrics: {}", e)))?;
        let scheduler = TaskScheduler::start(SchedulerSettings::new(
            config.scheduler.name.clone(),
            config.scheduler.concurrency,
        ))?;
        let reply =
            ReplyChannel::new(publisher, config.broker.publish_block).with_metrics(metrics.clone());
        let executor = Arc::new(ExecutorSettings::from(&config.executor));

        Ok(Arc::new(Self {
            config,
            scheduler,
            reply,
            metrics,
            executor,
        }))
    }

    /// Per-task view of the context
    pub fn task_context(&self) -> TaskContext {
        TaskContext {
            scheduler: self.scheduler.clone(),
            reply: self.reply.clone(),
            executor: self.executor.clone(),
            metrics: Some(self.metrics.clone()),
            version: self.config.version.clone(),
        }
    }

    /// Cancel in-flight units and stop the run-loop
    pub fn shutdown(&self) {
        self.scheduler.stop();
    }
}

pub struct Agent {
    config: AgentConfig,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Self {
        Self { config }
    }

    /// Run until a shutdown signal arrives or the broker consumer fails
    pub async fn run(self) -> anyhow::Result<()> {
        info!("Starting remexec agent {}", self.config.version);

        let transport = AmqpTransport::connect(&self.config.broker).await?;
        let ctx = AgentContext::new(self.config.clone(), Arc::new(transport.publisher()))?;

        let shutdown = CancellationToken::new();
        let metrics_server = match self.config.metrics.port {
            Some(port) => Some(ctx.metrics.start(port, shutdown.clone()).await?),
            None => None,
        };

        let dispatcher = Arc::new(Dispatcher::new(ctx.task_context()));
        let mut front_door = FrontDoor::start(dispatcher, self.config.dispatch.workers)?;
        let inbox = front_door
            .inbox()
            .ok_or_else(|| anyhow::anyhow!("front door closed before start"))?;

        let signals = tokio::spawn(wait_for_signal(shutdown.clone()));

        let consumed = transport
            .consume(
                move |payload, meta| {
                    inbox.push(payload, meta);
                },
                shutdown.clone(),
            )
            .await;
        if let Err(e) = &consumed {
            error!("Broker consumer failed: {}", e);
        }
        shutdown.cancel();
        signals.abort();
        if let Some(server) = metrics_server {
            let _ = server.await;
        }

        info!("Shutting down agent...");
        let ctx_for_stop = ctx.clone();
        tokio::task::spawn_blocking(move || {
            front_door.shutdown();
            ctx_for_stop.shutdown();
        })
        .await?;

        if let Err(e) = transport.close().await {
            warn!("Failed to close broker connection: {}", e);
        }
        info!("Agent shutdown complete");

        consumed.map_err(Into::into)
    }
}

/// Cancel `shutdown` on SIGTERM or SIGINT; SIGHUP is logged and ignored
async fn wait_for_signal(shutdown: CancellationToken) -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| AgentError::Other(format!("Failed to setup SIGTERM handler: {}", e)))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| AgentError::Other(format!("Failed to setup SIGINT handler: {}", e)))?;
    let mut sighup = signal(SignalKind::hangup())
        .map_err(|e| AgentError::Other(format!("Failed to setup SIGHUP handler: {}", e)))?;

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM, initiating graceful shutdown");
                break;
            }
            _ = sigint.recv() => {
                info!("Received SIGINT, initiating graceful shutdown");
                break;
            }
            _ = sighup.recv() => {
                info!("Received SIGHUP, configuration reload is not supported");
            }
            _ = shutdown.cancelled() => return Ok(()),
        }
    }

    shutdown.cancel();
    Ok(())
}
