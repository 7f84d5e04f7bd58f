//! Cooperative task scheduler for remote sessions
//!
//! All units run on one current-thread tokio runtime driven by a dedicated OS
//! thread. Units are registered by name, may be gated behind a shared counting
//! semaphore, and can be cancelled, queried and reaped from any thread.
//!
//! # Example
//!
//! ```no_run
//! use remexec::scheduler::{SchedulerSettings, SubmitOptions, TaskScheduler};
//! use serde_json::json;
//!
//! # fn example() -> remexec::error::Result<()> {
//! let scheduler = TaskScheduler::start(SchedulerSettings::new("coroutine", 40))?;
//!
//! let name = scheduler
//!     .submit(SubmitOptions::named("job-1").limited(), |_token| async move {
//!         Ok(json!("done"))
//!     })
//!     .expect("name is free");
//!
//! let outcome = scheduler.result_blocking(&name)?;
//! scheduler.stop();
//! # Ok(())
//! # }
//! ```

use crate::error::{AgentError, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::runtime::{Builder, Handle};
use tokio::sync::{watch, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Poll interval used while waiting for a cancellation to be observed
pub const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// Name of the run-loop thread
    pub name: String,
    /// Maximum number of limited units running at once
    pub concurrency: usize,
}

impl SchedulerSettings {
    pub fn new(name: impl Into<String>, concurrency: usize) -> Self {
        Self {
            name: name.into(),
            concurrency,
        }
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self::new("coroutine", 40)
    }
}

/// Registration options for a unit
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    /// Unique key; generated when absent
    pub name: Option<String>,
    /// Gate the body behind the concurrency limit
    pub limited: bool,
    /// Drop the registry entry as soon as the unit completes
    pub reap_on_finish: bool,
}

impl SubmitOptions {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn limited(mut self) -> Self {
        self.limited = true;
        self
    }

    pub fn reap_on_finish(mut self) -> Self {
        self.reap_on_finish = true;
        self
    }
}

/// Lifecycle state of a scheduled unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    Pending,
    Running,
    Cancelled,
    Finished,
    Failed,
}

impl UnitState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            UnitState::Cancelled | UnitState::Finished | UnitState::Failed
        )
    }
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UnitState::Pending => "pending",
            UnitState::Running => "running",
            UnitState::Cancelled => "cancelled",
            UnitState::Finished => "finished",
            UnitState::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// What a completed unit produced
#[derive(Debug, Clone, PartialEq)]
pub enum UnitOutcome {
    Value(Value),
    Cancelled,
    Failed(String),
}

impl UnitOutcome {
    fn state(&self) -> UnitState {
        match self {
            UnitOutcome::Value(_) => UnitState::Finished,
            UnitOutcome::Cancelled => UnitState::Cancelled,
            UnitOutcome::Failed(_) => UnitState::Failed,
        }
    }
}

struct UnitEntry {
    token: CancellationToken,
    state: watch::Sender<UnitState>,
    outcome: Mutex<Option<UnitOutcome>>,
}

impl UnitEntry {
    fn new(token: CancellationToken) -> Self {
        let (state, _) = watch::channel(UnitState::Pending);
        Self {
            token,
            state,
            outcome: Mutex::new(None),
        }
    }

    fn state(&self) -> UnitState {
        *self.state.borrow()
    }

    fn complete(&self, outcome: UnitOutcome) {
        let state = outcome.state();
        *self.outcome.lock() = Some(outcome);
        self.state.send_replace(state);
    }
}

struct Inner {
    name: String,
    handle: Handle,
    gate: Arc<Semaphore>,
    concurrency: usize,
    units: DashMap<String, Arc<UnitEntry>>,
    shutdown: CancellationToken,
    thread: Mutex<Option<JoinHandle<()>>>,
}

/// Named, cancellable units on a single cooperative run-loop
///
/// Cloning is cheap; clones share the run-loop and the registry.
#[derive(Clone)]
pub struct TaskScheduler {
    inner: Arc<Inner>,
}

impl TaskScheduler {
    /// Bring up the run-loop thread
    pub fn start(settings: SchedulerSettings) -> Result<Self> {
        let runtime = Builder::new_current_thread().enable_all().build()?;
        let handle = runtime.handle().clone();
        let shutdown = CancellationToken::new();

        let stop_signal = shutdown.clone();
        let thread = std::thread::Builder::new()
            .name(settings.name.clone())
            .spawn(move || {
                runtime.block_on(stop_signal.cancelled());
                runtime.shutdown_timeout(Duration::from_secs(1));
            })?;

        info!(
            "Scheduler '{}' started (concurrency {})",
            settings.name, settings.concurrency
        );

        Ok(Self {
            inner: Arc::new(Inner {
                name: settings.name,
                handle,
                gate: Arc::new(Semaphore::new(settings.concurrency)),
                concurrency: settings.concurrency,
                units: DashMap::new(),
                shutdown,
                thread: Mutex::new(Some(thread)),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Handle of the run-loop runtime
    pub fn handle(&self) -> &Handle {
        &self.inner.handle
    }

    /// Register and start a unit
    ///
    /// Returns the unit name, or `None` when the name is held by a live unit
    /// or the scheduler is stopped.
    pub fn submit<F, Fut>(&self, options: SubmitOptions, unit: F) -> Option<String>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        match self.try_submit(options, unit) {
            Ok(name) => Some(name),
            Err(e) => {
                warn!("Submit rejected: {}", e);
                None
            }
        }
    }

    /// Like [`submit`](Self::submit) but reports why a unit was rejected
    pub fn try_submit<F, Fut>(&self, options: SubmitOptions, unit: F) -> Result<String>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        if self.inner.shutdown.is_cancelled() {
            return Err(AgentError::SchedulerStopped);
        }

        let name = options
            .name
            .unwrap_or_else(|| format!("unit-{}", Uuid::new_v4()));
        let entry = Arc::new(UnitEntry::new(self.inner.shutdown.child_token()));

        match self.inner.units.entry(name.clone()) {
            Entry::Occupied(_) => return Err(AgentError::AlreadyExists(name)),
            Entry::Vacant(slot) => {
                slot.insert(entry.clone());
            }
        }

        let body = unit(entry.token.clone());
        let gate = options.limited.then(|| self.inner.gate.clone());
        let inner = self.inner.clone();
        let reap = options.reap_on_finish;
        let unit_name = name.clone();

        self.inner.handle.spawn(async move {
            // A unit cancelled while queued runs ungated so it can observe its token
            let permit = match gate {
                Some(gate) => tokio::select! {
                    biased;
                    _ = entry.token.cancelled() => None,
                    acquired = gate.acquire_owned() => match acquired {
                        Ok(permit) => Some(permit),
                        Err(_) => {
                            entry.complete(UnitOutcome::Failed("scheduler gate closed".to_string()));
                            return;
                        }
                    },
                },
                None => None,
            };

            entry.state.send_replace(UnitState::Running);
            debug!("Unit '{}' running", unit_name);

            let result = AssertUnwindSafe(body).catch_unwind().await;
            drop(permit);

            let outcome = match result {
                _ if entry.token.is_cancelled() => UnitOutcome::Cancelled,
                Ok(Ok(value)) => UnitOutcome::Value(value),
                Ok(Err(e)) => UnitOutcome::Failed(format!("{:#}", e)),
                Err(_) => {
                    error!("Unit '{}' panicked", unit_name);
                    UnitOutcome::Failed("unit panicked".to_string())
                }
            };
            debug!("Unit '{}' completed: {}", unit_name, outcome.state());
            entry.complete(outcome);

            if reap {
                inner
                    .units
                    .remove_if(&unit_name, |_, held| Arc::ptr_eq(held, &entry));
            }
        });

        Ok(name)
    }

    fn entry(&self, name: &str) -> Result<Arc<UnitEntry>> {
        self.inner
            .units
            .get(name)
            .map(|e| e.value().clone())
            .ok_or_else(|| AgentError::NotFound(name.to_string()))
    }

    pub fn status(&self, name: &str) -> Result<UnitState> {
        Ok(self.entry(name)?.state())
    }

    /// Whether the named unit has completed; unknown names report `false`
    pub fn is_done(&self, name: &str) -> bool {
        self.entry(name)
            .map(|e| e.state().is_terminal())
            .unwrap_or(false)
    }

    /// Request cooperative cancellation, optionally waiting until observed
    pub async fn cancel(&self, name: &str, wait: bool) -> Result<()> {
        let entry = self.entry(name)?;
        entry.token.cancel();
        debug!("Cancellation requested for '{}'", name);

        if wait {
            while !entry.state().is_terminal() {
                tokio::time::sleep(CANCEL_POLL_INTERVAL).await;
            }
        }
        Ok(())
    }

    /// Blocking [`cancel`](Self::cancel) for threads outside any runtime
    pub fn cancel_blocking(&self, name: &str, wait: bool) -> Result<()> {
        let entry = self.entry(name)?;
        entry.token.cancel();

        if wait {
            while !entry.state().is_terminal() {
                std::thread::sleep(CANCEL_POLL_INTERVAL);
            }
        }
        Ok(())
    }

    /// Wait for the named unit, remove it and return its outcome
    pub async fn result(&self, name: &str) -> Result<UnitOutcome> {
        let entry = self.entry(name)?;
        let mut state = entry.state.subscribe();

        tokio::select! {
            biased;
            done = async { state.wait_for(|s| s.is_terminal()).await.map(|_| ()) } => {
                done.map_err(|_| AgentError::SchedulerStopped)?;
            }
            _ = self.inner.shutdown.cancelled() => {
                if !entry.state().is_terminal() {
                    return Err(AgentError::SchedulerStopped);
                }
            }
        }

        self.inner
            .units
            .remove_if(name, |_, held| Arc::ptr_eq(held, &entry));
        let outcome = entry.outcome.lock().take();
        outcome.ok_or_else(|| AgentError::NotFound(name.to_string()))
    }

    /// Blocking [`result`](Self::result) for threads outside any runtime
    pub fn result_blocking(&self, name: &str) -> Result<UnitOutcome> {
        futures::executor::block_on(self.result(name))
    }

    /// Number of registered units
    pub fn len(&self) -> usize {
        self.inner.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.units.is_empty()
    }

    /// Number of gated bodies currently holding a permit
    pub fn running(&self) -> usize {
        self.inner.concurrency - self.inner.gate.available_permits()
    }

    /// Cancel every unit and shut the run-loop down
    pub fn stop(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        info!(
            "Stopping scheduler '{}' ({} units registered)",
            self.inner.name,
            self.len()
        );
        self.inner.shutdown.cancel();

        let thread = self.inner.thread.lock().take();
        if let Some(thread) = thread {
            if thread.thread().id() == std::thread::current().id() {
                return;
            }
            if thread.join().is_err() {
                error!("Scheduler '{}' thread panicked", self.inner.name);
            }
        }
    }
}

impl fmt::Debug for TaskScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskScheduler")
            .field("name", &self.inner.name)
            .field("concurrency", &self.inner.concurrency)
            .field("units", &self.len())
            .finish()
    }
}
