//! Inbound message routing
//!
//! The [`FrontDoor`] takes raw deliveries off the transport without blocking
//! and hands them to a fixed pool of worker threads. Each worker decodes the
//! body, builds the typed task and either answers it directly (info) or
//! submits its command unit to the scheduler (gather).

use crate::broker::DeliveryMeta;
use crate::error::{AgentError, Result};
use crate::models::TaskType;
use crate::task::{GatherTask, InfoTask, TaskContext};
use crossbeam::channel::{unbounded, Receiver, Sender};
use serde_json::{Map, Value};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

/// Decoded message body with its resolved type
#[derive(Debug, Clone, PartialEq)]
pub struct Body {
    /// Wire type; empty when the payload could not be decoded
    pub task_type: String,
    pub value: Value,
}

/// Parse a raw payload
///
/// Undecodable payloads and non-objects yield an empty type; a missing type
/// becomes `unknown`.
pub fn decode(raw: &[u8]) -> Body {
    let value = match serde_json::from_slice::<Value>(raw) {
        Ok(value @ Value::Object(_)) => value,
        Ok(other) => {
            error!("Task body is not an object: {}", other);
            return Body {
                task_type: String::new(),
                value: Value::Object(Map::new()),
            };
        }
        Err(e) => {
            error!("Failed to decode task body: {}", e);
            return Body {
                task_type: String::new(),
                value: Value::Object(Map::new()),
            };
        }
    };

    let task_type = match value.get("type") {
        None => TaskType::Unknown.as_str().to_string(),
        Some(Value::String(t)) => t.clone(),
        Some(other) => other.to_string(),
    };
    Body { task_type, value }
}

/// What happened to one inbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routed {
    /// Info task answered
    Info { id: String },
    /// Gather unit handed to the scheduler under `name`
    Submitted { id: String, name: String },
    /// Gather task valid but the scheduler no longer accepts units
    NotScheduled { id: String },
    /// Validation failed; a rejection was sent if a reply target was known
    Rejected { id: Option<String>, reason: String },
    /// Recognized type with no handler
    Unsupported { task_type: String },
    /// Unknown or undecodable message
    Dropped { task_type: String },
}

/// Builds typed tasks from decoded bodies and runs them
pub struct Dispatcher {
    ctx: TaskContext,
}

impl Dispatcher {
    pub fn new(ctx: TaskContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &TaskContext {
        &self.ctx
    }

    /// Decode and route one raw delivery
    pub fn handle(&self, raw: &[u8], meta: DeliveryMeta) -> Routed {
        let body = decode(raw);
        debug!("Receiving task: {}", body.value);
        debug!("Msg properties: {:?}", meta);
        self.route(body, meta)
    }

    pub fn route(&self, body: Body, meta: DeliveryMeta) -> Routed {
        match TaskType::parse(&body.task_type) {
            Some(TaskType::Info) => self.route_info(&body.value, &meta),
            Some(TaskType::Gather) => self.route_gather(body.value, meta),
            Some(TaskType::Unknown) => {
                warn!("Unknown type");
                Routed::Dropped {
                    task_type: body.task_type,
                }
            }
            Some(TaskType::Detect | TaskType::Scan | TaskType::Site) => {
                warn!("This type is not supported: {}", body.task_type);
                Routed::Unsupported {
                    task_type: body.task_type,
                }
            }
            None => {
                warn!("This type is not supported: '{}'", body.task_type);
                Routed::Dropped {
                    task_type: body.task_type,
                }
            }
        }
    }

    fn route_info(&self, value: &Value, meta: &DeliveryMeta) -> Routed {
        match InfoTask::new(value, meta) {
            Ok(task) => {
                let id = task.id().to_string();
                task.run(&self.ctx);
                Routed::Info { id }
            }
            Err(e) => {
                warn!("Info task dropped: {}", e);
                Routed::Rejected {
                    id: None,
                    reason: e.to_string(),
                }
            }
        }
    }

    fn route_gather(&self, value: Value, meta: DeliveryMeta) -> Routed {
        let mut task = GatherTask::new(value, meta);
        if let Err(e) = task.check(&self.ctx) {
            warn!("Check failed for task {:?}", task.id());
            return Routed::Rejected {
                id: task.id().map(str::to_string),
                reason: e.to_string(),
            };
        }

        let id = task.id().unwrap_or_default().to_string();
        match task.run(&self.ctx) {
            Some(name) => Routed::Submitted { id, name },
            None => Routed::NotScheduled { id },
        }
    }
}

type Inbound = (Vec<u8>, DeliveryMeta);

/// Cloneable non-blocking entry point for the transport callback
#[derive(Clone)]
pub struct Inbox {
    sender: Sender<Inbound>,
}

impl Inbox {
    /// Queue a delivery; returns `false` once the front door is shut
    pub fn push(&self, payload: Vec<u8>, meta: DeliveryMeta) -> bool {
        match self.sender.send((payload, meta)) {
            Ok(()) => true,
            Err(_) => {
                warn!("Front door closed, delivery discarded");
                false
            }
        }
    }
}

/// Fixed pool of worker threads draining an unbounded queue
pub struct FrontDoor {
    sender: Option<Sender<Inbound>>,
    workers: Vec<JoinHandle<()>>,
}

impl FrontDoor {
    pub fn start(dispatcher: Arc<Dispatcher>, workers: usize) -> Result<Self> {
        let (sender, receiver) = unbounded::<Inbound>();
        let count = workers.max(1);

        let mut handles = Vec::with_capacity(count);
        for i in 0..count {
            let receiver = receiver.clone();
            let dispatcher = dispatcher.clone();
            let handle = std::thread::Builder::new()
                .name(format!("front-door-{}", i))
                .spawn(move || work(dispatcher, receiver))
                .map_err(|e| AgentError::Other(format!("failed to spawn front door worker: {}", e)))?;
            handles.push(handle);
        }

        info!("Front door started with {} workers", count);
        Ok(Self {
            sender: Some(sender),
            workers: handles,
        })
    }

    pub fn inbox(&self) -> Option<Inbox> {
        self.sender.as_ref().map(|sender| Inbox {
            sender: sender.clone(),
        })
    }

    /// Messages waiting for a worker
    pub fn backlog(&self) -> usize {
        self.sender.as_ref().map_or(0, Sender::len)
    }

    /// Close the queue and join the workers once it is drained
    ///
    /// Inboxes handed out earlier keep the queue open until they are dropped.
    pub fn shutdown(&mut self) {
        self.sender.take();
        for worker in self.workers.drain(..) {
            let name = worker.thread().name().unwrap_or("front-door").to_string();
            if worker.join().is_err() {
                error!("Worker {} panicked", name);
            }
        }
        info!("Front door stopped");
    }
}

impl Drop for FrontDoor {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            self.shutdown();
        }
    }
}

fn work(dispatcher: Arc<Dispatcher>, receiver: Receiver<Inbound>) {
    for (payload, meta) in receiver.iter() {
        match catch_unwind(AssertUnwindSafe(|| dispatcher.handle(&payload, meta))) {
            Ok(routed) => debug!("Routed: {:?}", routed),
            Err(_) => error!("Dispatch panicked, message dropped"),
        }
    }
}
