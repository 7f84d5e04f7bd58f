//! Best-effort reply publishing

use crate::broker::{Publisher, ReplyTarget};
use crate::metrics::AgentMetrics;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error};

/// One-shot flag guarding the reply of a single unit
#[derive(Debug, Default)]
pub struct ReplyGuard(AtomicBool);

impl ReplyGuard {
    pub fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    /// Returns `true` for exactly one caller
    pub fn claim(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_claimed(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Serializes results and hands them to the [`Publisher`]
///
/// Failures are logged and swallowed; a lost reply is never retried.
#[derive(Clone)]
pub struct ReplyChannel {
    publisher: Arc<dyn Publisher>,
    block: bool,
    metrics: Option<AgentMetrics>,
}

impl ReplyChannel {
    pub fn new(publisher: Arc<dyn Publisher>, block: bool) -> Self {
        Self {
            publisher,
            block,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: AgentMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Publish `result` to `target`; returns whether the publish succeeded
    pub async fn reply<T: Serialize>(&self, result: T, target: &ReplyTarget) -> bool {
        let payload = match serde_json::to_vec(&result) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to serialize reply for {}: {}", target, e);
                self.record_failure();
                return false;
            }
        };

        match self.publisher.publish(payload, target, self.block).await {
            Ok(()) => {
                debug!("Reply published to {}", target);
                true
            }
            Err(e) => {
                error!("Failed to publish reply to {}: {}", target, e);
                self.record_failure();
                false
            }
        }
    }

    /// Publish only if `guard` has not been claimed yet
    pub async fn reply_once<T: Serialize>(
        &self,
        guard: &ReplyGuard,
        result: T,
        target: &ReplyTarget,
    ) -> bool {
        if !guard.claim() {
            debug!("Reply to {} already sent, skipping", target);
            return false;
        }
        self.reply(result, target).await
    }

    fn record_failure(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.reply_failed();
        }
    }
}
