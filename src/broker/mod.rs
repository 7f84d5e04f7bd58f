//! Transport seams between the agent core and the message broker
//!
//! The core only needs two capabilities: an inbound feed of
//! `(payload, DeliveryMeta)` pairs and a [`Publisher`] for replies. The AMQP
//! adapter in [`amqp`] provides both.

pub mod amqp;
pub mod pool;

use crate::error::{AgentError, Result};
use async_trait::async_trait;
use std::fmt;

/// Transport metadata attached to an inbound message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryMeta {
    /// Reply address in `<exchange>/<routing_key>` form
    pub reply_to: Option<String>,
}

impl DeliveryMeta {
    pub fn with_reply_to(reply_to: impl Into<String>) -> Self {
        Self {
            reply_to: Some(reply_to.into()),
        }
    }
}

/// Parsed reply address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyTarget {
    pub exchange: String,
    pub routing_key: String,
}

impl ReplyTarget {
    pub fn new(exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
        }
    }

    /// Split `"exchange/routing_key"` on the first `/`
    pub fn parse(reply_to: &str) -> Result<Self> {
        reply_to
            .split_once('/')
            .map(|(exchange, routing_key)| Self::new(exchange, routing_key))
            .ok_or_else(|| AgentError::InvalidReplyTarget(reply_to.to_string()))
    }
}

impl fmt::Display for ReplyTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.exchange, self.routing_key)
    }
}

/// Publishing capability used by the reply channel
///
/// `block` selects whether a publish may wait for a free producer or fails
/// immediately when all producers are busy.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, payload: Vec<u8>, target: &ReplyTarget, block: bool) -> Result<()>;
}
