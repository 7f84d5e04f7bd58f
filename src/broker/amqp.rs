//! AMQP transport built on lapin

use super::pool::{Pool, PoolError};
use super::{DeliveryMeta, Publisher, ReplyTarget};
use crate::config::{BrokerConfig, TopologyConfig};
use crate::error::{AgentError, Result};
use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Broker connection holding one consuming channel and a producer pool
pub struct AmqpTransport {
    connection: Connection,
    consumer_channel: Channel,
    producers: Pool<Channel>,
    config: BrokerConfig,
}

impl AmqpTransport {
    pub async fn connect(config: &BrokerConfig) -> Result<Self> {
        let connection = Connection::connect(
            &config.url,
            ConnectionProperties::default().with_connection_name("remexec".into()),
        )
        .await
        .map_err(|e| AgentError::Broker(format!("connection failed: {}", e)))?;
        info!("Connected to broker {}", config.masked_url());

        let consumer_channel = connection.create_channel().await?;
        consumer_channel
            .basic_qos(config.prefetch, BasicQosOptions::default())
            .await?;

        if let Some(topology) = &config.topology {
            declare_topology(&consumer_channel, &config.queue, topology).await?;
        }

        let mut channels = Vec::with_capacity(config.producer_pool_size);
        for _ in 0..config.producer_pool_size.max(1) {
            channels.push(connection.create_channel().await?);
        }
        debug!("Producer pool ready ({} channels)", channels.len());

        Ok(Self {
            connection,
            consumer_channel,
            producers: Pool::new(channels),
            config: config.clone(),
        })
    }

    /// Publisher sharing this connection's producer pool
    pub fn publisher(&self) -> AmqpPublisher {
        AmqpPublisher {
            producers: self.producers.clone(),
        }
    }

    /// Feed deliveries to `on_delivery` until `shutdown` fires
    ///
    /// The callback must not block; it is invoked on the consuming task.
    pub async fn consume<F>(&self, on_delivery: F, shutdown: CancellationToken) -> Result<()>
    where
        F: Fn(Vec<u8>, DeliveryMeta),
    {
        let mut consumer = self
            .consumer_channel
            .basic_consume(
                &self.config.queue,
                &self.config.consumer_tag,
                BasicConsumeOptions {
                    no_ack: self.config.no_ack,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        info!(
            "Consuming from '{}' (no_ack={})",
            self.config.queue, self.config.no_ack
        );

        loop {
            let delivery = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = consumer.next() => next,
            };

            let delivery = match delivery {
                Some(Ok(delivery)) => delivery,
                Some(Err(e)) => {
                    error!("Consumer error: {}", e);
                    return Err(e.into());
                }
                None => {
                    warn!("Consumer stream ended");
                    break;
                }
            };

            let meta = DeliveryMeta {
                reply_to: delivery
                    .properties
                    .reply_to()
                    .as_ref()
                    .map(|r| r.as_str().to_string()),
            };

            if !self.config.no_ack {
                if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                    warn!("Failed to ack delivery {}: {}", delivery.delivery_tag, e);
                }
            }

            on_delivery(delivery.data, meta);
        }

        Ok(())
    }

    pub async fn close(&self) -> Result<()> {
        self.producers.close();
        self.connection.close(200, "shutdown").await?;
        info!("Broker connection closed");
        Ok(())
    }
}

fn exchange_kind(name: &str) -> ExchangeKind {
    match name.to_ascii_lowercase().as_str() {
        "direct" => ExchangeKind::Direct,
        "fanout" => ExchangeKind::Fanout,
        "topic" => ExchangeKind::Topic,
        "headers" => ExchangeKind::Headers,
        _ => ExchangeKind::Custom(name.to_string()),
    }
}

async fn declare_topology(channel: &Channel, queue: &str, topology: &TopologyConfig) -> Result<()> {
    channel
        .exchange_declare(
            &topology.exchange,
            exchange_kind(&topology.exchange_type),
            ExchangeDeclareOptions {
                durable: topology.durable,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await?;

    channel
        .queue_declare(
            queue,
            QueueDeclareOptions {
                durable: topology.durable,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await?;

    channel
        .queue_bind(
            queue,
            &topology.exchange,
            &topology.routing_key,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await?;

    info!(
        "Declared exchange '{}' ({}) bound to '{}' via '{}'",
        topology.exchange, topology.exchange_type, queue, topology.routing_key
    );
    Ok(())
}

/// [`Publisher`] over pooled AMQP channels
#[derive(Clone)]
pub struct AmqpPublisher {
    producers: Pool<Channel>,
}

#[async_trait]
impl Publisher for AmqpPublisher {
    async fn publish(&self, payload: Vec<u8>, target: &ReplyTarget, block: bool) -> Result<()> {
        let channel = self.producers.acquire(block).await.map_err(|e| match e {
            PoolError::Exhausted => AgentError::Broker("no free producer".to_string()),
            PoolError::Closed => AgentError::Broker("producer pool closed".to_string()),
        })?;

        let confirm = channel
            .basic_publish(
                &target.exchange,
                &target.routing_key,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default().with_content_type("application/json".into()),
            )
            .await?;
        confirm.await?;

        debug!("Published {} bytes to {}", payload.len(), target);
        Ok(())
    }
}
