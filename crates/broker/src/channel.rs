//! Broker client seam.
//!
//! The dispatcher and workers only talk to the broker through the
//! [`Broker`], [`BrokerConnection`] and [`BrokerChannel`] traits, which
//! mirror the subset of the AMQP 0-9-1 model they need: queues, exchanges,
//! publish with reply-to, consume with manual or automatic acknowledgment,
//! and per-channel prefetch.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use jobmq_core::ConnectionConfig;

use crate::error::BrokerError;

/// Broker-issued handle for one unacknowledged delivery on a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeliveryTag(pub u64);

impl fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message handed to a consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub body: Vec<u8>,
    /// Address the publisher asked replies to be sent to.
    pub reply_to: Option<String>,
    /// The broker delivered this message before without an ack.
    pub redelivered: bool,
}

/// Stream of deliveries for one consumer. Ends when the consumer is
/// cancelled or its channel closes.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, BrokerError>>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishProperties {
    pub reply_to: Option<String>,
}

impl PublishProperties {
    pub fn reply_to(queue: impl Into<String>) -> Self {
        Self {
            reply_to: Some(queue.into()),
        }
    }
}

/// Queue declaration. An empty name asks the broker to generate one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    /// Restricted to the declaring connection and deleted with it.
    pub exclusive: bool,
    /// Deleted once its last consumer goes away.
    pub auto_delete: bool,
}

impl QueueSpec {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Server-named, exclusive, auto-deleting queue.
    pub fn anonymous() -> Self {
        Self {
            name: String::new(),
            durable: false,
            exclusive: true,
            auto_delete: true,
        }
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    pub fn auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = auto_delete;
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExchangeKind {
    #[default]
    Fanout,
    Direct,
    Topic,
    Headers,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
    pub auto_delete: bool,
}

impl ExchangeSpec {
    pub fn new(name: impl Into<String>, kind: ExchangeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            durable: false,
            auto_delete: false,
        }
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = auto_delete;
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// Deliveries count as acknowledged as soon as they are sent.
    pub auto_ack: bool,
}

impl ConsumeOptions {
    pub fn manual_ack() -> Self {
        Self { auto_ack: false }
    }

    pub fn auto_ack() -> Self {
        Self { auto_ack: true }
    }
}

/// Entry point of a broker client.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn connect(
        &self,
        config: &ConnectionConfig,
    ) -> Result<Box<dyn BrokerConnection>, BrokerError>;
}

#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

/// One AMQP channel. Safe to share between tasks.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Limit unacknowledged deliveries on this channel; `0` is unlimited.
    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), BrokerError>;

    /// Declare (or reuse) a queue, returning its actual name.
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<String, BrokerError>;

    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), BrokerError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError>;

    /// Publish `body`. An empty `exchange` routes directly to the queue
    /// named by `routing_key`.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: PublishProperties,
        body: Vec<u8>,
    ) -> Result<(), BrokerError>;

    async fn consume(
        &self,
        queue: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream, BrokerError>;

    async fn ack(&self, tag: DeliveryTag) -> Result<(), BrokerError>;

    /// Negatively acknowledge one delivery. Without `requeue` the broker
    /// discards it or routes it to the queue's dead-letter exchange.
    async fn reject(&self, tag: DeliveryTag, requeue: bool) -> Result<(), BrokerError>;

    /// Drop all ready messages, returning how many were removed.
    async fn purge_queue(&self, queue: &str) -> Result<u32, BrokerError>;

    /// Delete a queue, returning how many messages it held.
    async fn delete_queue(&self, queue: &str) -> Result<u32, BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}
