//! Message broker seam for jobmq.
//!
//! - [`channel`]: the `Broker` / `BrokerConnection` / `BrokerChannel` traits.
//! - [`amqp`]: the production client, backed by `lapin`.
//! - [`memory`]: an in-process broker for tests and single-process setups.
//! - [`context`]: a connection plus channel owned by one component.
//! - [`action`]: declarations run on a channel before consuming starts.

pub mod action;
pub mod amqp;
pub mod channel;
pub mod context;
pub mod error;
pub mod memory;

pub use action::{ChannelAction, DeclareExchange, DeclareQueue, NoAction};
pub use amqp::AmqpBroker;
pub use channel::{
    Broker, BrokerChannel, BrokerConnection, ConsumeOptions, Delivery, DeliveryStream,
    DeliveryTag, ExchangeKind, ExchangeSpec, PublishProperties, QueueSpec,
};
pub use context::ConnectionContext;
pub use error::BrokerError;
pub use memory::{MemoryBroker, PublishedMessage};
