//! Broker-side actions run on a freshly opened channel before a worker
//! starts accepting deliveries.

use async_trait::async_trait;

use crate::channel::{BrokerChannel, ExchangeSpec, QueueSpec};
use crate::error::BrokerError;

#[async_trait]
pub trait ChannelAction: Send + Sync {
    async fn perform(&self, channel: &dyn BrokerChannel) -> Result<(), BrokerError>;
}

#[async_trait]
impl<A: ChannelAction + ?Sized> ChannelAction for Box<A> {
    async fn perform(&self, channel: &dyn BrokerChannel) -> Result<(), BrokerError> {
        (**self).perform(channel).await
    }
}

/// Does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAction;

#[async_trait]
impl ChannelAction for NoAction {
    async fn perform(&self, _channel: &dyn BrokerChannel) -> Result<(), BrokerError> {
        Ok(())
    }
}

/// Declares a queue, e.g. the durable work queue workers consume from.
#[derive(Debug, Clone)]
pub struct DeclareQueue(pub QueueSpec);

#[async_trait]
impl ChannelAction for DeclareQueue {
    async fn perform(&self, channel: &dyn BrokerChannel) -> Result<(), BrokerError> {
        let name = channel.declare_queue(&self.0).await?;
        tracing::info!(queue = %name, durable = self.0.durable, "Declared queue");
        Ok(())
    }
}

/// Declares an exchange workers can bind anonymous queues to.
#[derive(Debug, Clone)]
pub struct DeclareExchange(pub ExchangeSpec);

#[async_trait]
impl ChannelAction for DeclareExchange {
    async fn perform(&self, channel: &dyn BrokerChannel) -> Result<(), BrokerError> {
        channel.declare_exchange(&self.0).await?;
        tracing::info!(exchange = %self.0.name, kind = ?self.0.kind, "Declared exchange");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use jobmq_core::ConnectionConfig;

    use super::*;
    use crate::channel::{Broker, ExchangeKind, PublishProperties};
    use crate::memory::MemoryBroker;

    #[tokio::test]
    async fn declare_queue_creates_it() {
        let broker = MemoryBroker::new();
        let conn = broker.connect(&ConnectionConfig::default()).await.expect("connect");
        let channel = conn.create_channel().await.expect("channel");

        DeclareQueue(QueueSpec::named("work").durable(true))
            .perform(channel.as_ref())
            .await
            .expect("declare");

        assert_eq!(broker.queue_len("work"), Some(0));
    }

    #[tokio::test]
    async fn declare_exchange_accepts_publishes() {
        let broker = MemoryBroker::new();
        let conn = broker.connect(&ConnectionConfig::default()).await.expect("connect");
        let channel = conn.create_channel().await.expect("channel");

        DeclareExchange(ExchangeSpec::new("commands", ExchangeKind::Fanout))
            .perform(channel.as_ref())
            .await
            .expect("declare");

        channel
            .publish("commands", "", PublishProperties::default(), b"hello".to_vec())
            .await
            .expect("publish to declared exchange");
    }

    #[tokio::test]
    async fn no_action_is_noop() {
        let broker = MemoryBroker::new();
        let conn = broker.connect(&ConnectionConfig::default()).await.expect("connect");
        let channel = conn.create_channel().await.expect("channel");

        NoAction.perform(channel.as_ref()).await.expect("noop");
    }
}
