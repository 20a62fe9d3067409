//! AMQP 0-9-1 broker client backed by `lapin`.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use jobmq_core::ConnectionConfig;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    BasicRejectOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions, QueueDeleteOptions, QueuePurgeOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{FieldTable, ShortString};
use lapin::uri::{AMQPAuthority, AMQPScheme, AMQPUri, AMQPUserInfo};
use lapin::{BasicProperties, ConnectionProperties};

use crate::channel::{
    Broker, BrokerChannel, BrokerConnection, ConsumeOptions, Delivery, DeliveryStream,
    DeliveryTag, ExchangeKind, ExchangeSpec, PublishProperties, QueueSpec,
};
use crate::error::BrokerError;

/// Reply code sent when closing channels and connections normally.
const REPLY_SUCCESS: u16 = 200;

/// Connects to a real AMQP broker such as RabbitMQ.
#[derive(Debug, Clone, Copy, Default)]
pub struct AmqpBroker;

impl AmqpBroker {
    pub fn new() -> Self {
        Self
    }
}

fn build_uri(config: &ConnectionConfig) -> AMQPUri {
    AMQPUri {
        scheme: AMQPScheme::AMQP,
        authority: AMQPAuthority {
            userinfo: AMQPUserInfo {
                username: config.user.clone(),
                password: config.password.clone(),
            },
            host: config.host.clone(),
            port: config.port,
        },
        vhost: config.virtual_host.clone(),
        query: Default::default(),
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn connect(
        &self,
        config: &ConnectionConfig,
    ) -> Result<Box<dyn BrokerConnection>, BrokerError> {
        let connection =
            lapin::Connection::connect_uri(build_uri(config), ConnectionProperties::default())
                .await
                .map_err(|e| BrokerError::Connection {
                    target: config.to_string(),
                    message: e.to_string(),
                })?;

        tracing::info!(broker = %config, "Connected to AMQP broker");
        Ok(Box::new(AmqpConnection { inner: connection }))
    }
}

struct AmqpConnection {
    inner: lapin::Connection,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let channel = self
            .inner
            .create_channel()
            .await
            .map_err(|e| BrokerError::Channel(e.to_string()))?;
        // Publishes resolve only once the broker has confirmed them.
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| BrokerError::Channel(e.to_string()))?;
        Ok(Arc::new(AmqpChannel { inner: channel }))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.inner
            .close(REPLY_SUCCESS, "Goodbye")
            .await
            .map_err(|e| BrokerError::operation("connection.close", e))
    }
}

struct AmqpChannel {
    inner: lapin::Channel,
}

fn confirmed(confirmation: Confirmation) -> Result<(), BrokerError> {
    match confirmation {
        Confirmation::Ack(_) => Ok(()),
        Confirmation::Nack(_) => Err(BrokerError::operation(
            "basic.publish",
            "message was nacked by the broker",
        )),
        Confirmation::NotRequested => Err(BrokerError::operation(
            "basic.publish",
            "channel is not in confirm mode",
        )),
    }
}

fn exchange_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::Headers => lapin::ExchangeKind::Headers,
    }
}

fn convert_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let reply_to = delivery
        .properties
        .reply_to()
        .as_ref()
        .map(|queue| queue.as_str().to_string());

    Delivery {
        tag: DeliveryTag(delivery.delivery_tag),
        body: delivery.data,
        reply_to,
        redelivered: delivery.redelivered,
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), BrokerError> {
        self.inner
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|e| BrokerError::operation("basic.qos", e))
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<String, BrokerError> {
        let options = QueueDeclareOptions {
            durable: spec.durable,
            exclusive: spec.exclusive,
            auto_delete: spec.auto_delete,
            ..Default::default()
        };
        let queue = self
            .inner
            .queue_declare(&spec.name, options, FieldTable::default())
            .await
            .map_err(|e| BrokerError::operation("queue.declare", e))?;
        Ok(queue.name().as_str().to_string())
    }

    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), BrokerError> {
        let options = ExchangeDeclareOptions {
            durable: spec.durable,
            auto_delete: spec.auto_delete,
            ..Default::default()
        };
        self.inner
            .exchange_declare(
                &spec.name,
                exchange_kind(spec.kind),
                options,
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::operation("exchange.declare", e))
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.inner
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::operation("queue.bind", e))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: PublishProperties,
        body: Vec<u8>,
    ) -> Result<(), BrokerError> {
        let mut amqp_properties = BasicProperties::default();
        if let Some(reply_to) = properties.reply_to {
            amqp_properties = amqp_properties.with_reply_to(ShortString::from(reply_to));
        }

        let confirmation = self
            .inner
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &body,
                amqp_properties,
            )
            .await
            .map_err(|e| BrokerError::operation("basic.publish", e))?
            .await
            .map_err(|e| BrokerError::operation("basic.publish", e))?;
        confirmed(confirmation)
    }

    async fn consume(
        &self,
        queue: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream, BrokerError> {
        let consumer_tag = format!("jobmq-{}", uuid::Uuid::new_v4());
        let consumer = self
            .inner
            .basic_consume(
                queue,
                &consumer_tag,
                BasicConsumeOptions {
                    no_ack: options.auto_ack,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::operation("basic.consume", e))?;

        tracing::debug!(queue, consumer_tag = %consumer_tag, "Consumer registered");

        Ok(consumer
            .map(|item| {
                item.map(convert_delivery)
                    .map_err(|e| BrokerError::operation("basic.deliver", e))
            })
            .boxed())
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<(), BrokerError> {
        self.inner
            .basic_ack(tag.0, BasicAckOptions::default())
            .await
            .map_err(|e| BrokerError::operation("basic.ack", e))
    }

    async fn reject(&self, tag: DeliveryTag, requeue: bool) -> Result<(), BrokerError> {
        self.inner
            .basic_reject(tag.0, BasicRejectOptions { requeue })
            .await
            .map_err(|e| BrokerError::operation("basic.reject", e))
    }

    async fn purge_queue(&self, queue: &str) -> Result<u32, BrokerError> {
        self.inner
            .queue_purge(queue, QueuePurgeOptions::default())
            .await
            .map_err(|e| BrokerError::operation("queue.purge", e))
    }

    async fn delete_queue(&self, queue: &str) -> Result<u32, BrokerError> {
        self.inner
            .queue_delete(queue, QueueDeleteOptions::default())
            .await
            .map_err(|e| BrokerError::operation("queue.delete", e))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.inner
            .close(REPLY_SUCCESS, "Goodbye")
            .await
            .map_err(|e| BrokerError::operation("channel.close", e))
    }
}
