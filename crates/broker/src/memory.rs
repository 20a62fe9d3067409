//! In-process broker.
//!
//! [`MemoryBroker`] implements the broker seam without a network: named
//! and server-named queues, fanout/direct exchanges, round-robin
//! consumers, per-channel prefetch, manual or automatic acknowledgment,
//! and redelivery of unacknowledged messages when a channel closes.
//!
//! It backs the test suites and co-located setups where the dispatcher
//! and workers share one process. Inspection helpers and fault switches
//! let tests observe acks and simulate broker failures.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::StreamExt;
use jobmq_core::ConnectionConfig;

use crate::channel::{
    Broker, BrokerChannel, BrokerConnection, ConsumeOptions, Delivery, DeliveryStream,
    DeliveryTag, ExchangeKind, ExchangeSpec, PublishProperties, QueueSpec,
};
use crate::error::BrokerError;

/// A message recorded by [`MemoryBroker::published`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub reply_to: Option<String>,
    pub body: Vec<u8>,
}

/// Shared handle to an in-process broker. Clones refer to the same broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
}

#[derive(Default)]
struct State {
    next_id: u64,
    connections: HashSet<u64>,
    channels: HashMap<u64, ChannelState>,
    consumers: HashMap<u64, ConsumerState>,
    queues: HashMap<String, Queue>,
    exchanges: HashMap<String, Exchange>,
    published: Vec<PublishedMessage>,
    acked: Vec<Vec<u8>>,
    rejected: Vec<Vec<u8>>,
    faults: Faults,
}

#[derive(Default)]
struct Faults {
    connect: bool,
    /// Publishes that may still succeed before every publish fails.
    publish_budget: Option<usize>,
    purge: bool,
    delete: bool,
}

#[derive(Clone)]
struct Message {
    body: Vec<u8>,
    reply_to: Option<String>,
    redelivered: bool,
}

#[derive(Default)]
struct Queue {
    messages: VecDeque<Message>,
    consumers: Vec<u64>,
    cursor: usize,
    /// Owning connection of an exclusive queue.
    owner: Option<u64>,
    auto_delete: bool,
}

struct Exchange {
    kind: ExchangeKind,
    /// `(queue, routing key)` pairs.
    bindings: Vec<(String, String)>,
}

struct ChannelState {
    connection: u64,
    prefetch: u16,
    last_tag: u64,
    unacked: BTreeMap<u64, Unacked>,
}

struct Unacked {
    queue: String,
    message: Message,
}

struct ConsumerState {
    channel: u64,
    queue: String,
    auto_ack: bool,
    sender: mpsc::UnboundedSender<Result<Delivery, BrokerError>>,
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn channel_mut(&mut self, id: u64) -> Result<&mut ChannelState, BrokerError> {
        self.channels.get_mut(&id).ok_or(BrokerError::Closed)
    }

    fn has_capacity(&self, consumer_id: u64) -> bool {
        let Some(consumer) = self.consumers.get(&consumer_id) else {
            return false;
        };
        let Some(channel) = self.channels.get(&consumer.channel) else {
            return false;
        };
        !consumer.sender.is_closed()
            && (consumer.auto_ack
                || channel.prefetch == 0
                || channel.unacked.len() < usize::from(channel.prefetch))
    }

    /// Hand ready messages of `queue` to consumers with spare capacity.
    fn pump(&mut self, queue: &str) {
        loop {
            let Some(q) = self.queues.get(queue) else {
                return;
            };
            if q.messages.is_empty() || q.consumers.is_empty() {
                return;
            }

            let consumers = q.consumers.clone();
            let start = q.cursor;
            let chosen = (0..consumers.len())
                .map(|offset| (start + offset) % consumers.len())
                .find(|&pos| self.has_capacity(consumers[pos]));
            let Some(pos) = chosen else {
                return;
            };
            let consumer_id = consumers[pos];

            let Some((channel_id, auto_ack, sender)) = self
                .consumers
                .get(&consumer_id)
                .map(|c| (c.channel, c.auto_ack, c.sender.clone()))
            else {
                return;
            };

            let Some(message) = self.queues.get_mut(queue).and_then(|q| {
                q.cursor = (pos + 1) % consumers.len();
                q.messages.pop_front()
            }) else {
                return;
            };

            let Some(channel) = self.channels.get_mut(&channel_id) else {
                return;
            };
            channel.last_tag += 1;
            let tag = DeliveryTag(channel.last_tag);
            if !auto_ack {
                channel.unacked.insert(
                    tag.0,
                    Unacked {
                        queue: queue.to_string(),
                        message: message.clone(),
                    },
                );
            }

            let delivery = Delivery {
                tag,
                body: message.body.clone(),
                reply_to: message.reply_to.clone(),
                redelivered: message.redelivered,
            };

            if sender.unbounded_send(Ok(delivery)).is_err() {
                // The consumer's stream was dropped; put the message back.
                if let Some(channel) = self.channels.get_mut(&channel_id) {
                    channel.unacked.remove(&tag.0);
                }
                self.remove_consumer(consumer_id);
                if let Some(q) = self.queues.get_mut(queue) {
                    q.messages.push_front(message);
                }
            }
        }
    }

    fn remove_consumer(&mut self, consumer_id: u64) {
        let Some(consumer) = self.consumers.remove(&consumer_id) else {
            return;
        };
        let mut delete = false;
        if let Some(q) = self.queues.get_mut(&consumer.queue) {
            q.consumers.retain(|&id| id != consumer_id);
            q.cursor = 0;
            delete = q.auto_delete && q.consumers.is_empty();
        }
        if delete {
            self.remove_queue(&consumer.queue);
        }
    }

    fn remove_queue(&mut self, name: &str) -> u32 {
        let Some(queue) = self.queues.remove(name) else {
            return 0;
        };
        for consumer_id in queue.consumers {
            self.consumers.remove(&consumer_id);
        }
        for exchange in self.exchanges.values_mut() {
            exchange.bindings.retain(|(bound, _)| bound != name);
        }
        u32::try_from(queue.messages.len()).unwrap_or(u32::MAX)
    }

    fn close_channel(&mut self, id: u64) -> Result<(), BrokerError> {
        let mut channel = self.channels.remove(&id).ok_or(BrokerError::Closed)?;

        let consumer_ids: Vec<u64> = self
            .consumers
            .iter()
            .filter(|(_, c)| c.channel == id)
            .map(|(&cid, _)| cid)
            .collect();
        for consumer_id in consumer_ids {
            self.remove_consumer(consumer_id);
        }

        // Requeue unacknowledged messages at the head, in delivery order.
        let mut touched = BTreeSet::new();
        let unacked = std::mem::take(&mut channel.unacked);
        for (_, entry) in unacked.into_iter().rev() {
            if let Some(q) = self.queues.get_mut(&entry.queue) {
                let mut message = entry.message;
                message.redelivered = true;
                q.messages.push_front(message);
                touched.insert(entry.queue);
            }
        }
        for queue in touched {
            self.pump(&queue);
        }
        Ok(())
    }

    fn route(&mut self, exchange: &str, routing_key: &str) -> Result<Vec<String>, BrokerError> {
        if exchange.is_empty() {
            return Ok(vec![routing_key.to_string()]);
        }
        let ex = self.exchanges.get(exchange).ok_or_else(|| {
            BrokerError::operation("basic.publish", format!("no exchange '{exchange}'"))
        })?;
        Ok(ex
            .bindings
            .iter()
            .filter(|(_, key)| match ex.kind {
                ExchangeKind::Fanout => true,
                _ => key == routing_key || key == "#",
            })
            .map(|(queue, _)| queue.clone())
            .collect())
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish directly to a queue, bypassing any connection.
    pub fn inject(&self, queue: &str, body: impl Into<Vec<u8>>, reply_to: Option<&str>) {
        let mut state = self.lock();
        if let Some(q) = state.queues.get_mut(queue) {
            q.messages.push_back(Message {
                body: body.into(),
                reply_to: reply_to.map(str::to_string),
                redelivered: false,
            });
        }
        state.pump(queue);
    }

    /// Create a queue outside of any connection.
    pub fn declare_queue(&self, name: &str) {
        self.lock().queues.entry(name.to_string()).or_default();
    }

    // ---- inspection ----

    /// Ready (undelivered) messages in `queue`, `None` if it does not exist.
    pub fn queue_len(&self, queue: &str) -> Option<usize> {
        self.lock().queues.get(queue).map(|q| q.messages.len())
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        self.lock().queues.contains_key(queue)
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.consumers.len())
    }

    /// Deliveries awaiting an ack across all channels.
    pub fn unacked_count(&self) -> usize {
        self.lock().channels.values().map(|c| c.unacked.len()).sum()
    }

    pub fn open_connections(&self) -> usize {
        self.lock().connections.len()
    }

    /// Every successful publish, in order.
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.lock().published.clone()
    }

    /// Bodies of explicitly acknowledged deliveries, in ack order.
    pub fn acked(&self) -> Vec<Vec<u8>> {
        self.lock().acked.clone()
    }

    /// Bodies of rejected deliveries, in reject order.
    pub fn rejected(&self) -> Vec<Vec<u8>> {
        self.lock().rejected.clone()
    }

    // ---- fault injection ----

    pub fn fail_connect(&self, fail: bool) {
        self.lock().faults.connect = fail;
    }

    /// Let `successes` more publishes through, then fail every publish.
    pub fn fail_publish_after(&self, successes: usize) {
        self.lock().faults.publish_budget = Some(successes);
    }

    pub fn fail_purge(&self, fail: bool) {
        self.lock().faults.purge = fail;
    }

    pub fn fail_delete(&self, fail: bool) {
        self.lock().faults.delete = fail;
    }

    /// Push a consumer error to every consumer of `queue`.
    pub fn break_consumers(&self, queue: &str) {
        let state = self.lock();
        for consumer in state.consumers.values().filter(|c| c.queue == queue) {
            let _ = consumer.sender.unbounded_send(Err(BrokerError::operation(
                "basic.deliver",
                "consumer failed",
            )));
        }
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(
        &self,
        config: &ConnectionConfig,
    ) -> Result<Box<dyn BrokerConnection>, BrokerError> {
        let mut state = self.lock();
        if state.faults.connect {
            return Err(BrokerError::Connection {
                target: config.to_string(),
                message: "connection refused".into(),
            });
        }
        let id = state.next_id();
        state.connections.insert(id);
        Ok(Box::new(MemoryConnection {
            id,
            broker: self.clone(),
        }))
    }
}

struct MemoryConnection {
    id: u64,
    broker: MemoryBroker,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let mut state = self.broker.lock();
        if !state.connections.contains(&self.id) {
            return Err(BrokerError::Closed);
        }
        let id = state.next_id();
        state.channels.insert(
            id,
            ChannelState {
                connection: self.id,
                prefetch: 0,
                last_tag: 0,
                unacked: BTreeMap::new(),
            },
        );
        Ok(Arc::new(MemoryChannel {
            id,
            connection: self.id,
            broker: self.broker.clone(),
        }))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let mut state = self.broker.lock();
        if !state.connections.remove(&self.id) {
            return Err(BrokerError::Closed);
        }

        let channel_ids: Vec<u64> = state
            .channels
            .iter()
            .filter(|(_, c)| c.connection == self.id)
            .map(|(&id, _)| id)
            .collect();
        for id in channel_ids {
            let _ = state.close_channel(id);
        }

        let exclusive: Vec<String> = state
            .queues
            .iter()
            .filter(|(_, q)| q.owner == Some(self.id))
            .map(|(name, _)| name.clone())
            .collect();
        for name in exclusive {
            state.remove_queue(&name);
        }
        Ok(())
    }
}

struct MemoryChannel {
    id: u64,
    connection: u64,
    broker: MemoryBroker,
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), BrokerError> {
        let mut state = self.broker.lock();
        state.channel_mut(self.id)?.prefetch = prefetch_count;
        Ok(())
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<String, BrokerError> {
        let mut state = self.broker.lock();
        state.channel_mut(self.id)?;

        let name = if spec.name.is_empty() {
            format!("amq.gen-{}", uuid::Uuid::new_v4())
        } else {
            spec.name.clone()
        };
        let owner = spec.exclusive.then_some(self.connection);
        state.queues.entry(name.clone()).or_insert_with(|| Queue {
            owner,
            auto_delete: spec.auto_delete,
            ..Default::default()
        });
        Ok(name)
    }

    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), BrokerError> {
        let mut state = self.broker.lock();
        state.channel_mut(self.id)?;
        state
            .exchanges
            .entry(spec.name.clone())
            .or_insert_with(|| Exchange {
                kind: spec.kind,
                bindings: Vec::new(),
            });
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        let mut state = self.broker.lock();
        state.channel_mut(self.id)?;
        if !state.queues.contains_key(queue) {
            return Err(BrokerError::operation(
                "queue.bind",
                format!("no queue '{queue}'"),
            ));
        }
        let ex = state.exchanges.get_mut(exchange).ok_or_else(|| {
            BrokerError::operation("queue.bind", format!("no exchange '{exchange}'"))
        })?;
        ex.bindings.push((queue.to_string(), routing_key.to_string()));
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: PublishProperties,
        body: Vec<u8>,
    ) -> Result<(), BrokerError> {
        let mut state = self.broker.lock();
        state.channel_mut(self.id)?;

        match state.faults.publish_budget {
            Some(0) => {
                return Err(BrokerError::operation("basic.publish", "publish refused"));
            }
            Some(n) => state.faults.publish_budget = Some(n - 1),
            None => {}
        }

        let targets = state.route(exchange, routing_key)?;
        for queue in &targets {
            // Unroutable messages are dropped, as with a non-mandatory publish.
            if let Some(q) = state.queues.get_mut(queue) {
                q.messages.push_back(Message {
                    body: body.clone(),
                    reply_to: properties.reply_to.clone(),
                    redelivered: false,
                });
            }
        }
        state.published.push(PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            reply_to: properties.reply_to,
            body,
        });
        for queue in &targets {
            state.pump(queue);
        }
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream, BrokerError> {
        let mut state = self.broker.lock();
        state.channel_mut(self.id)?;
        if !state.queues.contains_key(queue) {
            return Err(BrokerError::operation(
                "basic.consume",
                format!("no queue '{queue}'"),
            ));
        }

        let (sender, receiver) = mpsc::unbounded();
        let consumer_id = state.next_id();
        state.consumers.insert(
            consumer_id,
            ConsumerState {
                channel: self.id,
                queue: queue.to_string(),
                auto_ack: options.auto_ack,
                sender,
            },
        );
        if let Some(q) = state.queues.get_mut(queue) {
            q.consumers.push(consumer_id);
        }
        state.pump(queue);

        Ok(receiver.boxed())
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<(), BrokerError> {
        let mut state = self.broker.lock();
        let entry = state
            .channel_mut(self.id)?
            .unacked
            .remove(&tag.0)
            .ok_or_else(|| {
                BrokerError::operation("basic.ack", format!("unknown delivery tag {tag}"))
            })?;
        state.acked.push(entry.message.body);
        state.pump(&entry.queue);
        Ok(())
    }

    async fn reject(&self, tag: DeliveryTag, requeue: bool) -> Result<(), BrokerError> {
        let mut state = self.broker.lock();
        let entry = state
            .channel_mut(self.id)?
            .unacked
            .remove(&tag.0)
            .ok_or_else(|| {
                BrokerError::operation("basic.reject", format!("unknown delivery tag {tag}"))
            })?;
        state.rejected.push(entry.message.body.clone());
        if requeue {
            if let Some(q) = state.queues.get_mut(&entry.queue) {
                let mut message = entry.message;
                message.redelivered = true;
                q.messages.push_front(message);
            }
        }
        state.pump(&entry.queue);
        Ok(())
    }

    async fn purge_queue(&self, queue: &str) -> Result<u32, BrokerError> {
        let mut state = self.broker.lock();
        state.channel_mut(self.id)?;
        if state.faults.purge {
            return Err(BrokerError::operation("queue.purge", "purge refused"));
        }
        let q = state.queues.get_mut(queue).ok_or_else(|| {
            BrokerError::operation("queue.purge", format!("no queue '{queue}'"))
        })?;
        let purged = q.messages.len();
        q.messages.clear();
        Ok(u32::try_from(purged).unwrap_or(u32::MAX))
    }

    async fn delete_queue(&self, queue: &str) -> Result<u32, BrokerError> {
        let mut state = self.broker.lock();
        state.channel_mut(self.id)?;
        if state.faults.delete {
            return Err(BrokerError::operation("queue.delete", "delete refused"));
        }
        Ok(state.remove_queue(queue))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.broker.lock().close_channel(self.id)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use futures::StreamExt;

    use super::*;

    async fn open_channel(broker: &MemoryBroker) -> (Box<dyn BrokerConnection>, Arc<dyn BrokerChannel>) {
        let conn = broker
            .connect(&ConnectionConfig::default())
            .await
            .expect("connect");
        let channel = conn.create_channel().await.expect("channel");
        (conn, channel)
    }

    #[tokio::test]
    async fn publish_then_consume_in_order() {
        let broker = MemoryBroker::new();
        broker.declare_queue("work");
        let (_conn, channel) = open_channel(&broker).await;

        for body in ["a", "b", "c"] {
            channel
                .publish("", "work", PublishProperties::reply_to("cb"), body.into())
                .await
                .expect("publish");
        }

        let mut stream = channel
            .consume("work", ConsumeOptions::auto_ack())
            .await
            .expect("consume");
        for expected in ["a", "b", "c"] {
            let delivery = stream.next().await.expect("item").expect("delivery");
            assert_eq!(delivery.body, expected.as_bytes());
            assert_eq!(delivery.reply_to.as_deref(), Some("cb"));
        }
        assert_eq!(broker.queue_len("work"), Some(0));
    }

    #[tokio::test]
    async fn prefetch_limits_unacked_deliveries() {
        let broker = MemoryBroker::new();
        broker.declare_queue("work");
        let (_conn, channel) = open_channel(&broker).await;
        channel.basic_qos(2).await.expect("qos");

        for i in 0..5u8 {
            broker.inject("work", vec![i], None);
        }
        let mut stream = channel
            .consume("work", ConsumeOptions::manual_ack())
            .await
            .expect("consume");

        let first = stream.next().await.expect("item").expect("delivery");
        let _second = stream.next().await.expect("item").expect("delivery");
        assert_eq!(broker.unacked_count(), 2);
        assert_eq!(broker.queue_len("work"), Some(3));

        channel.ack(first.tag).await.expect("ack");
        assert_eq!(broker.acked(), vec![vec![0u8]]);
        // Acking freed a slot, so the next message was delivered.
        assert_eq!(broker.unacked_count(), 2);
        assert_eq!(broker.queue_len("work"), Some(2));
    }

    #[tokio::test]
    async fn closing_channel_redelivers_unacked() {
        let broker = MemoryBroker::new();
        broker.declare_queue("work");
        broker.inject("work", b"job".to_vec(), None);

        let (_conn, channel) = open_channel(&broker).await;
        let mut stream = channel
            .consume("work", ConsumeOptions::manual_ack())
            .await
            .expect("consume");
        let first = stream.next().await.expect("item").expect("delivery");
        assert!(!first.redelivered);

        channel.close().await.expect("close");
        assert!(stream.next().await.is_none(), "stream ends with its channel");
        assert_eq!(broker.queue_len("work"), Some(1));

        let (_conn2, other) = open_channel(&broker).await;
        let mut stream = other
            .consume("work", ConsumeOptions::manual_ack())
            .await
            .expect("consume");
        let again = stream.next().await.expect("item").expect("delivery");
        assert!(again.redelivered);
        assert_eq!(again.body, b"job");
    }

    #[tokio::test]
    async fn round_robin_between_consumers() {
        let broker = MemoryBroker::new();
        broker.declare_queue("work");
        let (_c1, ch1) = open_channel(&broker).await;
        let (_c2, ch2) = open_channel(&broker).await;
        let mut s1 = ch1.consume("work", ConsumeOptions::auto_ack()).await.expect("consume");
        let mut s2 = ch2.consume("work", ConsumeOptions::auto_ack()).await.expect("consume");

        for i in 0..4u8 {
            broker.inject("work", vec![i], None);
        }

        let a = s1.next().await.expect("item").expect("delivery");
        let b = s2.next().await.expect("item").expect("delivery");
        let c = s1.next().await.expect("item").expect("delivery");
        let d = s2.next().await.expect("item").expect("delivery");
        assert_eq!(
            vec![a.body, b.body, c.body, d.body],
            vec![vec![0u8], vec![1], vec![2], vec![3]]
        );
    }

    #[tokio::test]
    async fn reject_without_requeue_drops_message() {
        let broker = MemoryBroker::new();
        broker.declare_queue("work");
        broker.inject("work", b"bad".to_vec(), None);
        let (_conn, channel) = open_channel(&broker).await;
        let mut stream = channel
            .consume("work", ConsumeOptions::manual_ack())
            .await
            .expect("consume");

        let delivery = stream.next().await.expect("item").expect("delivery");
        channel.reject(delivery.tag, false).await.expect("reject");

        assert_eq!(broker.rejected(), vec![b"bad".to_vec()]);
        assert_eq!(broker.unacked_count(), 0);
        assert_eq!(broker.queue_len("work"), Some(0));
    }

    #[tokio::test]
    async fn ack_with_unknown_tag_fails() {
        let broker = MemoryBroker::new();
        let (_conn, channel) = open_channel(&broker).await;
        assert_matches!(
            channel.ack(DeliveryTag(99)).await,
            Err(BrokerError::Operation { op: "basic.ack", .. })
        );
    }

    #[tokio::test]
    async fn exclusive_queue_dies_with_connection() {
        let broker = MemoryBroker::new();
        let (conn, channel) = open_channel(&broker).await;
        let name = channel
            .declare_queue(&QueueSpec::anonymous())
            .await
            .expect("declare");
        assert!(name.starts_with("amq.gen-"));
        assert!(broker.queue_exists(&name));

        conn.close().await.expect("close");
        assert!(!broker.queue_exists(&name));
        assert_matches!(
            channel.publish("", &name, PublishProperties::default(), vec![]).await,
            Err(BrokerError::Closed)
        );
    }

    #[tokio::test]
    async fn fanout_exchange_copies_to_bound_queues() {
        let broker = MemoryBroker::new();
        let (_conn, channel) = open_channel(&broker).await;
        channel
            .declare_exchange(&ExchangeSpec::new("events", ExchangeKind::Fanout))
            .await
            .expect("exchange");
        let q1 = channel.declare_queue(&QueueSpec::named("q1")).await.expect("q1");
        let q2 = channel.declare_queue(&QueueSpec::named("q2")).await.expect("q2");
        channel.bind_queue(&q1, "events", "").await.expect("bind q1");
        channel.bind_queue(&q2, "events", "").await.expect("bind q2");

        channel
            .publish("events", "", PublishProperties::default(), b"hi".to_vec())
            .await
            .expect("publish");

        assert_eq!(broker.queue_len("q1"), Some(1));
        assert_eq!(broker.queue_len("q2"), Some(1));
    }

    #[tokio::test]
    async fn broken_consumer_yields_an_error() {
        let broker = MemoryBroker::new();
        broker.declare_queue("work");
        let (_conn, channel) = open_channel(&broker).await;
        let mut deliveries = channel
            .consume("work", ConsumeOptions::manual_ack())
            .await
            .expect("consume");

        broker.break_consumers("work");
        assert_matches!(
            deliveries.next().await,
            Some(Err(BrokerError::Operation { op: "basic.deliver", .. }))
        );
    }

    #[tokio::test]
    async fn publish_budget_then_failure() {
        let broker = MemoryBroker::new();
        broker.declare_queue("work");
        broker.fail_publish_after(1);
        let (_conn, channel) = open_channel(&broker).await;

        channel
            .publish("", "work", PublishProperties::default(), b"1".to_vec())
            .await
            .expect("first publish passes");
        assert_matches!(
            channel
                .publish("", "work", PublishProperties::default(), b"2".to_vec())
                .await,
            Err(BrokerError::Operation { op: "basic.publish", .. })
        );
        assert_eq!(broker.published().len(), 1);
    }

    #[tokio::test]
    async fn purge_missing_queue_fails_delete_missing_is_ok() {
        let broker = MemoryBroker::new();
        let (_conn, channel) = open_channel(&broker).await;
        assert!(channel.purge_queue("nope").await.is_err());
        assert_eq!(channel.delete_queue("nope").await.expect("delete"), 0);
    }
}
