//! Worker engine.
//!
//! An [`Engine`] consumes deliveries from a queue (or from a private queue
//! bound to an exchange), turns each into a command and runs permitted
//! commands on a bounded [`WorkerPool`]. A delivery is acknowledged only
//! after its handler reports success.
//!
//! Two tasks run while the engine is active: the consumer decodes
//! deliveries and pushes them onto a bounded hand-off queue, and the poll
//! loop takes them off and dispatches them. Pausing stops the poll loop
//! only, so the connection and any prefetched deliveries stay put. If the
//! broker ends the consumer on its own, the engine tears the session down
//! and returns to `Stopped`.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::{FutureExt, StreamExt};
use jobmq_broker::{
    Broker, BrokerChannel, BrokerError, ChannelAction, ConnectionContext, ConsumeOptions,
    DeliveryStream, DeliveryTag, NoAction, QueueSpec,
};
use jobmq_core::{CleanupError, ReceiveConverter, StringConverter};
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::command::{
    AllowAll, CommandProcessor, Handler, HandlerContext, Incoming, LogRejections, Permitter,
    RemoteCommand, Replier, RequestHandler,
};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::pool::WorkerPool;
use crate::state::EngineState;

/// Reason passed to the request handler for refused commands.
const PERMISSION_DENIED: &str = "permission denied";

/// A decoded delivery waiting for the poll loop.
struct Queued {
    incoming: Incoming,
    tag: DeliveryTag,
}

/// Resources held while the engine is connected.
struct Session {
    context: ConnectionContext,
    cancel: CancellationToken,
    tasks: TaskTracker,
    queue: String,
    generation: u64,
}

struct Inner<C> {
    broker: Arc<dyn Broker>,
    config: EngineConfig,
    processor: Arc<dyn CommandProcessor<C>>,
    permitter: Arc<dyn Permitter<C>>,
    request_handler: Arc<dyn RequestHandler<C>>,
    handler: Arc<dyn Handler<C>>,
    receive: Arc<dyn ReceiveConverter>,
    pre_start: Arc<dyn ChannelAction>,
    pool: WorkerPool,
    state: watch::Sender<EngineState>,
    session: Mutex<Option<Session>>,
    generations: AtomicU64,
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Assembles an [`Engine`] from its capabilities.
///
/// Processor and handler are required; the permitter defaults to
/// [`AllowAll`], rejections are logged by [`LogRejections`], bodies are
/// decoded as strict UTF-8 and no pre-start action runs.
pub struct EngineBuilder<C> {
    broker: Arc<dyn Broker>,
    config: EngineConfig,
    processor: Arc<dyn CommandProcessor<C>>,
    handler: Arc<dyn Handler<C>>,
    permitter: Arc<dyn Permitter<C>>,
    request_handler: Arc<dyn RequestHandler<C>>,
    receive: Arc<dyn ReceiveConverter>,
    pre_start: Arc<dyn ChannelAction>,
}

impl<C: RemoteCommand> EngineBuilder<C> {
    pub fn permitter(mut self, permitter: impl Permitter<C> + 'static) -> Self {
        self.permitter = Arc::new(permitter);
        self
    }

    pub fn request_handler(mut self, request_handler: impl RequestHandler<C> + 'static) -> Self {
        self.request_handler = Arc::new(request_handler);
        self
    }

    pub fn receive_converter(mut self, converter: impl ReceiveConverter + 'static) -> Self {
        self.receive = Arc::new(converter);
        self
    }

    /// Broker action run after connecting, before consuming starts.
    pub fn pre_start(mut self, action: impl ChannelAction + 'static) -> Self {
        self.pre_start = Arc::new(action);
        self
    }

    /// Validate the configuration and create the engine in `Stopped` state.
    pub fn build(self) -> Result<Engine<C>, EngineError> {
        self.config.validate()?;
        let (state, _) = watch::channel(EngineState::Stopped);
        let pool = WorkerPool::new(self.config.max_concurrent_jobs);

        Ok(Engine {
            inner: Arc::new(Inner {
                broker: self.broker,
                config: self.config,
                processor: self.processor,
                permitter: self.permitter,
                request_handler: self.request_handler,
                handler: self.handler,
                receive: self.receive,
                pre_start: self.pre_start,
                pool,
                state,
                session: Mutex::new(None),
                generations: AtomicU64::new(0),
            }),
        })
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Handle to a worker engine. Clones share the same engine.
pub struct Engine<C> {
    inner: Arc<Inner<C>>,
}

impl<C> Clone for Engine<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: RemoteCommand> Engine<C> {
    pub fn builder(
        broker: Arc<dyn Broker>,
        config: EngineConfig,
        processor: impl CommandProcessor<C> + 'static,
        handler: impl Handler<C> + 'static,
    ) -> EngineBuilder<C> {
        EngineBuilder {
            broker,
            config,
            processor: Arc::new(processor),
            handler: Arc::new(handler),
            permitter: Arc::new(AllowAll),
            request_handler: Arc::new(LogRejections),
            receive: Arc::new(StringConverter),
            pre_start: Arc::new(NoAction),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn state(&self) -> EngineState {
        *self.inner.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<EngineState> {
        self.inner.state.subscribe()
    }

    /// Handlers currently running.
    pub fn in_flight(&self) -> usize {
        self.inner.pool.in_flight()
    }

    /// Name of the queue being consumed while connected.
    pub async fn queue(&self) -> Option<String> {
        self.inner
            .session
            .lock()
            .await
            .as_ref()
            .map(|s| s.queue.clone())
    }

    /// Connect, run the pre-start action, resolve the queue and start
    /// consuming.
    ///
    /// On failure everything opened so far is closed and the engine is
    /// back in `Stopped`.
    pub async fn start(&self) -> Result<(), EngineError> {
        let mut session = self.inner.session.lock().await;
        if session.is_some() || self.state() != EngineState::Stopped {
            return Err(EngineError::AlreadyRunning);
        }

        self.inner.set_state(EngineState::Connecting);
        let (context, queue, deliveries) = match self.inner.connect().await {
            Ok(connected) => connected,
            Err(e) => {
                tracing::error!(error = %e, "Engine failed to start");
                self.inner.set_state(EngineState::Stopped);
                return Err(e);
            }
        };

        let generation = self.inner.generations.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let tasks = TaskTracker::new();
        let channel = Arc::clone(context.channel());
        let (tx, rx) = mpsc::channel(self.inner.config.effective_queue_capacity());

        tasks.spawn(Inner::consume_deliveries(
            Arc::clone(&self.inner),
            generation,
            deliveries,
            Arc::clone(&channel),
            tx,
            cancel.clone(),
        ));
        tasks.spawn(Inner::poll_loop(
            Arc::clone(&self.inner),
            channel,
            rx,
            cancel.clone(),
        ));
        tasks.close();

        tracing::info!(
            queue = %queue,
            prefetch_count = self.inner.config.prefetch_count,
            max_concurrent_jobs = self.inner.pool.capacity(),
            "Engine running",
        );

        *session = Some(Session {
            context,
            cancel,
            tasks,
            queue,
            generation,
        });
        self.inner.set_state(EngineState::Running);
        Ok(())
    }

    /// Stop handling queued deliveries. The connection stays open.
    ///
    /// Returns `true` if the engine was running; pausing twice is a no-op.
    pub fn pause(&self) -> bool {
        let changed = self.inner.transition(EngineState::Running, EngineState::Paused);
        if changed {
            tracing::info!("Engine paused");
        }
        changed
    }

    /// Continue after [`pause`](Self::pause) without reconnecting.
    pub fn resume(&self) -> bool {
        let changed = self.inner.transition(EngineState::Paused, EngineState::Running);
        if changed {
            tracing::info!("Engine resumed");
        }
        changed
    }

    /// Stop consuming, wait for running handlers, then close the
    /// connection. Unacknowledged deliveries go back to the broker.
    ///
    /// Safe to call repeatedly and concurrently; later calls wait for the
    /// first and then return `Ok`.
    pub async fn stop(&self) -> Result<(), EngineError> {
        let mut guard = self.inner.session.lock().await;
        let Some(session) = guard.take() else {
            return Ok(());
        };

        tracing::info!(queue = %session.queue, "Stopping engine");
        let closed = self.inner.teardown(session).await;
        drop(guard);

        match closed {
            Ok(()) => {
                tracing::info!("Engine stopped");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(error = %e, "Engine stopped with cleanup errors");
                Err(EngineError::Cleanup(e))
            }
        }
    }
}

impl<C: RemoteCommand> Inner<C> {
    fn set_state(&self, state: EngineState) {
        self.state.send_replace(state);
    }

    fn transition(&self, from: EngineState, to: EngineState) -> bool {
        self.state.send_if_modified(|current| {
            if *current == from {
                *current = to;
                true
            } else {
                false
            }
        })
    }

    /// Cancel the session's tasks, wait for them and for running handlers,
    /// then close the connection. Must not run on one of the session's own
    /// tasks.
    async fn teardown(&self, session: Session) -> Result<(), CleanupError> {
        session.cancel.cancel();
        session.tasks.wait().await;
        self.pool.drain().await;

        let closed = session.context.close().await;
        self.set_state(EngineState::Stopped);
        closed
    }

    /// Tear down the session started as `generation` after its consumer
    /// ended. A session that was already stopped or replaced is left alone.
    async fn abandon(self: Arc<Self>, generation: u64) {
        let mut guard = self.session.lock().await;
        if guard.as_ref().map(|s| s.generation) != Some(generation) {
            return;
        }
        let Some(session) = guard.take() else {
            return;
        };

        tracing::error!(queue = %session.queue, "Consumer lost, stopping engine");
        if let Err(e) = self.teardown(session).await {
            tracing::warn!(error = %e, "Engine stopped with cleanup errors");
        }
    }

    async fn connect(&self) -> Result<(ConnectionContext, String, DeliveryStream), EngineError> {
        let context = ConnectionContext::open(
            self.broker.as_ref(),
            &self.config.connection,
            self.config.prefetch_count,
        )
        .await
        .map_err(EngineError::Connection)?;

        let subscribed = self.subscribe(context.channel().as_ref()).await;
        match subscribed {
            Ok((queue, deliveries)) => Ok((context, queue, deliveries)),
            Err(e) => {
                if let Err(cleanup) = context.close().await {
                    tracing::debug!(
                        error = %cleanup,
                        "Ignoring cleanup failure after setup error",
                    );
                }
                Err(EngineError::Setup(e))
            }
        }
    }

    async fn subscribe(
        &self,
        channel: &dyn BrokerChannel,
    ) -> Result<(String, DeliveryStream), BrokerError> {
        self.pre_start.perform(channel).await?;

        let queue = if self.config.queue.is_empty() {
            let queue = channel.declare_queue(&QueueSpec::anonymous()).await?;
            channel.bind_queue(&queue, &self.config.exchange, "").await?;
            tracing::debug!(
                queue = %queue,
                exchange = %self.config.exchange,
                "Bound private queue",
            );
            queue
        } else {
            self.config.queue.clone()
        };

        let deliveries = channel.consume(&queue, ConsumeOptions::manual_ack()).await?;
        Ok((queue, deliveries))
    }

    async fn poll_loop(
        self: Arc<Self>,
        channel: Arc<dyn BrokerChannel>,
        mut rx: mpsc::Receiver<Queued>,
        cancel: CancellationToken,
    ) {
        let mut state = self.state.subscribe();

        loop {
            if *state.borrow_and_update() == EngineState::Paused {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = state.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        continue;
                    }
                }
            }

            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                _ = state.changed() => continue,
                next = tokio::time::timeout(self.config.poll_timeout, rx.recv()) => next,
            };

            match next {
                Ok(Some(queued)) => {
                    let tag = queued.tag;
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            tracing::debug!(tag = %tag, "Dropping queued delivery on stop");
                            break;
                        }
                        _ = self.handle_message(&channel, queued) => {}
                    }
                }
                Ok(None) => {
                    tracing::debug!("Consumer finished, poll loop exiting");
                    break;
                }
                Err(_elapsed) => {}
            }
        }
    }

    /// Parse, authorize and dispatch one delivery.
    ///
    /// Returns once the handler has been handed to the pool, which may
    /// mean waiting for a free slot.
    async fn handle_message(&self, channel: &Arc<dyn BrokerChannel>, queued: Queued) {
        let Queued { incoming, tag } = queued;

        let command = match self.processor.parse(&incoming) {
            Ok(command) => command,
            Err(e) => {
                tracing::error!(tag = %tag, error = %e, "Rejecting unparseable delivery");
                if let Err(e) = channel.reject(tag, false).await {
                    tracing::warn!(tag = %tag, error = %e, "Failed to reject delivery");
                }
                return;
            }
        };

        if !self.permitter.permitted(&command) {
            self.request_handler.request_rejected(&command, PERMISSION_DENIED);
            tracing::debug!(
                tag = %tag,
                command = command.name(),
                "Leaving refused delivery unacknowledged",
            );
            return;
        }

        let handler = Arc::clone(&self.handler);
        let context = HandlerContext::new(
            Arc::clone(&self.processor),
            Replier::new(Arc::clone(channel)),
        );
        let channel = Arc::clone(channel);

        let submitted = self
            .pool
            .submit(async move {
                let name = command.name().to_string();
                let outcome = AssertUnwindSafe(handler.handle(command, &context))
                    .catch_unwind()
                    .await;

                match outcome {
                    Ok(None) => {
                        if let Err(e) = channel.ack(tag).await {
                            tracing::warn!(
                                tag = %tag,
                                command = %name,
                                error = %e,
                                "Failed to acknowledge delivery",
                            );
                        } else {
                            tracing::debug!(tag = %tag, command = %name, "Command handled");
                        }
                    }
                    Ok(Some(error)) => {
                        tracing::warn!(
                            tag = %tag,
                            command = %name,
                            error = %error,
                            "Command failed, delivery left unacknowledged",
                        );
                    }
                    Err(_) => {
                        tracing::error!(
                            tag = %tag,
                            command = %name,
                            "Handler panicked, delivery left unacknowledged",
                        );
                    }
                }
            })
            .await;

        if !submitted {
            tracing::warn!(tag = %tag, "Worker pool closed, delivery left unacknowledged");
        }
    }

    /// Decode deliveries and hand them to the poll loop until cancelled.
    ///
    /// A consumer error or an end of stream the engine did not ask for
    /// schedules [`abandon`](Self::abandon) for this session.
    async fn consume_deliveries(
        self: Arc<Self>,
        generation: u64,
        mut deliveries: DeliveryStream,
        channel: Arc<dyn BrokerChannel>,
        tx: mpsc::Sender<Queued>,
        cancel: CancellationToken,
    ) {
        let mut lost = false;

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                next = deliveries.next() => next,
            };

            let delivery = match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(e)) => {
                    tracing::error!(error = %e, "Consumer error");
                    lost = true;
                    break;
                }
                None => {
                    if !cancel.is_cancelled() {
                        tracing::warn!("Broker closed the consumer");
                        lost = true;
                    }
                    break;
                }
            };

            let payload = match self.receive.convert(&delivery.body) {
                Ok(payload) => payload,
                Err(e) => {
                    tracing::error!(tag = %delivery.tag, error = %e, "Rejecting undecodable delivery");
                    if let Err(e) = channel.reject(delivery.tag, false).await {
                        tracing::warn!(tag = %delivery.tag, error = %e, "Failed to reject delivery");
                    }
                    continue;
                }
            };

            let queued = Queued {
                incoming: Incoming {
                    payload,
                    reply_to: delivery.reply_to,
                    redelivered: delivery.redelivered,
                },
                tag: delivery.tag,
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                sent = tx.send(queued) => {
                    if sent.is_err() {
                        break;
                    }
                }
            }
        }

        // Runs detached: teardown waits for this task to finish.
        if lost {
            tokio::spawn(self.abandon(generation));
        }
    }
}
