//! Batch dispatcher.
//!
//! [`Dispatcher::start`] wraps every job in a [`JobBatchEnvelope`] with a
//! unique index, publishes the envelopes to the shared work queue and
//! asks workers to reply to a private, server-named reply queue.
//! [`Dispatcher::wait`] consumes that queue until every index has come
//! back, and [`Dispatcher::stop`] releases the broker resources.
//!
//! Replies are matched to jobs by index only. A reply whose index is no
//! longer pending is ignored, so a job resolves at most once even when
//! the broker redelivers work to a second worker.

use std::collections::BTreeSet;
use std::ops::Range;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use futures::StreamExt;
use jobmq_broker::{
    Broker, BrokerError, ConnectionContext, ConsumeOptions, PublishProperties, QueueSpec,
};
use jobmq_core::{CleanupError, EnvelopeCodec, Job, JobBatchEnvelope, JobSlot, JsonConverter};
use tokio_util::sync::CancellationToken;

use crate::config::{DispatchMode, DispatcherConfig};
use crate::error::DispatchError;
use crate::listener::{JobCompleteEvent, JobCompleteListener, ListenerId};

type SharedListener<J> = Arc<dyn JobCompleteListener<J>>;

// ---------------------------------------------------------------------------
// Submission
// ---------------------------------------------------------------------------

/// A job handed to [`Dispatcher::start`], optionally with a listener that
/// only hears about this job.
pub struct Submission<J> {
    pub job: J,
    pub listener: Option<SharedListener<J>>,
}

impl<J> Submission<J> {
    pub fn new(job: J) -> Self {
        Self {
            job,
            listener: None,
        }
    }

    pub fn with_listener(mut self, listener: impl JobCompleteListener<J> + 'static) -> Self {
        self.listener = Some(Arc::new(listener));
        self
    }
}

impl<J> From<J> for Submission<J> {
    fn from(job: J) -> Self {
        Self::new(job)
    }
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

/// Jobs and bookkeeping of the current batch.
struct Batch<J> {
    slots: Vec<Arc<JobSlot<J>>>,
    job_listeners: Vec<Option<SharedListener<J>>>,
    /// Slot range carried by each envelope, indexed by envelope index.
    spans: Vec<Range<usize>>,
    /// Envelope indices still awaiting a reply.
    pending: BTreeSet<usize>,
    reply_queue: Option<String>,
}

impl<J> Default for Batch<J> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            job_listeners: Vec::new(),
            spans: Vec::new(),
            pending: BTreeSet::new(),
            reply_queue: None,
        }
    }
}

/// Broker resources held between `start` and `stop`.
struct Session {
    context: ConnectionContext,
    reply_queue: String,
    cancel: CancellationToken,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Publishes job batches and collects their results.
///
/// All operations take `&self`; share the dispatcher through an `Arc` to
/// call [`stop`](Self::stop) while another task is blocked in
/// [`wait`](Self::wait).
pub struct Dispatcher<J> {
    broker: Arc<dyn Broker>,
    config: DispatcherConfig,
    codec: Arc<dyn EnvelopeCodec<J>>,
    listeners: RwLock<Vec<(ListenerId, SharedListener<J>)>>,
    batch: Mutex<Batch<J>>,
    session: tokio::sync::Mutex<Option<Session>>,
    /// Serializes reply collection so each index is handled once.
    collecting: tokio::sync::Mutex<()>,
}

impl<J: Job> Dispatcher<J> {
    /// Create a dispatcher that encodes envelopes as JSON.
    pub fn new(broker: Arc<dyn Broker>, config: DispatcherConfig) -> Self {
        Self::with_codec(broker, config, Arc::new(JsonConverter))
    }

    pub fn with_codec(
        broker: Arc<dyn Broker>,
        config: DispatcherConfig,
        codec: Arc<dyn EnvelopeCodec<J>>,
    ) -> Self {
        Self {
            broker,
            config,
            codec,
            listeners: RwLock::new(Vec::new()),
            batch: Mutex::new(Batch::default()),
            session: tokio::sync::Mutex::new(None),
            collecting: tokio::sync::Mutex::new(()),
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    // ---- listeners ----

    /// Register a listener notified for every job of every batch.
    pub fn add_listener(&self, listener: impl JobCompleteListener<J> + 'static) -> ListenerId {
        let id = ListenerId::next();
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(listener)));
        id
    }

    /// Returns `false` if no listener with this id was registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(registered, _)| *registered != id);
        listeners.len() != before
    }

    // ---- status ----

    /// Envelope indices still awaiting a reply, ascending.
    pub fn pending(&self) -> Vec<usize> {
        lock(&self.batch).pending.iter().copied().collect()
    }

    pub fn has_pending(&self) -> bool {
        !lock(&self.batch).pending.is_empty()
    }

    /// The jobs of the current batch, with results for those resolved.
    pub fn jobs(&self) -> Vec<Arc<JobSlot<J>>> {
        lock(&self.batch).slots.clone()
    }

    /// Name of the reply queue while a batch is open.
    pub fn reply_queue(&self) -> Option<String> {
        lock(&self.batch).reply_queue.clone()
    }

    // ---- lifecycle ----

    /// Publish a batch of jobs to the work queue.
    ///
    /// Every envelope is encoded before anything is published, so an
    /// encoding failure leaves the broker untouched. A publish failure
    /// abandons the batch: envelopes already published are purged from the
    /// work queue, the connection is closed and nothing is left pending.
    pub async fn start<I, S>(&self, jobs: I) -> Result<(), DispatchError>
    where
        I: IntoIterator<Item = S>,
        S: Into<Submission<J>>,
    {
        let mut session = self.session.lock().await;
        if session.is_some() {
            return Err(DispatchError::AlreadyStarted);
        }

        let (jobs, job_listeners): (Vec<J>, Vec<Option<SharedListener<J>>>) = jobs
            .into_iter()
            .map(|s| {
                let s: Submission<J> = s.into();
                (s.job, s.listener)
            })
            .unzip();
        let job_count = jobs.len();

        let envelopes: Vec<JobBatchEnvelope<J>> = match self.config.mode {
            DispatchMode::PerJob => jobs
                .into_iter()
                .enumerate()
                .map(|(index, job)| JobBatchEnvelope::single(index, job))
                .collect(),
            DispatchMode::Bundled if job_count == 0 => Vec::new(),
            DispatchMode::Bundled => vec![JobBatchEnvelope::bundle(jobs)],
        };

        let bodies = envelopes
            .iter()
            .enumerate()
            .map(|(index, envelope)| {
                self.codec
                    .encode(envelope)
                    .map_err(|source| DispatchError::Serialization { index, source })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let context = ConnectionContext::open(
            self.broker.as_ref(),
            &self.config.connection,
            self.config.prefetch_count,
        )
        .await
        .map_err(DispatchError::Connection)?;

        let reply_queue = match context.channel().declare_queue(&QueueSpec::anonymous()).await {
            Ok(name) => name,
            Err(e) => {
                close_quietly(context).await;
                return Err(DispatchError::Connection(e));
            }
        };

        {
            let mut batch = lock(&self.batch);
            let mut spans = Vec::with_capacity(envelopes.len());
            let mut slots = Vec::with_capacity(job_count);
            for envelope in envelopes {
                let start = slots.len();
                slots.extend(envelope.jobs.into_iter().map(Arc::new));
                spans.push(start..slots.len());
            }
            *batch = Batch {
                pending: (0..spans.len()).collect(),
                slots,
                job_listeners,
                spans,
                reply_queue: Some(reply_queue.clone()),
            };
        }

        let channel = Arc::clone(context.channel());
        for (index, body) in bodies.into_iter().enumerate() {
            let published = channel
                .publish(
                    "",
                    &self.config.queue,
                    PublishProperties::reply_to(reply_queue.clone()),
                    body,
                )
                .await;

            if let Err(source) = published {
                tracing::error!(
                    index,
                    queue = %self.config.queue,
                    error = %source,
                    "Publishing envelope failed, abandoning batch",
                );
                {
                    let mut batch = lock(&self.batch);
                    batch.pending.clear();
                    batch.reply_queue = None;
                }
                if index > 0 {
                    if let Err(e) = channel.purge_queue(&self.config.queue).await {
                        tracing::warn!(
                            queue = %self.config.queue,
                            error = %e,
                            "Failed to purge envelopes of the abandoned batch",
                        );
                    }
                }
                if let Err(e) = channel.delete_queue(&reply_queue).await {
                    tracing::debug!(reply_queue = %reply_queue, error = %e, "Failed to delete reply queue");
                }
                close_quietly(context).await;
                return Err(DispatchError::Publish { index, source });
            }
        }

        tracing::info!(
            jobs = job_count,
            envelopes = lock(&self.batch).spans.len(),
            mode = %self.config.mode,
            queue = %self.config.queue,
            reply_queue = %reply_queue,
            "Batch dispatched",
        );

        *session = Some(Session {
            context,
            reply_queue,
            cancel: CancellationToken::new(),
        });
        Ok(())
    }

    /// Collect replies until every job has resolved or [`stop`](Self::stop)
    /// is called.
    ///
    /// Malformed or duplicate replies are logged and dropped; they never
    /// end collection early.
    pub async fn wait(&self) -> Result<(), DispatchError> {
        let _collecting = self.collecting.lock().await;
        if !self.has_pending() {
            return Ok(());
        }

        let (channel, reply_queue, cancel) = {
            let session = self.session.lock().await;
            match session.as_ref() {
                Some(s) => (
                    Arc::clone(s.context.channel()),
                    s.reply_queue.clone(),
                    s.cancel.clone(),
                ),
                None => return Ok(()),
            }
        };

        let mut replies = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            consumer = channel.consume(&reply_queue, ConsumeOptions::auto_ack()) => {
                consumer.map_err(DispatchError::Receive)?
            }
        };

        while self.has_pending() {
            let next = tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!(pending = ?self.pending(), "Stopped while waiting for replies");
                    return Ok(());
                }
                next = replies.next() => next,
            };

            match next {
                Some(Ok(delivery)) => self.handle_reply(&delivery.body),
                Some(Err(e)) if cancel.is_cancelled() => {
                    tracing::debug!(error = %e, "Reply consumer closed during stop");
                    return Ok(());
                }
                Some(Err(e)) => return Err(DispatchError::Receive(e)),
                None if cancel.is_cancelled() => return Ok(()),
                None => return Err(DispatchError::Receive(BrokerError::Closed)),
            }
        }

        tracing::info!(reply_queue = %reply_queue, "All jobs resolved");
        Ok(())
    }

    /// Release broker resources: purge the work queue, delete the reply
    /// queue and close the connection.
    ///
    /// Every step runs even if an earlier one fails. Safe to call more
    /// than once, concurrently with [`wait`](Self::wait) (which then
    /// returns), and without a prior `start`. Pending indices are kept.
    pub async fn stop(&self) -> Result<(), DispatchError> {
        let Some(session) = self.session.lock().await.take() else {
            return Ok(());
        };
        session.cancel.cancel();
        lock(&self.batch).reply_queue = None;

        let mut errors = CleanupError::new();
        let channel = session.context.channel();

        match channel.purge_queue(&self.config.queue).await {
            Ok(purged) => {
                tracing::debug!(queue = %self.config.queue, purged, "Purged work queue")
            }
            Err(e) => errors.push("purge work queue", e),
        }
        if let Err(e) = channel.delete_queue(&session.reply_queue).await {
            errors.push("delete reply queue", e);
        }
        if let Err(e) = session.context.close().await {
            errors.extend(e);
        }

        if errors.is_empty() {
            tracing::info!(queue = %self.config.queue, "Dispatcher stopped");
        } else {
            tracing::warn!(failures = errors.failures.len(), "Dispatcher stopped with cleanup errors");
        }
        errors.into_result().map_err(DispatchError::from)
    }

    // ---- private helpers ----

    fn handle_reply(&self, body: &[u8]) {
        let envelope = match self.codec.decode(body) {
            Ok(envelope) => envelope,
            Err(e) => {
                let index = self.codec.peek_index(body);
                tracing::error!(index = ?index, error = %e, "Dropping undecodable reply");
                return;
            }
        };

        let Some(index) = envelope.index else {
            tracing::warn!("Dropping reply without a batch index");
            return;
        };

        let resolved = {
            let mut batch = lock(&self.batch);
            if !batch.pending.contains(&index) {
                tracing::debug!(index, "Ignoring reply for an index that is not pending");
                return;
            }
            if !envelope.is_resolved() {
                tracing::warn!(index, "Dropping reply with unresolved jobs");
                return;
            }
            let span = batch.spans[index].clone();
            if envelope.jobs.len() != span.len() {
                tracing::warn!(
                    index,
                    expected = span.len(),
                    received = envelope.jobs.len(),
                    "Dropping reply with the wrong number of jobs",
                );
                return;
            }

            for (position, slot) in span.clone().zip(envelope.jobs) {
                batch.slots[position] = Arc::new(slot);
            }
            span.map(|position| {
                (
                    position,
                    Arc::clone(&batch.slots[position]),
                    batch.job_listeners.get(position).cloned().flatten(),
                )
            })
            .collect::<Vec<_>>()
        };

        let listeners: Vec<SharedListener<J>> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        for (position, slot, own) in resolved {
            let Some(result) = slot.result.as_ref() else {
                continue;
            };
            let event = JobCompleteEvent {
                index: position,
                job: &slot.job,
                result,
            };
            for listener in &listeners {
                listener.job_completed(&event);
            }
            if let Some(listener) = own {
                listener.job_completed(&event);
            }
        }

        let remaining = {
            let mut batch = lock(&self.batch);
            batch.pending.remove(&index);
            batch.pending.len()
        };
        tracing::debug!(index, remaining, "Reply received");
    }
}

async fn close_quietly(context: ConnectionContext) {
    if let Err(e) = context.close().await {
        tracing::warn!(error = %e, "Failed to close dispatcher connection");
    }
}

