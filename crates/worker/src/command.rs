//! Capabilities an [`Engine`](crate::Engine) is built from.
//!
//! Each delivery flows through them in order: the [`CommandProcessor`]
//! parses it, the [`Permitter`] decides whether it may run, the
//! [`RequestHandler`] hears about refusals and the [`Handler`] executes
//! permitted commands on the worker pool.

use std::sync::Arc;

use async_trait::async_trait;
use jobmq_broker::{BrokerChannel, BrokerError, PublishProperties};

use crate::error::CommandError;

/// A decoded delivery body plus the delivery properties commands may need.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Incoming {
    pub payload: String,
    pub reply_to: Option<String>,
    pub redelivered: bool,
}

impl Incoming {
    pub fn new(payload: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
            reply_to: None,
            redelivered: false,
        }
    }
}

/// An instruction understood by a worker.
pub trait RemoteCommand: Send + Sync + 'static {
    /// Short label used in logs.
    fn name(&self) -> &str;
}

pub trait CommandProcessor<C>: Send + Sync {
    fn parse(&self, incoming: &Incoming) -> Result<C, CommandError>;

    /// Encode the response a handler sends back for `command`.
    fn encode_response(&self, command: &C) -> Result<Vec<u8>, CommandError> {
        let _ = command;
        Err(CommandError("this processor does not produce responses".into()))
    }
}

pub trait Permitter<C>: Send + Sync {
    fn permitted(&self, command: &C) -> bool;
}

impl<C, F> Permitter<C> for F
where
    F: Fn(&C) -> bool + Send + Sync,
{
    fn permitted(&self, command: &C) -> bool {
        self(command)
    }
}

/// Permits every command.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl<C> Permitter<C> for AllowAll {
    fn permitted(&self, _command: &C) -> bool {
        true
    }
}

/// Notified when a parsed command is refused.
pub trait RequestHandler<C>: Send + Sync {
    fn request_rejected(&self, command: &C, reason: &str);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LogRejections;

impl<C: RemoteCommand> RequestHandler<C> for LogRejections {
    fn request_rejected(&self, command: &C, reason: &str) {
        tracing::warn!(command = command.name(), reason, "Command rejected");
    }
}

/// Executes permitted commands.
///
/// Returns `None` on success, which acknowledges the delivery, or an error
/// message, which leaves it unacknowledged for the broker to redeliver.
#[async_trait]
pub trait Handler<C>: Send + Sync {
    async fn handle(&self, command: C, context: &HandlerContext<C>) -> Option<String>;
}

/// What a handler gets to work with besides the command itself.
pub struct HandlerContext<C> {
    processor: Arc<dyn CommandProcessor<C>>,
    replier: Replier,
}

impl<C> HandlerContext<C> {
    pub fn new(processor: Arc<dyn CommandProcessor<C>>, replier: Replier) -> Self {
        Self {
            processor,
            replier,
        }
    }

    pub fn processor(&self) -> &dyn CommandProcessor<C> {
        self.processor.as_ref()
    }

    pub fn replier(&self) -> &Replier {
        &self.replier
    }
}

/// Publishes responses on the engine's channel.
#[derive(Clone)]
pub struct Replier {
    channel: Arc<dyn BrokerChannel>,
}

impl Replier {
    pub fn new(channel: Arc<dyn BrokerChannel>) -> Self {
        Self { channel }
    }

    /// Send `body` to the queue named by a delivery's reply-to address.
    pub async fn reply(&self, queue: &str, body: Vec<u8>) -> Result<(), BrokerError> {
        self.channel
            .publish("", queue, PublishProperties::default(), body)
            .await
    }
}
