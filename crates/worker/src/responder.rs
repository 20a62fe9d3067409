//! Worker side of the dispatcher protocol.
//!
//! A [`JobResponder`] runs the jobs carried by a [`JobBatchEnvelope`],
//! writes their results into the envelope and publishes it, index and
//! metadata untouched, to the reply queue the dispatcher named.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use jobmq_core::{EnvelopeCodec, Job, JobBatchEnvelope, JsonConverter};

use crate::command::{CommandProcessor, Handler, HandlerContext, Incoming, RemoteCommand};
use crate::error::CommandError;

/// An envelope received from a dispatcher.
#[derive(Debug)]
pub struct JobCommand<J> {
    pub envelope: JobBatchEnvelope<J>,
    pub reply_to: Option<String>,
}

impl<J: Job> RemoteCommand for JobCommand<J> {
    fn name(&self) -> &str {
        "job-batch"
    }
}

/// Parses delivery payloads into [`JobCommand`]s and encodes the reply.
pub struct JobCommandProcessor<J> {
    codec: Arc<dyn EnvelopeCodec<J>>,
}

impl<J: Job> JobCommandProcessor<J> {
    pub fn new(codec: Arc<dyn EnvelopeCodec<J>>) -> Self {
        Self { codec }
    }
}

impl<J: Job> Default for JobCommandProcessor<J> {
    fn default() -> Self {
        Self::new(Arc::new(JsonConverter))
    }
}

impl<J: Job> CommandProcessor<JobCommand<J>> for JobCommandProcessor<J> {
    fn parse(&self, incoming: &Incoming) -> Result<JobCommand<J>, CommandError> {
        let envelope = self.codec.decode(incoming.payload.as_bytes())?;
        if envelope.jobs.is_empty() {
            return Err(CommandError("envelope carries no jobs".into()));
        }
        Ok(JobCommand {
            envelope,
            reply_to: incoming.reply_to.clone(),
        })
    }

    fn encode_response(&self, command: &JobCommand<J>) -> Result<Vec<u8>, CommandError> {
        Ok(self.codec.encode(&command.envelope)?)
    }
}

/// Executes every job of an envelope in order and replies with the results.
///
/// A job that reports failure still produces a reply; only a missing
/// reply address or a failed publish makes the handler itself fail.
pub struct JobResponder<J> {
    _job: PhantomData<fn() -> J>,
}

impl<J> JobResponder<J> {
    pub fn new() -> Self {
        Self { _job: PhantomData }
    }
}

impl<J> Default for JobResponder<J> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<J: Job> Handler<JobCommand<J>> for JobResponder<J> {
    async fn handle(
        &self,
        mut command: JobCommand<J>,
        context: &HandlerContext<JobCommand<J>>,
    ) -> Option<String> {
        let Some(reply_to) = command.reply_to.clone() else {
            return Some("delivery has no reply-to address".into());
        };
        let index = command.envelope.index;

        for slot in &mut command.envelope.jobs {
            let result = slot.run().await;
            tracing::debug!(index = ?index, success = result.success, "Job executed");
        }

        let body = match context.processor().encode_response(&command) {
            Ok(body) => body,
            Err(e) => return Some(e.to_string()),
        };

        match context.replier().reply(&reply_to, body).await {
            Ok(()) => {
                tracing::info!(
                    index = ?index,
                    jobs = command.envelope.jobs.len(),
                    reply_to = %reply_to,
                    "Replied with results",
                );
                None
            }
            Err(e) => Some(format!("failed to reply to {reply_to}: {e}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
