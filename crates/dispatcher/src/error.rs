use jobmq_broker::BrokerError;
use jobmq_core::{CleanupError, SerializationError};

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// `start` was called while a batch is still open.
    #[error("A batch is already running; call stop() before starting another")]
    AlreadyStarted,

    /// Connecting, opening the channel or declaring the reply queue failed.
    #[error("Dispatcher could not set up its broker connection: {0}")]
    Connection(#[source] BrokerError),

    /// A job envelope could not be encoded. Nothing was published.
    #[error("Failed to encode envelope {index}: {source}")]
    Serialization {
        index: usize,
        #[source]
        source: SerializationError,
    },

    /// Publishing an envelope failed. The batch was abandoned.
    #[error("Failed to publish envelope {index}: {source}")]
    Publish {
        index: usize,
        #[source]
        source: BrokerError,
    },

    /// The reply consumer could not be started or ended unexpectedly.
    #[error("Lost the reply queue consumer: {0}")]
    Receive(#[source] BrokerError),

    #[error("Dispatcher cleanup failed:\n{0}")]
    Cleanup(#[from] CleanupError),
}
