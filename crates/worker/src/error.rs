use jobmq_broker::BrokerError;
use jobmq_core::{CleanupError, ConfigError, SerializationError};

/// A delivery could not be turned into a command.
#[derive(Debug, thiserror::Error)]
#[error("Invalid command: {0}")]
pub struct CommandError(pub String);

impl From<SerializationError> for CommandError {
    fn from(e: SerializationError) -> Self {
        Self(e.to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// `start` was called while the engine is not stopped.
    #[error("Engine is already running")]
    AlreadyRunning,

    /// The broker could not be reached or the channel could not be opened.
    #[error("Engine could not connect: {0}")]
    Connection(#[source] BrokerError),

    /// Connected, but the pre-start action, queue binding or consumer
    /// registration failed.
    #[error("Engine setup failed: {0}")]
    Setup(#[source] BrokerError),

    #[error("Engine shutdown failed:\n{0}")]
    Cleanup(#[from] CleanupError),
}
