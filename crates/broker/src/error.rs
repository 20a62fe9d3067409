/// Errors raised by a broker client.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BrokerError {
    /// The broker could not be reached or refused the connection.
    #[error("Failed to connect to broker ({target}): {message}")]
    Connection { target: String, message: String },

    /// A channel could not be opened on an established connection.
    #[error("Failed to create channel: {0}")]
    Channel(String),

    /// A protocol operation failed.
    #[error("Broker operation {op} failed: {message}")]
    Operation { op: &'static str, message: String },

    /// The channel or connection has already been closed.
    #[error("Channel is closed")]
    Closed,
}

impl BrokerError {
    pub fn operation(op: &'static str, message: impl ToString) -> Self {
        Self::Operation {
            op,
            message: message.to_string(),
        }
    }
}
