//! Live connection/channel pair owned by one component instance.

use std::fmt;
use std::sync::Arc;

use jobmq_core::{CleanupError, ConnectionConfig};

use crate::channel::{Broker, BrokerChannel, BrokerConnection};
use crate::error::BrokerError;

/// A broker connection with the single channel a component works on.
///
/// Created by [`ConnectionContext::open`] and torn down by
/// [`ConnectionContext::close`]. Never shared between a dispatcher and a
/// worker engine, even in the same process.
pub struct ConnectionContext {
    connection: Box<dyn BrokerConnection>,
    channel: Arc<dyn BrokerChannel>,
}

impl fmt::Debug for ConnectionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionContext").finish_non_exhaustive()
    }
}

impl ConnectionContext {
    /// Connect, open a channel and apply the prefetch limit.
    ///
    /// On failure anything opened so far is closed again before the
    /// error is returned.
    pub async fn open(
        broker: &dyn Broker,
        config: &ConnectionConfig,
        prefetch_count: u16,
    ) -> Result<Self, BrokerError> {
        let connection = broker.connect(config).await?;

        let channel = match connection.create_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                close_connection_quietly(connection.as_ref()).await;
                return Err(e);
            }
        };

        if let Err(e) = channel.basic_qos(prefetch_count).await {
            let _ = channel.close().await;
            close_connection_quietly(connection.as_ref()).await;
            return Err(e);
        }

        tracing::debug!(target_broker = %config, prefetch_count, "Broker connection opened");

        Ok(Self {
            connection,
            channel,
        })
    }

    pub fn channel(&self) -> &Arc<dyn BrokerChannel> {
        &self.channel
    }

    /// Close the channel, then the connection. Both steps always run.
    pub async fn close(self) -> Result<(), CleanupError> {
        let mut errors = CleanupError::new();

        if let Err(e) = self.channel.close().await {
            errors.push("close channel", e);
        }
        if let Err(e) = self.connection.close().await {
            errors.push("close connection", e);
        }

        errors.into_result()
    }
}

async fn close_connection_quietly(connection: &dyn BrokerConnection) {
    if let Err(e) = connection.close().await {
        tracing::debug!(error = %e, "Ignoring failure while closing connection");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::memory::MemoryBroker;

    #[tokio::test]
    async fn open_and_close() {
        let broker = MemoryBroker::new();
        let ctx = ConnectionContext::open(&broker, &ConnectionConfig::default(), 4)
            .await
            .expect("open");
        assert_eq!(broker.open_connections(), 1);

        ctx.close().await.expect("close");
        assert_eq!(broker.open_connections(), 0);
    }

    #[tokio::test]
    async fn connect_failure_is_surfaced() {
        let broker = MemoryBroker::new();
        broker.fail_connect(true);

        let result = ConnectionContext::open(&broker, &ConnectionConfig::default(), 1).await;
        assert_matches!(result, Err(BrokerError::Connection { .. }));
        assert_eq!(broker.open_connections(), 0);
    }

    #[tokio::test]
    async fn closing_twice_reports_both_steps() {
        let broker = MemoryBroker::new();
        let ctx = ConnectionContext::open(&broker, &ConnectionConfig::default(), 1)
            .await
            .expect("open");
        let channel = Arc::clone(ctx.channel());
        channel.close().await.expect("first close");

        let err = ctx.close().await.expect_err("channel already closed");
        assert_eq!(err.failures.len(), 1);
        assert!(err.failures[0].starts_with("close channel"));
    }
}
