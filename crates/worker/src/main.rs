//! `jobmq-worker` -- runs shell jobs published by a jobmq dispatcher.
//!
//! Consumes job envelopes, executes each [`ShellJob`] on this host and
//! replies with the results. Stops cleanly on Ctrl-C: running jobs finish,
//! unacknowledged deliveries return to the broker.
//!
//! # Environment variables
//!
//! | Variable                     | Required | Default     | Description                              |
//! |------------------------------|----------|-------------|------------------------------------------|
//! | `WORKER_QUEUE`               | one of   | --          | Shared work queue, declared durable      |
//! | `WORKER_EXCHANGE`            | one of   | --          | Fanout exchange to bind a private queue to |
//! | `WORKER_PREFETCH`            | no       | `1`         | Unacknowledged deliveries per worker     |
//! | `WORKER_MAX_CONCURRENT_JOBS` | no       | `1`         | Jobs run at the same time                |
//! | `WORKER_POLL_TIMEOUT_MS`     | no       | `100`       | Poll loop wake-up interval               |
//! | `BROKER_HOST`                | no       | `localhost` | Broker host                              |
//! | `BROKER_PORT`                | no       | `5672`      | Broker port                              |
//! | `BROKER_USER`                | no       | `guest`     | Broker user                              |
//! | `BROKER_PASSWORD`            | no       | `guest`     | Broker password                          |
//! | `BROKER_VHOST`               | no       | `/`         | Broker virtual host                      |

use std::sync::Arc;

use jobmq_broker::{
    AmqpBroker, ChannelAction, DeclareExchange, DeclareQueue, ExchangeKind, ExchangeSpec,
    QueueSpec,
};
use jobmq_worker::{
    Engine, EngineConfig, EngineRegistry, JobCommandProcessor, JobResponder, ShellJob,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "jobmq_worker=info,jobmq_broker=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = EngineConfig::from_env().unwrap_or_else(|e| {
        tracing::error!(error = %e, "Invalid worker configuration");
        std::process::exit(1);
    });

    let pre_start: Box<dyn ChannelAction> = if config.queue.is_empty() {
        Box::new(DeclareExchange(
            ExchangeSpec::new(config.exchange.clone(), ExchangeKind::Fanout).durable(true),
        ))
    } else {
        Box::new(DeclareQueue(QueueSpec::named(config.queue.clone()).durable(true)))
    };

    tracing::info!(
        target_broker = %config.connection,
        queue = %config.queue,
        exchange = %config.exchange,
        max_concurrent_jobs = config.max_concurrent_jobs,
        "Starting jobmq-worker",
    );

    let registry = EngineRegistry::global();
    let engine = registry
        .default_or_init(|| {
            Engine::builder(
                Arc::new(AmqpBroker::new()),
                config,
                JobCommandProcessor::<ShellJob>::default(),
                JobResponder::new(),
            )
            .pre_start(pre_start)
            .build()
        })
        .unwrap_or_else(|e| {
            tracing::error!(error = %e, "Could not create the worker engine");
            std::process::exit(1);
        });

    if let Err(e) = engine.start().await {
        tracing::error!(error = %e, "Worker failed to start");
        std::process::exit(1);
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }

    tracing::info!("Shutdown signal received");
    if let Err(e) = registry.shutdown_all().await {
        tracing::error!(error = %e, "Worker shut down with errors");
        std::process::exit(1);
    }
    tracing::info!("Worker stopped");
}
