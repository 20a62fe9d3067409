//! Dispatcher and worker engines talking through one `MemoryBroker`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jobmq_broker::MemoryBroker;
use jobmq_core::{Job, JobResult};
use jobmq_dispatcher::{DispatchMode, Dispatcher, DispatcherConfig};
use jobmq_worker::{Engine, EngineConfig, JobCommand, JobCommandProcessor, JobResponder};
use serde::{Deserialize, Serialize};

const WORK_QUEUE: &str = "work";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Square {
    n: i64,
}

#[async_trait]
impl Job for Square {
    async fn execute(&mut self) -> JobResult {
        if self.n < 0 {
            return JobResult::failure(format!("{} is negative", self.n));
        }
        JobResult::success().with_output(serde_json::json!(self.n * self.n))
    }
}

fn worker(broker: &MemoryBroker) -> Engine<JobCommand<Square>> {
    Engine::builder(
        Arc::new(broker.clone()),
        EngineConfig::for_queue(WORK_QUEUE).with_poll_timeout(Duration::from_millis(20)),
        JobCommandProcessor::<Square>::default(),
        JobResponder::new(),
    )
    .build()
    .expect("build worker")
}

fn dispatcher(broker: &MemoryBroker, mode: DispatchMode) -> Dispatcher<Square> {
    broker.declare_queue(WORK_QUEUE);
    Dispatcher::new(
        Arc::new(broker.clone()),
        DispatcherConfig::new(WORK_QUEUE).with_mode(mode),
    )
}

fn squares(ns: &[i64]) -> Vec<Square> {
    ns.iter().map(|&n| Square { n }).collect()
}

fn outputs(dispatcher: &Dispatcher<Square>) -> Vec<Option<serde_json::Value>> {
    dispatcher
        .jobs()
        .iter()
        .map(|slot| slot.result.as_ref().and_then(|r| r.output.clone()))
        .collect()
}

// ---------------------------------------------------------------------------
// Test: jobs are spread over two workers and every result comes back
// ---------------------------------------------------------------------------

#[tokio::test]
async fn per_job_batch_across_two_workers() {
    let broker = MemoryBroker::new();
    let dispatcher = dispatcher(&broker, DispatchMode::PerJob);
    let workers = [worker(&broker), worker(&broker)];
    for worker in &workers {
        worker.start().await.expect("start worker");
    }

    dispatcher.start(squares(&[1, 2, 3, 4, 5])).await.expect("start");
    tokio::time::timeout(Duration::from_secs(5), dispatcher.wait())
        .await
        .expect("batch finished in time")
        .expect("wait");

    assert!(!dispatcher.has_pending());
    let expected: Vec<_> = [1, 4, 9, 16, 25]
        .into_iter()
        .map(|n| Some(serde_json::json!(n)))
        .collect();
    assert_eq!(outputs(&dispatcher), expected);

    dispatcher.stop().await.expect("stop dispatcher");
    for worker in &workers {
        worker.stop().await.expect("stop worker");
    }
    assert_eq!(broker.acked().len(), 5);
    assert_eq!(broker.open_connections(), 0);
}

// ---------------------------------------------------------------------------
// Test: a bundled batch is executed and answered as one envelope
// ---------------------------------------------------------------------------

#[tokio::test]
async fn bundled_batch_round_trip() {
    let broker = MemoryBroker::new();
    let dispatcher = dispatcher(&broker, DispatchMode::Bundled);
    let engine = worker(&broker);
    engine.start().await.expect("start worker");

    dispatcher.start(squares(&[3, -1, 4])).await.expect("start");
    tokio::time::timeout(Duration::from_secs(5), dispatcher.wait())
        .await
        .expect("batch finished in time")
        .expect("wait");

    let jobs = dispatcher.jobs();
    let results: Vec<&JobResult> = jobs
        .iter()
        .map(|slot| slot.result.as_ref().expect("resolved"))
        .collect();
    assert!(results[0].success);
    assert!(!results[1].success, "failed jobs still report back");
    assert_eq!(results[1].message.as_deref(), Some("-1 is negative"));
    assert_eq!(results[2].output, Some(serde_json::json!(16)));

    dispatcher.stop().await.expect("stop dispatcher");
    engine.stop().await.expect("stop worker");
    assert_eq!(broker.acked().len(), 1);
}

// ---------------------------------------------------------------------------
// Test: a job the worker refuses stays pending
// ---------------------------------------------------------------------------

#[tokio::test]
async fn refused_job_stays_pending() {
    let broker = MemoryBroker::new();
    let dispatcher = dispatcher(&broker, DispatchMode::PerJob);
    let engine = Engine::builder(
        Arc::new(broker.clone()),
        EngineConfig::for_queue(WORK_QUEUE)
            .with_prefetch(0)
            .with_poll_timeout(Duration::from_millis(20)),
        JobCommandProcessor::<Square>::default(),
        JobResponder::new(),
    )
    .permitter(|command: &JobCommand<Square>| command.envelope.index != Some(1))
    .build()
    .expect("build worker");
    engine.start().await.expect("start worker");

    dispatcher.start(squares(&[2, 3, 4])).await.expect("start");
    let waited = tokio::time::timeout(Duration::from_millis(500), dispatcher.wait()).await;
    assert!(waited.is_err(), "batch cannot finish while index 1 is refused");

    assert_eq!(dispatcher.pending(), vec![1]);
    assert_eq!(
        outputs(&dispatcher),
        vec![Some(serde_json::json!(4)), None, Some(serde_json::json!(16))]
    );

    dispatcher.stop().await.expect("stop dispatcher");
    engine.stop().await.expect("stop worker");
    assert_eq!(
        broker.queue_len(WORK_QUEUE),
        Some(1),
        "refused delivery returns to the queue"
    );
}
