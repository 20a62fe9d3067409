//! Bounded pool that runs command handlers.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;

/// Runs at most `capacity` tasks at once.
///
/// [`submit`](Self::submit) waits for a free slot, which pushes back on
/// the engine's poll loop when every handler is busy.
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    tasks: TaskTracker,
    capacity: usize,
}

impl WorkerPool {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            tasks: TaskTracker::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Tasks currently running.
    pub fn in_flight(&self) -> usize {
        self.capacity - self.permits.available_permits()
    }

    /// Spawn `task` once a slot is free.
    ///
    /// Returns `false` without running the task if no slot can be acquired.
    pub async fn submit<F>(&self, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Ok(permit) = Arc::clone(&self.permits).acquire_owned().await else {
            return false;
        };
        self.tasks.spawn(async move {
            task.await;
            drop(permit);
        });
        true
    }

    /// Wait until every submitted task has finished. The pool stays usable.
    pub async fn drain(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
