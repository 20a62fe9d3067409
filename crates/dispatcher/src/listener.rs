//! Job completion notifications.

use std::sync::atomic::{AtomicU64, Ordering};

use jobmq_core::JobResult;

/// A job that came back from a worker with its result.
#[derive(Debug)]
pub struct JobCompleteEvent<'a, J> {
    /// Position of the job in the submitted batch.
    pub index: usize,
    pub job: &'a J,
    pub result: &'a JobResult,
}

/// Notified once for every job of a batch that resolves.
///
/// Called synchronously on the task running [`Dispatcher::wait`], so
/// implementations should return quickly.
///
/// [`Dispatcher::wait`]: crate::Dispatcher::wait
pub trait JobCompleteListener<J>: Send + Sync {
    fn job_completed(&self, event: &JobCompleteEvent<'_, J>);
}

impl<J, F> JobCompleteListener<J> for F
where
    F: Fn(&JobCompleteEvent<'_, J>) + Send + Sync,
{
    fn job_completed(&self, event: &JobCompleteEvent<'_, J>) {
        self(event)
    }
}

/// Handle returned by [`Dispatcher::add_listener`](crate::Dispatcher::add_listener).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}
