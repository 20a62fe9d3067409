//! Units of work and their outcomes.
//!
//! A [`Job`] is built by the caller, carried to a worker inside a
//! [`JobSlot`], executed there, and travels back with its [`JobResult`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// A serializable unit of work that a remote worker can execute.
///
/// Jobs may be executed more than once: a worker that dies before
/// acknowledging its delivery causes the broker to hand the job to
/// another worker. Implementations must tolerate duplicate execution.
#[async_trait]
pub trait Job: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Run the job and report its outcome.
    async fn execute(&mut self) -> JobResult;
}

/// Outcome of executing a [`Job`] on a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub success: bool,

    /// Human-readable detail, usually the failure reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Optional structured output produced by the job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,

    pub finished_at: DateTime<Utc>,
}

impl JobResult {
    /// A successful result without output.
    pub fn success() -> Self {
        Self {
            success: true,
            message: None,
            output: None,
            finished_at: Utc::now(),
        }
    }

    /// A failed result carrying the reason.
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
            output: None,
            finished_at: Utc::now(),
        }
    }

    pub fn with_output(mut self, output: serde_json::Value) -> Self {
        self.output = Some(output);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// A job together with the result written by the worker that ran it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSlot<J> {
    pub job: J,
    #[serde(default)]
    pub result: Option<JobResult>,
}

impl<J> JobSlot<J> {
    pub fn new(job: J) -> Self {
        Self { job, result: None }
    }

    pub fn is_resolved(&self) -> bool {
        self.result.is_some()
    }
}

impl<J: Job> JobSlot<J> {
    /// Execute the job in place and store its result.
    pub async fn run(&mut self) -> &JobResult {
        let result = self.job.execute().await;
        self.result.insert(result)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
