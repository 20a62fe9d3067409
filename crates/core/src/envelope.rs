//! Correlation envelope exchanged between dispatcher and workers.
//!
//! Every published message carries one [`JobBatchEnvelope`]. Its `index`
//! is unique within a batch and is the only key used to match a returning
//! envelope to the job that was dispatched.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::job::JobSlot;

/// Wrapper around the job(s) of one published message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobBatchEnvelope<J> {
    /// Batch index of the first job carried, `0..N-1`.
    ///
    /// Optional on the wire only: an envelope without it cannot be
    /// attributed and is dropped by the receiving dispatcher.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,

    /// Free-form metadata, passed through untouched by workers.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,

    pub jobs: Vec<JobSlot<J>>,
}

impl<J> JobBatchEnvelope<J> {
    /// Envelope holding exactly one job.
    pub fn single(index: usize, job: J) -> Self {
        Self {
            index: Some(index),
            metadata: BTreeMap::new(),
            jobs: vec![JobSlot::new(job)],
        }
    }

    /// Envelope holding a whole batch under index `0`.
    pub fn bundle(jobs: impl IntoIterator<Item = J>) -> Self {
        Self {
            index: Some(0),
            metadata: BTreeMap::new(),
            jobs: jobs.into_iter().map(JobSlot::new).collect(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// True once every carried job has a result.
    pub fn is_resolved(&self) -> bool {
        !self.jobs.is_empty() && self.jobs.iter().all(JobSlot::is_resolved)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobResult;

    #[test]
    fn single_envelope_has_one_unresolved_job() {
        let env = JobBatchEnvelope::single(4, "job".to_string());
        assert_eq!(env.index, Some(4));
        assert_eq!(env.jobs.len(), 1);
        assert!(!env.is_resolved());
    }

    #[test]
    fn bundle_uses_index_zero() {
        let env = JobBatchEnvelope::bundle(vec![1, 2, 3]);
        assert_eq!(env.index, Some(0));
        assert_eq!(env.jobs.len(), 3);
    }

    #[test]
    fn resolved_only_when_all_slots_have_results() {
        let mut env = JobBatchEnvelope::bundle(vec![1, 2]);
        env.jobs[0].result = Some(JobResult::success());
        assert!(!env.is_resolved());

        env.jobs[1].result = Some(JobResult::failure("boom"));
        assert!(env.is_resolved());
    }

    #[test]
    fn empty_envelope_is_never_resolved() {
        let env: JobBatchEnvelope<u8> = JobBatchEnvelope::bundle(Vec::new());
        assert!(!env.is_resolved());
    }

    #[test]
    fn missing_index_deserializes_as_none() {
        let env: JobBatchEnvelope<u8> =
            serde_json::from_str(r#"{"jobs":[{"job":1}]}"#).expect("deserialize");
        assert_eq!(env.index, None);
        assert!(env.metadata.is_empty());
    }

    #[test]
    fn metadata_is_preserved() {
        let env = JobBatchEnvelope::single(0, 1u8).with_metadata("origin", serde_json::json!("cli"));
        let json = serde_json::to_string(&env).expect("serialize");
        let back: JobBatchEnvelope<u8> = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.metadata["origin"], "cli");
    }
}
