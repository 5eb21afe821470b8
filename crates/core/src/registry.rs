// crates/core/src/registry.rs
//! Keyed store of every known job plus the aggregate counts shown on the
//! jobs panel.
//!
//! Counts are computed from the map on every read, so they cannot drift.

use std::collections::{HashMap, HashSet};

use crate::error::TransportError;
use crate::model::{Job, JobId, JobState};

#[derive(Debug, Clone, Default)]
pub struct JobRegistry {
    jobs: HashMap<JobId, Job>,
    /// Jobs an abort was sent for. Cleared only when the job leaves the map.
    aborting: HashSet<JobId>,
    is_loading: bool,
    last_error: Option<TransportError>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the snapshot for `job.id` (last write wins).
    pub fn upsert(&mut self, job: Job) {
        self.jobs.insert(job.id, job);
    }

    /// Forget a job. The broker is not touched.
    pub fn remove(&mut self, job_id: JobId) -> Option<Job> {
        self.aborting.remove(&job_id);
        self.jobs.remove(&job_id)
    }

    /// Remember that an abort was requested for a known job.
    pub fn mark_aborting(&mut self, job_id: JobId) -> bool {
        self.jobs.contains_key(&job_id) && self.aborting.insert(job_id)
    }

    pub fn is_aborting(&self, job_id: JobId) -> bool {
        self.aborting.contains(&job_id)
    }

    pub fn job_by_id(&self, job_id: JobId) -> Option<&Job> {
        self.jobs.get(&job_id)
    }

    /// All jobs ordered by id.
    pub fn jobs(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.jobs.values().cloned().collect();
        jobs.sort_by_key(|j| j.id);
        jobs
    }

    pub fn count_by_state(&self, predicate: impl Fn(JobState) -> bool) -> usize {
        self.jobs.values().filter(|j| predicate(j.state())).count()
    }

    pub fn running_count(&self) -> usize {
        self.count_by_state(|s| s == JobState::Running)
    }

    pub fn waiting_count(&self) -> usize {
        self.count_by_state(|s| s == JobState::Waiting)
    }

    /// `Failed` and `Error` both count as failed.
    pub fn failed_count(&self) -> usize {
        self.count_by_state(JobState::is_failure)
    }

    pub fn is_loading(&self) -> bool {
        self.is_loading
    }

    pub fn set_loading(&mut self, loading: bool) {
        self.is_loading = loading;
    }

    pub fn last_error(&self) -> Option<&TransportError> {
        self.last_error.as_ref()
    }

    /// Keep the last known snapshot but remember why its stream ended.
    pub fn record_error(&mut self, error: TransportError) {
        self.last_error = Some(error);
    }

    pub fn clear_error(&mut self) {
        self.last_error = None;
    }

    /// Drop every finished job. Returns how many were removed.
    pub fn prune_terminal(&mut self) -> usize {
        let before = self.jobs.len();
        self.jobs.retain(|_, job| !job.is_terminal());
        let jobs = &self.jobs;
        self.aborting.retain(|id| jobs.contains_key(id));
        before - self.jobs.len()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{JobFailure, JobStatus};

    fn job(id: JobId, status: JobStatus) -> Job {
        Job::new(id, "pool.scrub").with_status(status)
    }

    fn sample() -> JobRegistry {
        let mut registry = JobRegistry::new();
        registry.upsert(job(1, JobStatus::Waiting));
        registry.upsert(job(2, JobStatus::running(None, None)));
        registry.upsert(job(
            3,
            JobStatus::Failed {
                error: JobFailure::new("disk gone"),
            },
        ));
        registry.upsert(job(4, JobStatus::running(Some(80.0), None)));
        registry
    }

    #[test]
    fn test_aggregate_counts() {
        let registry = sample();
        assert_eq!(registry.running_count(), 2);
        assert_eq!(registry.waiting_count(), 1);
        assert_eq!(registry.failed_count(), 1);
    }

    #[test]
    fn test_error_counts_as_failed() {
        let mut registry = sample();
        registry.upsert(job(
            5,
            JobStatus::Error {
                error: JobFailure::new("EPIPE"),
            },
        ));
        assert_eq!(registry.failed_count(), 2);
    }

    #[test]
    fn test_upsert_is_last_write_wins() {
        let mut registry = sample();
        registry.upsert(job(2, JobStatus::Aborted));
        assert_eq!(registry.running_count(), 1);
        assert_eq!(registry.job_by_id(2).unwrap().state(), JobState::Aborted);
        assert_eq!(registry.len(), 4);
    }

    #[test]
    fn test_remove_updates_counts() {
        let mut registry = sample();
        assert!(registry.remove(4).is_some());
        assert!(registry.remove(4).is_none());
        assert_eq!(registry.running_count(), 1);
    }

    #[test]
    fn test_prune_terminal_keeps_live_jobs() {
        let mut registry = sample();
        assert_eq!(registry.prune_terminal(), 1);
        let ids: Vec<JobId> = registry.jobs().iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![1, 2, 4]);
    }

    #[test]
    fn test_aborting_flag_lives_with_the_job() {
        let mut registry = sample();
        assert!(registry.mark_aborting(2));
        assert!(!registry.mark_aborting(2));
        assert!(!registry.mark_aborting(42));

        registry.upsert(job(2, JobStatus::Aborted));
        assert!(registry.is_aborting(2));

        registry.prune_terminal();
        assert!(!registry.is_aborting(2));

        assert!(registry.mark_aborting(4));
        registry.remove(4);
        assert!(!registry.is_aborting(4));
    }

    #[test]
    fn test_error_is_kept_with_last_snapshot() {
        let mut registry = sample();
        registry.record_error(TransportError::Disconnected);
        assert_eq!(registry.last_error(), Some(&TransportError::Disconnected));
        assert_eq!(registry.job_by_id(2).unwrap().state(), JobState::Running);
        registry.clear_error();
        assert!(registry.last_error().is_none());
    }
}
