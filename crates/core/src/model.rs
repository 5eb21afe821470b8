// crates/core/src/model.rs
//! Job snapshot model.
//!
//! A [`Job`] is one immutable, point-in-time description of a backend job.
//! The payloads that only make sense in some states (progress, result,
//! failure details) live inside [`JobStatus`] so they are unreachable in
//! the others.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Backend-issued job identifier.
pub type JobId = u64;

/// Flat job state, as reported on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Waiting,
    Running,
    Success,
    Failed,
    Error,
    Aborted,
}

impl JobState {
    /// Terminal states never transition back to a non-terminal one.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Success | JobState::Failed | JobState::Error | JobState::Aborted
        )
    }

    /// `Failed` and `Error` are handled identically.
    pub fn is_failure(self) -> bool {
        matches!(self, JobState::Failed | JobState::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Waiting => "WAITING",
            JobState::Running => "RUNNING",
            JobState::Success => "SUCCESS",
            JobState::Failed => "FAILED",
            JobState::Error => "ERROR",
            JobState::Aborted => "ABORTED",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Progress report attached to a running job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobProgress {
    /// `None` means indeterminate.
    #[serde(default)]
    pub percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl JobProgress {
    pub fn new(percent: Option<f64>, description: Option<&str>) -> Self {
        Self {
            percent,
            description: description.map(str::to_owned),
        }
    }
}

/// Failure details carried by `Failed` and `Error` snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    /// Short human-readable error.
    pub message: Option<String>,
    /// Backend traceback, if any.
    pub exception: Option<String>,
    /// Exception class name reported by the backend.
    pub kind: Option<String>,
}

impl JobFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::default()
        }
    }
}

/// State-keyed payload of a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum JobStatus {
    Waiting,
    Running { progress: Option<JobProgress> },
    Success { result: Value },
    Failed { error: JobFailure },
    Error { error: JobFailure },
    Aborted,
}

impl JobStatus {
    pub fn state(&self) -> JobState {
        match self {
            JobStatus::Waiting => JobState::Waiting,
            JobStatus::Running { .. } => JobState::Running,
            JobStatus::Success { .. } => JobState::Success,
            JobStatus::Failed { .. } => JobState::Failed,
            JobStatus::Error { .. } => JobState::Error,
            JobStatus::Aborted => JobState::Aborted,
        }
    }

    /// Shorthand for a running status with a progress report.
    pub fn running(percent: Option<f64>, description: Option<&str>) -> Self {
        JobStatus::Running {
            progress: Some(JobProgress::new(percent, description)),
        }
    }
}

/// One immutable snapshot of a backend job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawJob", into = "RawJob")]
pub struct Job {
    pub id: JobId,
    /// Backend method that created the job, e.g. `pool.scrub`.
    pub method: String,
    pub description: Option<String>,
    pub logs_path: Option<String>,
    pub abortable: bool,
    pub status: JobStatus,
}

impl Job {
    /// A waiting, non-abortable job without logs.
    pub fn new(id: JobId, method: impl Into<String>) -> Self {
        Self {
            id,
            method: method.into(),
            description: None,
            logs_path: None,
            abortable: false,
            status: JobStatus::Waiting,
        }
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_logs_path(mut self, path: impl Into<String>) -> Self {
        self.logs_path = Some(path.into());
        self
    }

    pub fn with_abortable(mut self, abortable: bool) -> Self {
        self.abortable = abortable;
        self
    }

    pub fn state(&self) -> JobState {
        self.status.state()
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn progress(&self) -> Option<&JobProgress> {
        match &self.status {
            JobStatus::Running { progress } => progress.as_ref(),
            _ => None,
        }
    }

    pub fn result(&self) -> Option<&Value> {
        match &self.status {
            JobStatus::Success { result } => Some(result),
            _ => None,
        }
    }

    pub fn failure(&self) -> Option<&JobFailure> {
        match &self.status {
            JobStatus::Failed { error } | JobStatus::Error { error } => Some(error),
            _ => None,
        }
    }

    /// Log path usable for tailing; empty paths count as absent.
    pub fn tail_path(&self) -> Option<&str> {
        self.logs_path.as_deref().filter(|p| !p.is_empty())
    }

    /// Abort is only offered for abortable jobs that have not finished.
    pub fn can_abort(&self) -> bool {
        self.abortable && matches!(self.state(), JobState::Waiting | JobState::Running)
    }
}

// =============================================================================
// Wire shape
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ExcInfo {
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    kind: Option<String>,
}

/// Flat snapshot as sent by the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawJob {
    id: JobId,
    method: String,
    state: JobState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    progress: Option<JobProgress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    exception: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    exc_info: Option<ExcInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    logs_path: Option<String>,
    #[serde(default)]
    abortable: bool,
}

impl From<RawJob> for Job {
    fn from(raw: RawJob) -> Self {
        let failure = || JobFailure {
            message: raw.error.clone(),
            exception: raw.exception.clone(),
            kind: raw.exc_info.as_ref().and_then(|e| e.kind.clone()),
        };
        let status = match raw.state {
            JobState::Waiting => JobStatus::Waiting,
            JobState::Running => JobStatus::Running {
                progress: raw.progress.clone(),
            },
            JobState::Success => JobStatus::Success {
                result: raw.result.clone().unwrap_or(Value::Null),
            },
            JobState::Failed => JobStatus::Failed { error: failure() },
            JobState::Error => JobStatus::Error { error: failure() },
            JobState::Aborted => JobStatus::Aborted,
        };
        Job {
            id: raw.id,
            method: raw.method,
            description: raw.description,
            logs_path: raw.logs_path,
            abortable: raw.abortable,
            status,
        }
    }
}

impl From<Job> for RawJob {
    fn from(job: Job) -> Self {
        let state = job.state();
        let mut raw = RawJob {
            id: job.id,
            method: job.method,
            state,
            description: job.description,
            progress: None,
            result: None,
            error: None,
            exception: None,
            exc_info: None,
            logs_path: job.logs_path,
            abortable: job.abortable,
        };
        match job.status {
            JobStatus::Running { progress } => raw.progress = progress,
            JobStatus::Success { result } => raw.result = Some(result),
            JobStatus::Failed { error } | JobStatus::Error { error } => {
                raw.error = error.message;
                raw.exception = error.exception;
                raw.exc_info = error.kind.map(|kind| ExcInfo { kind: Some(kind) });
            }
            JobStatus::Waiting | JobStatus::Aborted => {}
        }
        raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_terminal_states() {
        assert!(!JobState::Waiting.is_terminal());
        assert!(!JobState::Running.is_terminal());
        assert!(JobState::Success.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(JobState::Error.is_terminal());
        assert!(JobState::Aborted.is_terminal());
    }

    #[test]
    fn test_decode_running_with_progress() {
        let job: Job = serde_json::from_value(json!({
            "id": 12,
            "method": "pool.scrub",
            "state": "RUNNING",
            "progress": {"percent": 42.5, "description": "Scrubbing", "extra": null},
            "logs_path": "/var/log/jobs/12.log",
            "abortable": true
        }))
        .unwrap();

        assert_eq!(job.id, 12);
        assert_eq!(job.state(), JobState::Running);
        assert_eq!(job.progress().unwrap().percent, Some(42.5));
        assert_eq!(job.tail_path(), Some("/var/log/jobs/12.log"));
        assert!(job.can_abort());
    }

    #[test]
    fn test_decode_null_percent_is_indeterminate() {
        let job: Job = serde_json::from_value(json!({
            "id": 1,
            "method": "update.download",
            "state": "RUNNING",
            "progress": {"percent": null, "description": "Preparing"}
        }))
        .unwrap();
        assert_eq!(job.progress().unwrap().percent, None);
    }

    #[test]
    fn test_decode_failure_details() {
        let job: Job = serde_json::from_value(json!({
            "id": 3,
            "method": "replication.run",
            "state": "FAILED",
            "error": "[EFAULT] target unreachable",
            "exception": "Traceback ...",
            "exc_info": {"type": "CallError"}
        }))
        .unwrap();

        let failure = job.failure().unwrap();
        assert_eq!(failure.message.as_deref(), Some("[EFAULT] target unreachable"));
        assert_eq!(failure.kind.as_deref(), Some("CallError"));
        assert!(job.result().is_none());
        assert!(!job.can_abort());
    }

    #[test]
    fn test_decode_success_without_result_is_null() {
        let job: Job = serde_json::from_value(json!({
            "id": 4,
            "method": "core.noop",
            "state": "SUCCESS"
        }))
        .unwrap();
        assert_eq!(job.result(), Some(&Value::Null));
    }

    #[test]
    fn test_decode_unknown_state_is_rejected() {
        let err = serde_json::from_value::<Job>(json!({
            "id": 5,
            "method": "x",
            "state": "PAUSED"
        }));
        assert!(err.is_err());
    }

    #[test]
    fn test_encode_uses_wire_shape() {
        let job = Job::new(7, "cloudsync.sync")
            .with_status(JobStatus::Error {
                error: JobFailure::new("boom"),
            });
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["state"], "ERROR");
        assert_eq!(value["error"], "boom");
        assert!(value.get("progress").is_none());
    }

    #[test]
    fn test_empty_logs_path_is_not_tailable() {
        let job = Job::new(8, "x").with_logs_path("");
        assert_eq!(job.tail_path(), None);
    }

    #[test]
    fn test_waiting_abortable_can_abort() {
        let job = Job::new(9, "x").with_abortable(true);
        assert!(job.can_abort());
        let done = job.with_status(JobStatus::Aborted);
        assert!(!done.can_abort());
    }
}
