// crates/core/src/operator.rs
//! Start a backend job and open a progress view for it.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use crate::abort::AbortCoordinator;
use crate::broker::JobBroker;
use crate::error::TransportError;
use crate::model::{Job, JobId};
use crate::progress::{ProgressConfig, ProgressController, ProgressEvent, ProgressHandle, ProgressViewState};
use crate::transport::JobTransport;

/// How to turn a successful job into a download request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DownloadOptions {
    /// Backend method that serves the file.
    pub method: String,
    /// Fixed arguments for `method`.
    #[serde(default)]
    pub args: Map<String, Value>,
    #[serde(default)]
    pub filename: Option<String>,
    /// When set, the job result is passed to `method` under this name.
    #[serde(default)]
    pub result_as_argument: Option<String>,
}

impl DownloadOptions {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            ..Self::default()
        }
    }

    pub fn with_result_as(mut self, name: impl Into<String>) -> Self {
        self.result_as_argument = Some(name.into());
        self
    }

    pub fn with_arg(mut self, name: impl Into<String>, value: Value) -> Self {
        self.args.insert(name.into(), value);
        self
    }

    pub fn request_for(&self, job: &Job) -> DownloadRequest {
        let mut args = self.args.clone();
        if let Some(name) = &self.result_as_argument {
            args.insert(name.clone(), job.result().cloned().unwrap_or(Value::Null));
        }
        DownloadRequest {
            job_id: job.id,
            method: self.method.clone(),
            args,
            filename: self.filename.clone(),
        }
    }
}

/// A download the host should perform. The core never fetches anything.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadRequest {
    pub job_id: JobId,
    pub method: String,
    pub args: Map<String, Value>,
    pub filename: Option<String>,
}

impl DownloadRequest {
    pub fn argument(&self, name: &str) -> Option<&Value> {
        self.args.get(name)
    }
}

/// Starts jobs and wires progress views to them.
#[derive(Clone)]
pub struct JobOperator {
    transport: Arc<dyn JobTransport>,
    broker: JobBroker,
    abort: AbortCoordinator,
}

impl JobOperator {
    pub fn new(transport: Arc<dyn JobTransport>, broker: JobBroker, abort: AbortCoordinator) -> Self {
        Self {
            transport,
            broker,
            abort,
        }
    }

    /// Issue `method(params)` and watch the resulting job.
    pub async fn start(
        &self,
        method: &str,
        params: Value,
        config: ProgressConfig,
    ) -> Result<ProgressSession, TransportError> {
        let job_id = self.transport.start_job(method, params).await?;
        info!(job_id, method, "job started");
        Ok(self.observe(job_id, config))
    }

    /// Open a progress view for a job that is already running.
    pub fn observe(&self, job_id: JobId, config: ProgressConfig) -> ProgressSession {
        let (controller, handle, events) = ProgressController::open(
            &self.broker,
            Arc::clone(&self.transport),
            self.abort.clone(),
            job_id,
            config,
        );
        ProgressSession {
            job_id,
            handle,
            events,
            task: tokio::spawn(controller.run()),
        }
    }
}

/// A progress view running on its own task.
pub struct ProgressSession {
    job_id: JobId,
    handle: ProgressHandle,
    events: mpsc::UnboundedReceiver<ProgressEvent>,
    task: JoinHandle<ProgressViewState>,
}

impl ProgressSession {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn handle(&self) -> ProgressHandle {
        self.handle.clone()
    }

    /// `None` once the view has ended and every event was read.
    pub async fn next_event(&mut self) -> Option<ProgressEvent> {
        self.events.recv().await
    }

    /// Close the view and wait for its teardown. Returns the final view
    /// state, or `None` if the task panicked.
    pub async fn finish(self) -> Option<ProgressViewState> {
        self.handle.close();
        match self.task.await {
            Ok(view) => Some(view),
            Err(e) => {
                tracing::error!(job_id = self.job_id, "progress task failed: {e}");
                None
            }
        }
    }
}
