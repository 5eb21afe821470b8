// crates/core/src/abort.rs
//! Job cancellation with an explicit confirmation step.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};

use crate::error::AbortError;
use crate::model::Job;
use crate::transport::{JobTransport, JOB_ABORT_METHOD};

/// Asks the user whether a job should really be aborted.
#[async_trait]
pub trait Confirm: Send + Sync {
    async fn confirm(&self, job: &Job) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortDecision {
    /// The job is not abortable or already finished. Nothing was sent.
    NotAbortable,
    /// The user said no. Nothing was sent.
    Declined,
    /// The backend accepted the abort call. The job has not necessarily
    /// stopped yet.
    Requested,
}

/// Issues `core.job_abort` after confirmation.
///
/// The coordinator never sets any view flag itself: on
/// [`AbortDecision::Requested`] the caller marks its view as aborting, and
/// that flag stays set until the job's own stream reports a terminal state.
#[derive(Clone)]
pub struct AbortCoordinator {
    transport: Arc<dyn JobTransport>,
    confirm: Arc<dyn Confirm>,
}

impl AbortCoordinator {
    pub fn new(transport: Arc<dyn JobTransport>, confirm: Arc<dyn Confirm>) -> Self {
        Self { transport, confirm }
    }

    pub async fn request_abort(&self, job: &Job) -> Result<AbortDecision, AbortError> {
        if !job.can_abort() {
            return Ok(AbortDecision::NotAbortable);
        }
        if !self.confirm.confirm(job).await {
            info!(job_id = job.id, "abort declined");
            return Ok(AbortDecision::Declined);
        }

        match self.transport.call(JOB_ABORT_METHOD, json!([job.id])).await {
            Ok(_) => {
                info!(job_id = job.id, method = %job.method, "abort requested");
                Ok(AbortDecision::Requested)
            }
            Err(source) => {
                warn!(job_id = job.id, error = %source, "abort call failed");
                Err(AbortError::Call {
                    job_id: job.id,
                    source,
                })
            }
        }
    }
}
