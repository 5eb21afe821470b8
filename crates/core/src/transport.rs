// crates/core/src/transport.rs
//! Contract with the remote job service.
//!
//! The core never talks to the network directly; everything goes through a
//! [`JobTransport`]. The WebSocket implementation lives in `jobwatch-client`,
//! an in-memory one in [`crate::mock`].

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::TransportError;
use crate::model::{Job, JobId};

/// Backend method used to cancel a job.
pub const JOB_ABORT_METHOD: &str = "core.job_abort";

/// Snapshots for one job, in emission order. Ends after the terminal one.
/// Dropping the stream releases the upstream subscription.
pub type SnapshotStream = BoxStream<'static, Result<Job, TransportError>>;

/// Messages of a generic push channel. Dropping the stream unsubscribes.
pub type ChunkStream = BoxStream<'static, Result<ChannelMessage, TransportError>>;

/// One message pushed on a channel subscription.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelMessage {
    #[serde(default)]
    pub data: Option<Value>,
}

impl ChannelMessage {
    pub fn text(data: impl Into<String>) -> Self {
        Self {
            data: Some(Value::String(data.into())),
        }
    }

    /// The payload, if it is a non-empty string.
    pub fn as_text(&self) -> Option<&str> {
        match &self.data {
            Some(Value::String(s)) if !s.is_empty() => Some(s.as_str()),
            _ => None,
        }
    }
}

#[async_trait]
pub trait JobTransport: Send + Sync + 'static {
    /// Ask the backend to start `method`; returns the new job id.
    async fn start_job(&self, method: &str, params: Value) -> Result<JobId, TransportError>;

    /// Open the upstream snapshot stream for one job.
    async fn job_updates(&self, job_id: JobId) -> Result<SnapshotStream, TransportError>;

    /// One-shot RPC.
    async fn call(&self, method: &str, params: Value) -> Result<Value, TransportError>;

    /// Subscribe to a named push channel.
    async fn subscribe_channel(&self, channel: &str) -> Result<ChunkStream, TransportError>;

    /// Every job the backend currently knows about.
    async fn list_jobs(&self) -> Result<Vec<Job>, TransportError>;
}
