// crates/core/src/error.rs
use std::path::PathBuf;

use thiserror::Error;

use crate::model::JobId;

/// Errors raised by the transport collaborator.
///
/// Cloneable because a single upstream failure is fanned out to every
/// observer of the job.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Failed to connect to {url}: {message}")]
    Connect { url: String, message: String },

    #[error("Connection to the backend was lost")]
    Disconnected,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("Call to {method} timed out")]
    Timeout { method: String },

    #[error("Upstream stream closed before a terminal state")]
    Closed,
}

/// The cancellation call itself failed. Distinct from a job failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AbortError {
    #[error("Failed to abort job {job_id}: {source}")]
    Call {
        job_id: JobId,
        #[source]
        source: TransportError,
    },
}

/// Errors that can occur while loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config file not found: {path}")]
    NotFound { path: PathBuf },

    #[error("IO error reading config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed config {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

impl ConfigError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        match source.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound { path },
            _ => Self::Io { path, source },
        }
    }
}
