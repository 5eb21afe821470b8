// crates/core/src/tail.rs
//! Live log tailing for a single job.
//!
//! The backend exposes a job's execution log as a push channel named
//! `"<namespace>:<logs_path>"`. Chunks are appended to a per-observer
//! [`LogBuffer`]; the buffer never replaces existing content.

use futures_util::StreamExt;
use tracing::{debug, trace};

use crate::error::TransportError;
use crate::transport::{ChunkStream, JobTransport};

/// Default channel namespace for file tailing.
pub const DEFAULT_CHANNEL_NAMESPACE: &str = "filesystem.file_tail_follow";

/// Build the push channel name for a log path.
pub fn channel_name(namespace: &str, logs_path: &str) -> String {
    format!("{namespace}:{logs_path}")
}

/// Append-only text buffer for tailed log output.
///
/// With a byte cap, the oldest text is dropped (at a char boundary) once
/// the cap is exceeded; the order of what remains is unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogBuffer {
    text: String,
    max_bytes: Option<usize>,
    dropped_bytes: usize,
}

impl LogBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// `0` means unbounded.
    pub fn with_limit(max_bytes: usize) -> Self {
        Self {
            max_bytes: (max_bytes > 0).then_some(max_bytes),
            ..Self::default()
        }
    }

    /// Append a chunk. Empty chunks are ignored. Returns whether anything
    /// was appended.
    pub fn append(&mut self, chunk: &str) -> bool {
        if chunk.is_empty() {
            return false;
        }
        self.text.push_str(chunk);
        self.enforce_limit();
        true
    }

    fn enforce_limit(&mut self) {
        let Some(max) = self.max_bytes else { return };
        if self.text.len() <= max {
            return;
        }
        let mut cut = self.text.len() - max;
        while !self.text.is_char_boundary(cut) {
            cut += 1;
        }
        self.text.drain(..cut);
        self.dropped_bytes += cut;
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// Bytes discarded from the front because of the cap.
    pub fn dropped_bytes(&self) -> usize {
        self.dropped_bytes
    }
}

/// An active log tail subscription. Dropping it unsubscribes.
pub struct LogTail {
    channel: String,
    chunks: ChunkStream,
}

impl LogTail {
    /// Subscribe to the log channel for `logs_path`.
    pub async fn start(
        transport: &dyn JobTransport,
        namespace: &str,
        logs_path: &str,
    ) -> Result<Self, TransportError> {
        let channel = channel_name(namespace, logs_path);
        let chunks = transport.subscribe_channel(&channel).await?;
        debug!(%channel, "log tail started");
        Ok(Self { channel, chunks })
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Next non-empty text chunk. Non-string and empty payloads are skipped.
    /// `None` once the channel has ended.
    pub async fn next_chunk(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            match self.chunks.next().await? {
                Ok(message) => match message.as_text() {
                    Some(text) => return Some(Ok(text.to_owned())),
                    None => trace!(channel = %self.channel, "ignoring non-text log chunk"),
                },
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

impl Drop for LogTail {
    fn drop(&mut self) {
        debug!(channel = %self.channel, "log tail closed");
    }
}
