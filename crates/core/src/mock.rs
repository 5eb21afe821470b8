// crates/core/src/mock.rs
//! In-memory [`JobTransport`] for tests.
//!
//! Every upstream stream handed out is wrapped so the mock can count how
//! often each job/channel was opened and released.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::abort::Confirm;
use crate::error::TransportError;
use crate::model::{Job, JobId};
use crate::transport::{ChannelMessage, ChunkStream, JobTransport, SnapshotStream};

type JobFeed = mpsc::UnboundedSender<Result<Job, TransportError>>;
type ChunkFeed = mpsc::UnboundedSender<Result<ChannelMessage, TransportError>>;

/// Receiver that bumps a counter when dropped.
struct Tracked<T> {
    rx: mpsc::UnboundedReceiver<T>,
    releases: Arc<AtomicUsize>,
}

impl<T> Stream for Tracked<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.rx.poll_recv(cx)
    }
}

impl<T> Drop for Tracked<T> {
    fn drop(&mut self) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct MockState {
    job_feeds: HashMap<JobId, JobFeed>,
    job_opens: HashMap<JobId, usize>,
    job_releases: HashMap<JobId, Arc<AtomicUsize>>,
    job_open_failures: HashMap<JobId, TransportError>,
    channel_feeds: HashMap<String, ChunkFeed>,
    channel_opens: HashMap<String, usize>,
    channel_releases: HashMap<String, Arc<AtomicUsize>>,
    channel_open_failures: HashMap<String, TransportError>,
    calls: Vec<(String, Value)>,
    call_failure: Option<TransportError>,
    listed: Vec<Job>,
    next_job_id: JobId,
}

/// Scriptable transport: tests push snapshots and chunks, then inspect
/// what the code under test opened, released and called.
#[derive(Default)]
pub struct MockTransport {
    state: Mutex<MockState>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Deliver a snapshot on the open upstream for `job.id`.
    /// Returns false if no upstream is open.
    pub fn push(&self, job: Job) -> bool {
        let state = self.lock();
        match state.job_feeds.get(&job.id) {
            Some(feed) => feed.send(Ok(job)).is_ok(),
            None => false,
        }
    }

    /// Fail the open upstream for `job_id`.
    pub fn fail(&self, job_id: JobId, error: TransportError) -> bool {
        let state = self.lock();
        match state.job_feeds.get(&job_id) {
            Some(feed) => feed.send(Err(error)).is_ok(),
            None => false,
        }
    }

    /// End the upstream for `job_id` without a terminal snapshot.
    pub fn end(&self, job_id: JobId) {
        self.lock().job_feeds.remove(&job_id);
    }

    /// Make the next `job_updates(job_id)` call fail.
    pub fn reject_open(&self, job_id: JobId, error: TransportError) {
        self.lock().job_open_failures.insert(job_id, error);
    }

    pub fn push_chunk(&self, channel: &str, message: ChannelMessage) -> bool {
        let state = self.lock();
        match state.channel_feeds.get(channel) {
            Some(feed) => feed.send(Ok(message)).is_ok(),
            None => false,
        }
    }

    pub fn fail_channel(&self, channel: &str, error: TransportError) -> bool {
        let state = self.lock();
        match state.channel_feeds.get(channel) {
            Some(feed) => feed.send(Err(error)).is_ok(),
            None => false,
        }
    }

    /// Make the next `subscribe_channel(channel)` call fail.
    pub fn reject_channel(&self, channel: &str, error: TransportError) {
        self.lock().channel_open_failures.insert(channel.to_owned(), error);
    }

    /// Make every subsequent `call` fail with `error` (`None` to reset).
    pub fn set_call_failure(&self, error: Option<TransportError>) {
        self.lock().call_failure = error;
    }

    /// Jobs returned by `list_jobs`.
    pub fn set_jobs(&self, jobs: Vec<Job>) {
        self.lock().listed = jobs;
    }

    pub fn opens(&self, job_id: JobId) -> usize {
        self.lock().job_opens.get(&job_id).copied().unwrap_or(0)
    }

    pub fn releases(&self, job_id: JobId) -> usize {
        self.lock()
            .job_releases
            .get(&job_id)
            .map(|c| c.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    pub fn channel_opens(&self, channel: &str) -> usize {
        self.lock().channel_opens.get(channel).copied().unwrap_or(0)
    }

    pub fn channel_releases(&self, channel: &str) -> usize {
        self.lock()
            .channel_releases
            .get(channel)
            .map(|c| c.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Every `call`/`start_job` so far, in order.
    pub fn calls(&self) -> Vec<(String, Value)> {
        self.lock().calls.clone()
    }

    pub fn calls_to(&self, method: &str) -> Vec<Value> {
        self.lock()
            .calls
            .iter()
            .filter(|(m, _)| m == method)
            .map(|(_, p)| p.clone())
            .collect()
    }
}

#[async_trait]
impl JobTransport for MockTransport {
    async fn start_job(&self, method: &str, params: Value) -> Result<JobId, TransportError> {
        let mut state = self.lock();
        state.calls.push((method.to_owned(), params));
        if let Some(err) = state.call_failure.clone() {
            return Err(err);
        }
        state.next_job_id += 1;
        Ok(state.next_job_id)
    }

    async fn job_updates(&self, job_id: JobId) -> Result<SnapshotStream, TransportError> {
        let mut state = self.lock();
        *state.job_opens.entry(job_id).or_default() += 1;
        if let Some(err) = state.job_open_failures.remove(&job_id) {
            return Err(err);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.job_feeds.insert(job_id, tx);
        let releases = Arc::clone(state.job_releases.entry(job_id).or_default());
        Ok(Tracked { rx, releases }.boxed())
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, TransportError> {
        let mut state = self.lock();
        state.calls.push((method.to_owned(), params));
        match state.call_failure.clone() {
            Some(err) => Err(err),
            None => Ok(Value::Null),
        }
    }

    async fn subscribe_channel(&self, channel: &str) -> Result<ChunkStream, TransportError> {
        let mut state = self.lock();
        *state.channel_opens.entry(channel.to_owned()).or_default() += 1;
        if let Some(err) = state.channel_open_failures.remove(channel) {
            return Err(err);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.channel_feeds.insert(channel.to_owned(), tx);
        let releases = Arc::clone(state.channel_releases.entry(channel.to_owned()).or_default());
        Ok(Tracked { rx, releases }.boxed())
    }

    async fn list_jobs(&self) -> Result<Vec<Job>, TransportError> {
        let state = self.lock();
        match state.call_failure.clone() {
            Some(err) => Err(err),
            None => Ok(state.listed.clone()),
        }
    }
}

/// Confirmation stub that always answers the same way and counts prompts.
#[derive(Debug, Default)]
pub struct StaticConfirm {
    answer: bool,
    asked: AtomicUsize,
}

impl StaticConfirm {
    pub fn new(answer: bool) -> Arc<Self> {
        Arc::new(Self {
            answer,
            asked: AtomicUsize::new(0),
        })
    }

    pub fn asked(&self) -> usize {
        self.asked.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Confirm for StaticConfirm {
    async fn confirm(&self, _job: &Job) -> bool {
        self.asked.fetch_add(1, Ordering::SeqCst);
        self.answer
    }
}

/// Poll `condition` until it holds or roughly a second has passed.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
