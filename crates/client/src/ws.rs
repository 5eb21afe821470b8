// crates/client/src/ws.rs
//! [`JobTransport`] over a JSON-RPC 2.0 WebSocket.
//!
//! One socket per transport. A writer task drains an outgoing queue into
//! the sink; a reader task routes replies to waiting calls and
//! `collection_update` notifications to job and channel streams. Job
//! snapshots come from a single `core.get_jobs` subscription made at
//! connect time and demultiplexed by job id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, trace, warn};

use jobwatch_core::config::ConnectionConfig;
use jobwatch_core::transport::{ChannelMessage, ChunkStream, JobTransport, SnapshotStream};
use jobwatch_core::{Job, JobId, TransportError};

use crate::rpc::{self, CollectionUpdate, Incoming, UpdateKind};

/// Collection carrying every job state change.
pub const JOBS_COLLECTION: &str = "core.get_jobs";

type Reply = Result<Value, TransportError>;
type JobFeed = mpsc::UnboundedSender<Result<Job, TransportError>>;
type ChunkFeed = mpsc::UnboundedSender<Result<ChannelMessage, TransportError>>;

struct JobWatcher {
    id: u64,
    tx: JobFeed,
    /// A live update arrived; an initial fetch that returns later is stale.
    seen_update: bool,
}

struct ChannelWatcher {
    id: u64,
    tx: ChunkFeed,
}

#[derive(Default)]
struct RouterState {
    connected: bool,
    pending: HashMap<u64, oneshot::Sender<Reply>>,
    jobs: HashMap<JobId, Vec<JobWatcher>>,
    channels: HashMap<String, Vec<ChannelWatcher>>,
}

/// State shared by the transport, its tasks and the stream guards.
struct Router {
    next_id: AtomicU64,
    outgoing: mpsc::UnboundedSender<Message>,
    state: Mutex<RouterState>,
}

impl Router {
    fn lock(&self) -> MutexGuard<'_, RouterState> {
        self.state.lock().unwrap_or_else(|e| {
            tracing::error!("Mutex poisoned on websocket router: {e}");
            e.into_inner()
        })
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn send_request(&self, id: u64, method: &str, params: &Value) -> Result<(), TransportError> {
        self.outgoing
            .send(Message::Text(rpc::request(id, method, params).into()))
            .map_err(|_| TransportError::Disconnected)
    }

    fn dispatch(&self, text: &str) {
        match rpc::parse_incoming(text) {
            Ok(Incoming::Reply { id, result }) => {
                let waiter = self.lock().pending.remove(&id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(result);
                    }
                    None => trace!(id, "reply without a waiting call"),
                }
            }
            Ok(Incoming::CollectionUpdate(update)) if update.collection == JOBS_COLLECTION => {
                self.route_job_update(update);
            }
            Ok(Incoming::CollectionUpdate(update)) => self.route_channel_update(update),
            Ok(Incoming::Other(method)) => trace!(%method, "ignoring notification"),
            Err(e) => warn!(error = %e, "dropping malformed frame"),
        }
    }

    fn route_job_update(&self, update: CollectionUpdate) {
        if !matches!(update.msg, UpdateKind::Added | UpdateKind::Changed) {
            return;
        }
        let Some(mut fields) = update.fields else {
            return;
        };
        if let (Some(object), Some(id)) = (fields.as_object_mut(), update.id) {
            object.entry("id").or_insert(id);
        }
        let job: Job = match serde_json::from_value(fields) {
            Ok(job) => job,
            Err(e) => {
                warn!(error = %e, "undecodable job update");
                return;
            }
        };
        self.deliver_job(job);
    }

    /// Send to every watcher of the job. A terminal snapshot ends them.
    fn deliver_job(&self, job: Job) {
        let mut state = self.lock();
        let Some(watchers) = state.jobs.get_mut(&job.id) else {
            return;
        };
        watchers.retain_mut(|w| {
            w.seen_update = true;
            w.tx.send(Ok(job.clone())).is_ok()
        });
        if job.is_terminal() || watchers.is_empty() {
            state.jobs.remove(&job.id);
        }
    }

    fn route_channel_update(&self, update: CollectionUpdate) {
        let mut state = self.lock();
        let Some(watchers) = state.channels.get_mut(&update.collection) else {
            trace!(collection = %update.collection, "update for unknown channel");
            return;
        };
        let message = update
            .fields
            .and_then(|f| serde_json::from_value::<ChannelMessage>(f).ok())
            .unwrap_or_default();
        watchers.retain(|w| w.tx.send(Ok(message.clone())).is_ok());
    }

    /// Connection lost: fail every call and end every stream.
    fn fail_all(&self) {
        let mut state = self.lock();
        state.connected = false;
        for (_, tx) in state.pending.drain() {
            let _ = tx.send(Err(TransportError::Disconnected));
        }
        for (_, watchers) in state.jobs.drain() {
            for w in watchers {
                let _ = w.tx.send(Err(TransportError::Disconnected));
            }
        }
        for (_, watchers) in state.channels.drain() {
            for w in watchers {
                let _ = w.tx.send(Err(TransportError::Disconnected));
            }
        }
    }

    async fn call(&self, method: &str, params: Value, timeout: Duration) -> Reply {
        let id = self.next_id();
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.lock();
            if !state.connected {
                return Err(TransportError::Disconnected);
            }
            state.pending.insert(id, tx);
        }
        if let Err(e) = self.send_request(id, method, &params) {
            self.lock().pending.remove(&id);
            return Err(e);
        }
        trace!(id, method, "request sent");

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(TransportError::Disconnected),
            Err(_) => {
                self.lock().pending.remove(&id);
                Err(TransportError::Timeout {
                    method: method.to_owned(),
                })
            }
        }
    }
}

/// Removes a job watcher when its stream is dropped.
struct JobWatchGuard {
    router: Arc<Router>,
    job_id: JobId,
    watcher: u64,
}

impl Drop for JobWatchGuard {
    fn drop(&mut self) {
        let mut state = self.router.lock();
        if let Some(watchers) = state.jobs.get_mut(&self.job_id) {
            watchers.retain(|w| w.id != self.watcher);
            if watchers.is_empty() {
                state.jobs.remove(&self.job_id);
            }
        }
        debug!(job_id = self.job_id, "job stream released");
    }
}

/// Removes a channel watcher and unsubscribes on the backend.
struct ChannelGuard {
    router: Arc<Router>,
    channel: String,
    watcher: u64,
    subscription: Value,
}

impl Drop for ChannelGuard {
    fn drop(&mut self) {
        let connected = {
            let mut state = self.router.lock();
            if let Some(watchers) = state.channels.get_mut(&self.channel) {
                watchers.retain(|w| w.id != self.watcher);
                if watchers.is_empty() {
                    state.channels.remove(&self.channel);
                }
            }
            state.connected
        };
        if connected && !self.subscription.is_null() {
            let id = self.router.next_id();
            let _ = self
                .router
                .send_request(id, "core.unsubscribe", &json!([self.subscription]));
        }
        debug!(channel = %self.channel, "channel unsubscribed");
    }
}

pub struct WsTransport {
    url: String,
    router: Arc<Router>,
    request_timeout: Duration,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl WsTransport {
    /// Open the socket and subscribe to job updates.
    pub async fn connect(config: &ConnectionConfig) -> Result<Self, TransportError> {
        let url = config.url.clone();
        let (socket, _) = connect_async(url.as_str())
            .await
            .map_err(|e| TransportError::Connect {
                url: url.clone(),
                message: e.to_string(),
            })?;
        let (mut sink, mut stream) = socket.split();
        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<Message>();

        let router = Arc::new(Router {
            next_id: AtomicU64::new(1),
            outgoing,
            state: Mutex::new(RouterState {
                connected: true,
                ..RouterState::default()
            }),
        });

        let writer = tokio::spawn(async move {
            while let Some(message) = outgoing_rx.recv().await {
                if let Err(e) = sink.send(message).await {
                    warn!("websocket send failed: {e}");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let reader_router = Arc::clone(&router);
        let reader = tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(Message::Text(text)) => reader_router.dispatch(text.as_str()),
                    Ok(Message::Close(frame)) => {
                        debug!(?frame, "server closed the connection");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("websocket receive failed: {e}");
                        break;
                    }
                }
            }
            reader_router.fail_all();
            info!("job service connection closed");
        });

        let transport = Self {
            url,
            router,
            request_timeout: config.request_timeout(),
            reader,
            writer,
        };
        transport.call("core.subscribe", json!([JOBS_COLLECTION])).await?;
        info!(url = %transport.url, "connected to job service");
        Ok(transport)
    }

    /// [`connect`](Self::connect) with exponential backoff.
    pub async fn connect_with_retry(config: &ConnectionConfig) -> Result<Self, TransportError> {
        let attempts = config.connect_attempts.max(1);
        let mut backoff = Duration::from_secs(1);
        let mut attempt = 1;
        loop {
            match Self::connect(config).await {
                Ok(transport) => return Ok(transport),
                Err(e) if attempt < attempts => {
                    warn!(attempt, backoff_secs = backoff.as_secs(), "connect failed: {e}");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(config.max_reconnect_delay());
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_connected(&self) -> bool {
        self.router.lock().connected
    }

    async fn fetch_job(&self, job_id: JobId) -> Result<Option<Job>, TransportError> {
        let reply = self
            .call(JOBS_COLLECTION, json!([[["id", "=", job_id]]]))
            .await?;
        let mut jobs: Vec<Job> = serde_json::from_value(reply)
            .map_err(|e| TransportError::Protocol(format!("invalid job list: {e}")))?;
        Ok(jobs.pop())
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
        self.router.fail_all();
    }
}

#[async_trait]
impl JobTransport for WsTransport {
    async fn start_job(&self, method: &str, params: Value) -> Result<JobId, TransportError> {
        let reply = self.call(method, params).await?;
        reply
            .as_u64()
            .ok_or_else(|| TransportError::Protocol(format!("{method} did not return a job id: {reply}")))
    }

    async fn job_updates(&self, job_id: JobId) -> Result<SnapshotStream, TransportError> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let watcher = self.router.next_id();
        {
            let mut state = self.router.lock();
            if !state.connected {
                return Err(TransportError::Disconnected);
            }
            state.jobs.entry(job_id).or_default().push(JobWatcher {
                id: watcher,
                tx: tx.clone(),
                seen_update: false,
            });
        }
        let guard = JobWatchGuard {
            router: Arc::clone(&self.router),
            job_id,
            watcher,
        };

        let current = match self.fetch_job(job_id).await? {
            Some(job) => job,
            None => {
                return Err(TransportError::Rpc {
                    code: 2,
                    message: format!("job {job_id} does not exist"),
                })
            }
        };

        // Live updates that raced the fetch are newer than `current`.
        {
            let mut state = self.router.lock();
            let stale = state
                .jobs
                .get(&job_id)
                .and_then(|ws| ws.iter().find(|w| w.id == watcher))
                .map_or(true, |w| w.seen_update);
            if !stale {
                let _ = tx.send(Ok(current.clone()));
                if current.is_terminal() {
                    if let Some(watchers) = state.jobs.get_mut(&job_id) {
                        watchers.retain(|w| w.id != watcher);
                    }
                }
            }
        }
        drop(tx);
        debug!(job_id, state = %current.state(), "job stream opened");

        let stream = async_stream::stream! {
            let _guard = guard;
            while let Some(item) = rx.recv().await {
                yield item;
            }
        };
        Ok(stream.boxed())
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, TransportError> {
        self.router
            .call(method, rpc::normalize_params(params), self.request_timeout)
            .await
    }

    async fn subscribe_channel(&self, channel: &str) -> Result<ChunkStream, TransportError> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let watcher = self.router.next_id();
        {
            let mut state = self.router.lock();
            if !state.connected {
                return Err(TransportError::Disconnected);
            }
            state
                .channels
                .entry(channel.to_owned())
                .or_default()
                .push(ChannelWatcher { id: watcher, tx });
        }
        let mut guard = ChannelGuard {
            router: Arc::clone(&self.router),
            channel: channel.to_owned(),
            watcher,
            subscription: Value::Null,
        };

        guard.subscription = self.call("core.subscribe", json!([channel])).await?;
        debug!(%channel, subscription = %guard.subscription, "channel subscribed");

        let stream = async_stream::stream! {
            let _guard = guard;
            while let Some(item) = rx.recv().await {
                yield item;
            }
        };
        Ok(stream.boxed())
    }

    async fn list_jobs(&self) -> Result<Vec<Job>, TransportError> {
        let reply = self.call(JOBS_COLLECTION, json!([])).await?;
        serde_json::from_value(reply).map_err(|e| TransportError::Protocol(format!("invalid job list: {e}")))
    }
}
