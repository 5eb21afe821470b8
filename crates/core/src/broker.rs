// crates/core/src/broker.rs
//! Subscription broker: one upstream snapshot stream per job, fanned out to
//! any number of local subscribers.
//!
//! - The first `subscribe` for a job id opens the upstream; later ones only
//!   attach to the existing entry.
//! - New subscribers receive the last seen snapshot first (replay-last),
//!   then every subsequent snapshot in arrival order.
//! - When the last subscriber detaches before the job finished, the
//!   upstream is closed and the entry evicted.
//! - A terminal snapshot is delivered to everyone, then the upstream is
//!   closed and the snapshot cached; late subscribers get only that.
//! - Upstream failures become a terminal [`BrokerEvent::TransportFailed`].

use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::task::{Context, Poll};

use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::BrokerConfig;
use crate::error::TransportError;
use crate::model::{Job, JobId};
use crate::transport::JobTransport;

/// What a subscriber receives.
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerEvent {
    Snapshot(Job),
    /// The upstream failed. Always the last event of a subscription.
    TransportFailed(TransportError),
}

impl BrokerEvent {
    pub fn is_terminal(&self) -> bool {
        match self {
            BrokerEvent::Snapshot(job) => job.is_terminal(),
            BrokerEvent::TransportFailed(_) => true,
        }
    }
}

type SubscriberId = u64;

struct Subscriber {
    id: SubscriberId,
    tx: mpsc::UnboundedSender<BrokerEvent>,
}

/// Per-job entry while the upstream is open.
struct Entry {
    subscribers: Vec<Subscriber>,
    last: Option<Job>,
    upstream: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct BrokerState {
    active: HashMap<JobId, Entry>,
    completed: HashMap<JobId, Job>,
    completed_order: VecDeque<JobId>,
}

struct Inner {
    transport: Arc<dyn JobTransport>,
    config: BrokerConfig,
    next_subscriber: AtomicU64,
    state: Mutex<BrokerState>,
}

/// Outcome of handing one upstream item to the subscribers.
#[derive(Debug, PartialEq, Eq)]
enum Delivery {
    Continue,
    Stop,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            tracing::error!("broker state mutex poisoned; recovering");
            poisoned.into_inner()
        })
    }

    /// Fan a snapshot out. Runs on the upstream task.
    fn deliver(&self, job_id: JobId, job: Job) -> Delivery {
        let mut state = self.lock();
        let Some(entry) = state.active.get_mut(&job_id) else {
            return Delivery::Stop;
        };

        if job.is_terminal() {
            let Some(entry) = state.active.remove(&job_id) else {
                return Delivery::Stop;
            };
            for sub in &entry.subscribers {
                let _ = sub.tx.send(BrokerEvent::Snapshot(job.clone()));
            }
            info!(
                job_id,
                state = %job.state(),
                subscribers = entry.subscribers.len(),
                "job reached terminal state; upstream closed"
            );
            self.remember_completed(&mut state, job);
            return Delivery::Stop;
        }

        entry.last = Some(job.clone());
        entry
            .subscribers
            .retain(|sub| sub.tx.send(BrokerEvent::Snapshot(job.clone())).is_ok());
        if entry.subscribers.is_empty() {
            state.active.remove(&job_id);
            debug!(job_id, "all subscribers gone; upstream closed");
            return Delivery::Stop;
        }
        Delivery::Continue
    }

    /// Deliver a synthetic terminal failure and evict the entry. Failures are
    /// not cached, so a later subscribe opens a fresh upstream.
    fn fail(&self, job_id: JobId, error: TransportError) {
        let mut state = self.lock();
        if let Some(entry) = state.active.remove(&job_id) {
            warn!(
                job_id,
                error = %error,
                subscribers = entry.subscribers.len(),
                "upstream failed"
            );
            for sub in &entry.subscribers {
                let _ = sub.tx.send(BrokerEvent::TransportFailed(error.clone()));
            }
        }
    }

    fn remember_completed(&self, state: &mut BrokerState, job: Job) {
        let capacity = self.config.completed_cache_capacity;
        if capacity == 0 {
            return;
        }
        let job_id = job.id;
        if state.completed.insert(job_id, job).is_none() {
            state.completed_order.push_back(job_id);
        }
        while state.completed_order.len() > capacity {
            if let Some(oldest) = state.completed_order.pop_front() {
                state.completed.remove(&oldest);
            }
        }
    }

    fn detach(&self, job_id: JobId, subscriber: SubscriberId) {
        let mut state = self.lock();
        let Some(entry) = state.active.get_mut(&job_id) else {
            return;
        };
        entry.subscribers.retain(|sub| sub.id != subscriber);
        debug!(job_id, subscribers = entry.subscribers.len(), "subscriber detached");
        if !entry.subscribers.is_empty() {
            return;
        }
        if let Some(entry) = state.active.remove(&job_id) {
            if let Some(upstream) = entry.upstream {
                upstream.abort();
            }
            debug!(job_id, "last subscriber gone; upstream closed");
        }
    }
}

/// Pump one upstream stream into the broker until it finishes.
async fn run_upstream(inner: Weak<Inner>, transport: Arc<dyn JobTransport>, job_id: JobId) {
    let mut stream = match transport.job_updates(job_id).await {
        Ok(stream) => stream,
        Err(e) => {
            if let Some(inner) = inner.upgrade() {
                inner.fail(job_id, e);
            }
            return;
        }
    };
    debug!(job_id, "upstream opened");

    while let Some(item) = stream.next().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        match item {
            Ok(job) if job.id != job_id => {
                warn!(job_id, got = job.id, "ignoring snapshot for another job");
            }
            Ok(job) => {
                if inner.deliver(job_id, job) == Delivery::Stop {
                    return;
                }
            }
            Err(e) => {
                inner.fail(job_id, e);
                return;
            }
        }
    }

    if let Some(inner) = inner.upgrade() {
        inner.fail(job_id, TransportError::Closed);
    }
}

/// Shared, cloneable handle to the broker.
#[derive(Clone)]
pub struct JobBroker {
    inner: Arc<Inner>,
}

impl JobBroker {
    pub fn new(transport: Arc<dyn JobTransport>, config: BrokerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                config,
                next_subscriber: AtomicU64::new(1),
                state: Mutex::new(BrokerState::default()),
            }),
        }
    }

    /// Attach to the snapshot stream of `job_id`.
    ///
    /// Must be called from within a Tokio runtime: the first subscriber for a
    /// job spawns the upstream task.
    pub fn subscribe(&self, job_id: JobId) -> JobSubscription {
        let subscriber = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.inner.lock();

        if let Some(job) = state.completed.get(&job_id) {
            // Finished: replay the terminal snapshot and end the stream.
            let _ = tx.send(BrokerEvent::Snapshot(job.clone()));
            debug!(job_id, "subscribed to finished job; replaying terminal snapshot");
            return JobSubscription::new(job_id, rx, DetachHandle::detached(job_id));
        }

        let entry = state.active.entry(job_id).or_insert_with(|| {
            let weak = Arc::downgrade(&self.inner);
            let transport = Arc::clone(&self.inner.transport);
            Entry {
                subscribers: Vec::new(),
                last: None,
                upstream: Some(tokio::spawn(run_upstream(weak, transport, job_id))),
            }
        });
        if let Some(last) = &entry.last {
            let _ = tx.send(BrokerEvent::Snapshot(last.clone()));
        }
        entry.subscribers.push(Subscriber { id: subscriber, tx });
        debug!(job_id, subscribers = entry.subscribers.len(), "subscriber attached");

        let detach = DetachHandle::new(Arc::downgrade(&self.inner), job_id, subscriber);
        JobSubscription::new(job_id, rx, detach)
    }

    /// Drop the cached terminal snapshot of `job_id`.
    pub fn forget(&self, job_id: JobId) -> bool {
        let mut state = self.inner.lock();
        state.completed_order.retain(|id| *id != job_id);
        state.completed.remove(&job_id).is_some()
    }

    /// Jobs with an open upstream.
    pub fn active_count(&self) -> usize {
        self.inner.lock().active.len()
    }

    pub fn subscriber_count(&self, job_id: JobId) -> usize {
        self.inner
            .lock()
            .active
            .get(&job_id)
            .map(|e| e.subscribers.len())
            .unwrap_or(0)
    }

    pub fn cached_terminal(&self, job_id: JobId) -> Option<Job> {
        self.inner.lock().completed.get(&job_id).cloned()
    }
}

struct DetachInner {
    broker: Weak<Inner>,
    job_id: JobId,
    subscriber: SubscriberId,
    detached: AtomicBool,
}

/// Idempotent "unsubscribe" for one subscription. Cloneable so it can be
/// handed to a disposer while the subscription itself is being polled.
#[derive(Clone)]
pub struct DetachHandle {
    inner: Arc<DetachInner>,
}

impl DetachHandle {
    fn new(broker: Weak<Inner>, job_id: JobId, subscriber: SubscriberId) -> Self {
        Self {
            inner: Arc::new(DetachInner {
                broker,
                job_id,
                subscriber,
                detached: AtomicBool::new(false),
            }),
        }
    }

    fn detached(job_id: JobId) -> Self {
        let handle = Self::new(Weak::new(), job_id, 0);
        handle.inner.detached.store(true, Ordering::SeqCst);
        handle
    }

    /// Release the subscription. Further calls are no-ops.
    pub fn detach(&self) {
        if self.inner.detached.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(broker) = self.inner.broker.upgrade() {
            broker.detach(self.inner.job_id, self.inner.subscriber);
        }
    }

    pub fn is_detached(&self) -> bool {
        self.inner.detached.load(Ordering::SeqCst)
    }
}

/// One local subscriber's view of a job. Dropping it detaches.
pub struct JobSubscription {
    job_id: JobId,
    events: mpsc::UnboundedReceiver<BrokerEvent>,
    detach: DetachHandle,
}

impl JobSubscription {
    fn new(job_id: JobId, events: mpsc::UnboundedReceiver<BrokerEvent>, detach: DetachHandle) -> Self {
        Self {
            job_id,
            events,
            detach,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Next event; `None` once the subscription has ended.
    pub async fn recv(&mut self) -> Option<BrokerEvent> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Option<BrokerEvent> {
        self.events.try_recv().ok()
    }

    pub fn detach_handle(&self) -> DetachHandle {
        self.detach.clone()
    }

    pub fn detach(&self) {
        self.detach.detach();
    }
}

impl Stream for JobSubscription {
    type Item = BrokerEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<BrokerEvent>> {
        self.events.poll_recv(cx)
    }
}

impl Drop for JobSubscription {
    fn drop(&mut self) {
        self.detach.detach();
    }
}
