// crates/core/src/panel.rs
//! Jobs panel: the registry fed by broker subscriptions, plus the actions a
//! panel host can take.
//!
//! The panel holds one broker subscription per job it watches. Detail views
//! opened for the same job attach to the same broker entry, so the backend
//! still sees a single upstream.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::abort::{AbortCoordinator, AbortDecision};
use crate::broker::{BrokerEvent, DetachHandle, JobBroker};
use crate::error::{AbortError, TransportError};
use crate::model::{Job, JobId};
use crate::registry::JobRegistry;
use crate::transport::JobTransport;

struct PanelWatch {
    /// Distinguishes a re-watch of the same id from the watch it replaced.
    generation: u64,
    detach: DetachHandle,
    task: JoinHandle<()>,
}

impl PanelWatch {
    fn stop(self) {
        self.detach.detach();
        self.task.abort();
    }
}

struct PanelInner {
    broker: JobBroker,
    transport: Arc<dyn JobTransport>,
    abort: AbortCoordinator,
    registry: RwLock<JobRegistry>,
    watchers: Mutex<HashMap<JobId, PanelWatch>>,
    next_generation: AtomicU64,
}

impl PanelInner {
    fn write<R>(&self, f: impl FnOnce(&mut JobRegistry) -> R) -> R {
        match self.registry.write() {
            Ok(mut registry) => f(&mut registry),
            Err(e) => {
                tracing::error!("RwLock poisoned writing job registry: {e}");
                f(&mut e.into_inner())
            }
        }
    }

    fn read<R>(&self, f: impl FnOnce(&JobRegistry) -> R) -> R {
        match self.registry.read() {
            Ok(registry) => f(&registry),
            Err(e) => {
                tracing::error!("RwLock poisoned reading job registry: {e}");
                f(&e.into_inner())
            }
        }
    }

    fn watchers(&self) -> MutexGuard<'_, HashMap<JobId, PanelWatch>> {
        self.watchers.lock().unwrap_or_else(|e| {
            tracing::error!("Mutex poisoned on panel watchers: {e}");
            e.into_inner()
        })
    }

    /// Drop the watcher entry for `job_id` if it is still the one started as
    /// `generation`.
    fn finish_watch(&self, job_id: JobId, generation: u64) -> bool {
        let mut watchers = self.watchers();
        match watchers.get(&job_id) {
            Some(watch) if watch.generation == generation => {
                watchers.remove(&job_id);
                true
            }
            _ => false,
        }
    }
}

/// Cloneable handle to the panel state.
#[derive(Clone)]
pub struct JobPanel {
    inner: Arc<PanelInner>,
}

impl JobPanel {
    pub fn new(broker: JobBroker, transport: Arc<dyn JobTransport>, abort: AbortCoordinator) -> Self {
        Self {
            inner: Arc::new(PanelInner {
                broker,
                transport,
                abort,
                registry: RwLock::new(JobRegistry::new()),
                watchers: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
            }),
        }
    }

    /// Fetch every known job, then watch the ones still in flight.
    ///
    /// A listed snapshot never replaces a terminal one already in the
    /// registry, nor one fed by a live watch: the list reply may be older.
    pub async fn load(&self) -> Result<usize, TransportError> {
        self.inner.write(|r| r.set_loading(true));
        let result = self.inner.transport.list_jobs().await;

        match result {
            Ok(jobs) => {
                let count = jobs.len();
                let watched: HashSet<JobId> = self.inner.watchers().keys().copied().collect();
                let pending = self.inner.write(|r| {
                    let mut pending = Vec::new();
                    for job in jobs {
                        let known = r.job_by_id(job.id);
                        let stale = known.is_some_and(|k| k.is_terminal() || watched.contains(&k.id));
                        if stale {
                            continue;
                        }
                        if !job.is_terminal() {
                            pending.push(job.id);
                        }
                        r.upsert(job);
                    }
                    r.clear_error();
                    r.set_loading(false);
                    pending
                });
                for job_id in &pending {
                    self.watch(*job_id);
                }
                info!(jobs = count, watching = pending.len(), "job panel loaded");
                Ok(count)
            }
            Err(e) => {
                warn!(error = %e, "failed to load jobs");
                self.inner.write(|r| {
                    r.record_error(e.clone());
                    r.set_loading(false);
                });
                Err(e)
            }
        }
    }

    /// Keep the registry entry for `job_id` current until the job finishes.
    /// Returns false if the panel already watches it.
    pub fn watch(&self, job_id: JobId) -> bool {
        let mut watchers = self.inner.watchers();
        if watchers.contains_key(&job_id) {
            return false;
        }

        let mut subscription = self.inner.broker.subscribe(job_id);
        let detach = subscription.detach_handle();
        let weak: Weak<PanelInner> = Arc::downgrade(&self.inner);
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);

        let task = tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                match event {
                    BrokerEvent::Snapshot(job) => {
                        let terminal = job.is_terminal();
                        inner.write(|r| r.upsert(job));
                        if terminal {
                            break;
                        }
                    }
                    BrokerEvent::TransportFailed(e) => {
                        inner.write(|r| r.record_error(e));
                        break;
                    }
                }
            }
            drop(subscription);
            if let Some(inner) = weak.upgrade() {
                if inner.finish_watch(job_id, generation) {
                    debug!(job_id, "panel stopped watching job");
                }
            }
        });

        watchers.insert(
            job_id,
            PanelWatch {
                generation,
                detach,
                task,
            },
        );
        true
    }

    /// Ask for confirmation and abort. Once the backend accepts the request
    /// the job is flagged as aborting until it leaves the panel. Failures are
    /// returned to the host and leave the flag untouched.
    pub async fn abort_requested(&self, job: &Job) -> Result<AbortDecision, AbortError> {
        let decision = self.inner.abort.request_abort(job).await?;
        if decision == AbortDecision::Requested {
            self.inner.write(|r| r.mark_aborting(job.id));
        }
        Ok(decision)
    }

    /// Whether an abort was requested for `job_id` from this panel.
    pub fn is_aborting(&self, job_id: JobId) -> bool {
        self.inner.read(|r| r.is_aborting(job_id))
    }

    /// Dismiss a job from the panel. Other observers of the job are not
    /// affected.
    pub fn acknowledge(&self, job_id: JobId) -> Option<Job> {
        if let Some(watch) = self.inner.watchers().remove(&job_id) {
            watch.stop();
        }
        self.inner.write(|r| r.remove(job_id))
    }

    /// Stop every panel subscription and drop finished jobs. Returns how many
    /// jobs were pruned.
    pub fn panel_closed(&self) -> usize {
        let watches: Vec<PanelWatch> = self.inner.watchers().drain().map(|(_, w)| w).collect();
        let stopped = watches.len();
        for watch in watches {
            watch.stop();
        }
        let pruned = self.inner.write(|r| r.prune_terminal());
        debug!(stopped, pruned, "job panel closed");
        pruned
    }

    pub fn running_count(&self) -> usize {
        self.inner.read(|r| r.running_count())
    }

    pub fn waiting_count(&self) -> usize {
        self.inner.read(|r| r.waiting_count())
    }

    pub fn failed_count(&self) -> usize {
        self.inner.read(|r| r.failed_count())
    }

    pub fn job_by_id(&self, job_id: JobId) -> Option<Job> {
        self.inner.read(|r| r.job_by_id(job_id).cloned())
    }

    pub fn jobs(&self) -> Vec<Job> {
        self.inner.read(|r| r.jobs())
    }

    pub fn is_loading(&self) -> bool {
        self.inner.read(|r| r.is_loading())
    }

    pub fn last_error(&self) -> Option<TransportError> {
        self.inner.read(|r| r.last_error().cloned())
    }

    pub fn watching_count(&self) -> usize {
        self.inner.watchers().len()
    }
}
