// crates/core/src/progress.rs
//! Per-observer progress view.
//!
//! [`ProgressModel`] is the pure state machine: it turns snapshots into view
//! state and events, and tells the caller when to start the log tail.
//! [`ProgressController`] drives it from a broker subscription, a log tail
//! and host commands, and owns their teardown.
//!
//! Phases: `Idle -> Attached -> Running { logs } -> Terminal`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::abort::{AbortCoordinator, AbortDecision};
use crate::broker::{BrokerEvent, JobBroker, JobSubscription};
use crate::config::LogsConfig;
use crate::error::{AbortError, TransportError};
use crate::model::{Job, JobId, JobStatus};
use crate::operator::{DownloadOptions, DownloadRequest};
use crate::tail::{LogBuffer, LogTail, DEFAULT_CHANNEL_NAMESPACE};
use crate::transport::JobTransport;

// =============================================================================
// Configuration and view state
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressConfig {
    /// Overrides the title derived from the job method.
    pub title: Option<String>,
    /// Overrides the description derived from the job.
    pub description: Option<String>,
    /// Tail the job log instead of showing progress percentages.
    pub show_logs: bool,
    pub log_namespace: String,
    /// 0 keeps the whole log.
    pub max_log_bytes: usize,
    /// Turn a successful result into a download request.
    pub download: Option<DownloadOptions>,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self::from_logs(&LogsConfig::default())
    }
}

impl ProgressConfig {
    pub fn from_logs(logs: &LogsConfig) -> Self {
        Self {
            title: None,
            description: None,
            show_logs: false,
            log_namespace: if logs.channel_namespace.is_empty() {
                DEFAULT_CHANNEL_NAMESPACE.to_owned()
            } else {
                logs.channel_namespace.clone()
            },
            max_log_bytes: logs.max_log_bytes,
            download: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_logs(mut self, show_logs: bool) -> Self {
        self.show_logs = show_logs;
        self
    }

    pub fn with_download(mut self, download: DownloadOptions) -> Self {
        self.download = Some(download);
        self
    }
}

/// Everything a host needs to render one progress view. Owned by exactly
/// one controller.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressViewState {
    pub title: String,
    pub description: Option<String>,
    /// `None` means indeterminate.
    pub percent_complete: Option<f64>,
    pub log_buffer: LogBuffer,
    /// Set once an abort was accepted by the backend; never cleared.
    pub is_aborting: bool,
    /// Guards the one-time log tail activation.
    pub is_logs_subscribed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerPhase {
    Idle,
    Attached,
    Running { logs: bool },
    Terminal,
}

/// Display fields after a change.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub job_id: JobId,
    pub title: String,
    pub description: Option<String>,
    pub percent_complete: Option<f64>,
    pub is_aborting: bool,
    pub timestamp: DateTime<Utc>,
}

/// Typed outcomes delivered to the host.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    Progress(ProgressUpdate),
    /// A chunk appended to the log buffer.
    Log(String),
    Success(Job),
    /// Emitted right after `Success` when a download was configured.
    DownloadRequested(DownloadRequest),
    /// `Failed` or `Error`; the job carries the details for an error report.
    Failure(Job),
    Aborted(Job),
    /// The snapshot stream or log tail broke.
    TransportFailure(TransportError),
    /// The abort call failed. The view stays open.
    AbortFailed(AbortError),
}

impl ProgressEvent {
    /// Whether this event ends the view.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProgressEvent::Success(_)
                | ProgressEvent::Failure(_)
                | ProgressEvent::Aborted(_)
                | ProgressEvent::TransportFailure(_)
        )
    }
}

// =============================================================================
// Pure state machine
// =============================================================================

/// What the driver has to do after feeding the model.
#[derive(Debug, Default, PartialEq)]
pub struct Reaction {
    pub events: Vec<ProgressEvent>,
    /// Log path to start tailing. Set at most once per model.
    pub start_tail: Option<String>,
    pub terminal: bool,
}

#[derive(Debug, Clone)]
pub struct ProgressModel {
    job_id: JobId,
    config: ProgressConfig,
    view: ProgressViewState,
    phase: ControllerPhase,
    last_job: Option<Job>,
}

impl ProgressModel {
    pub fn new(job_id: JobId, config: ProgressConfig) -> Self {
        let view = ProgressViewState {
            title: config.title.clone().unwrap_or_default(),
            description: config.description.clone(),
            log_buffer: LogBuffer::with_limit(config.max_log_bytes),
            ..ProgressViewState::default()
        };
        Self {
            job_id,
            config,
            view,
            phase: ControllerPhase::Idle,
            last_job: None,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn phase(&self) -> ControllerPhase {
        self.phase
    }

    pub fn view(&self) -> &ProgressViewState {
        &self.view
    }

    pub fn into_view(self) -> ProgressViewState {
        self.view
    }

    pub fn last_job(&self) -> Option<&Job> {
        self.last_job.as_ref()
    }

    pub fn is_terminal(&self) -> bool {
        self.phase == ControllerPhase::Terminal
    }

    fn update(&self) -> ProgressUpdate {
        ProgressUpdate {
            job_id: self.job_id,
            title: self.view.title.clone(),
            description: self.view.description.clone(),
            percent_complete: self.view.percent_complete,
            is_aborting: self.view.is_aborting,
            timestamp: Utc::now(),
        }
    }

    pub fn apply_snapshot(&mut self, job: Job) -> Reaction {
        let mut reaction = Reaction::default();
        if self.is_terminal() {
            return reaction;
        }

        let mut changed = false;
        if self.phase == ControllerPhase::Idle {
            if self.config.title.is_none() {
                self.view.title = job.method.clone();
            }
            if self.config.description.is_none() {
                self.view.description = job.description.clone();
            }
            self.phase = ControllerPhase::Attached;
            changed = true;
        }
        self.last_job = Some(job.clone());

        match &job.status {
            JobStatus::Waiting | JobStatus::Running { .. } => {
                if matches!(job.status, JobStatus::Running { .. }) {
                    self.phase = ControllerPhase::Running {
                        logs: self.config.show_logs,
                    };
                }
                if self.config.show_logs {
                    if !self.view.is_logs_subscribed {
                        if let Some(path) = job.tail_path() {
                            self.view.is_logs_subscribed = true;
                            reaction.start_tail = Some(path.to_owned());
                        }
                    }
                } else if let Some(progress) = job.progress() {
                    if self.view.percent_complete != progress.percent {
                        self.view.percent_complete = progress.percent;
                        changed = true;
                    }
                    if let Some(description) = progress.description.as_deref().filter(|d| !d.is_empty()) {
                        if self.view.description.as_deref() != Some(description) {
                            self.view.description = Some(description.to_owned());
                            changed = true;
                        }
                    }
                }
                if changed {
                    reaction.events.push(ProgressEvent::Progress(self.update()));
                }
            }
            JobStatus::Success { .. } => {
                if changed {
                    reaction.events.push(ProgressEvent::Progress(self.update()));
                }
                let download = self.config.download.as_ref().map(|d| d.request_for(&job));
                reaction.events.push(ProgressEvent::Success(job));
                if let Some(request) = download {
                    reaction.events.push(ProgressEvent::DownloadRequested(request));
                }
                self.finish(&mut reaction);
            }
            JobStatus::Failed { .. } | JobStatus::Error { .. } => {
                if changed {
                    reaction.events.push(ProgressEvent::Progress(self.update()));
                }
                reaction.events.push(ProgressEvent::Failure(job));
                self.finish(&mut reaction);
            }
            JobStatus::Aborted => {
                if changed {
                    reaction.events.push(ProgressEvent::Progress(self.update()));
                }
                reaction.events.push(ProgressEvent::Aborted(job));
                self.finish(&mut reaction);
            }
        }
        reaction
    }

    /// Works whether or not a snapshot was ever seen.
    pub fn apply_transport_failure(&mut self, error: TransportError) -> Reaction {
        let mut reaction = Reaction::default();
        if self.is_terminal() {
            return reaction;
        }
        reaction.events.push(ProgressEvent::TransportFailure(error));
        self.finish(&mut reaction);
        reaction
    }

    fn finish(&mut self, reaction: &mut Reaction) {
        self.phase = ControllerPhase::Terminal;
        reaction.terminal = true;
    }

    /// Append a tailed chunk. Ignored once terminal or when empty.
    pub fn append_log(&mut self, chunk: &str) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.view.log_buffer.append(chunk)
    }

    /// Set the optimistic aborting flag. Returns the update to emit, or
    /// `None` if it was already set.
    pub fn mark_aborting(&mut self) -> Option<ProgressUpdate> {
        if self.view.is_aborting || self.is_terminal() {
            return None;
        }
        self.view.is_aborting = true;
        Some(self.update())
    }
}

// =============================================================================
// Teardown
// =============================================================================

/// Ordered list of release actions that run at most once.
#[derive(Default)]
pub struct Disposer {
    actions: Vec<Box<dyn FnOnce() + Send>>,
    disposed: bool,
}

impl Disposer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a release action. If already disposed it runs immediately.
    pub fn push(&mut self, action: impl FnOnce() + Send + 'static) {
        if self.disposed {
            action();
        } else {
            self.actions.push(Box::new(action));
        }
    }

    /// Run every action. Returns false if this already happened.
    pub fn dispose(&mut self) -> bool {
        if self.disposed {
            return false;
        }
        self.disposed = true;
        for action in self.actions.drain(..) {
            action();
        }
        true
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }
}

impl Drop for Disposer {
    fn drop(&mut self) {
        self.dispose();
    }
}

// =============================================================================
// Async driver
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressCommand {
    Close,
    Abort,
}

/// Host side of a running controller.
#[derive(Debug, Clone)]
pub struct ProgressHandle {
    commands: mpsc::UnboundedSender<ProgressCommand>,
}

impl ProgressHandle {
    /// Close the view. Returns false if the controller is already gone.
    pub fn close(&self) -> bool {
        self.commands.send(ProgressCommand::Close).is_ok()
    }

    /// Ask for confirmation and abort the job.
    pub fn request_abort(&self) -> bool {
        self.commands.send(ProgressCommand::Abort).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}

type PendingAbort = BoxFuture<'static, Result<AbortDecision, AbortError>>;

pub struct ProgressController {
    model: ProgressModel,
    transport: Arc<dyn JobTransport>,
    abort: AbortCoordinator,
    subscription: Option<JobSubscription>,
    tail: Option<LogTail>,
    /// Confirmation and abort call in flight; polled alongside everything else.
    pending_abort: Option<PendingAbort>,
    commands: mpsc::UnboundedReceiver<ProgressCommand>,
    commands_open: bool,
    events: mpsc::UnboundedSender<ProgressEvent>,
    disposer: Disposer,
}

impl ProgressController {
    /// Attach a new view to `job_id`. The subscription is taken immediately;
    /// nothing is processed until [`run`](Self::run) is polled.
    pub fn open(
        broker: &JobBroker,
        transport: Arc<dyn JobTransport>,
        abort: AbortCoordinator,
        job_id: JobId,
        config: ProgressConfig,
    ) -> (Self, ProgressHandle, mpsc::UnboundedReceiver<ProgressEvent>) {
        let subscription = broker.subscribe(job_id);
        let mut disposer = Disposer::new();
        let detach = subscription.detach_handle();
        disposer.push(move || detach.detach());

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        debug!(job_id, show_logs = config.show_logs, "progress view opened");

        let controller = Self {
            model: ProgressModel::new(job_id, config),
            transport,
            abort,
            subscription: Some(subscription),
            tail: None,
            pending_abort: None,
            commands: command_rx,
            commands_open: true,
            events: event_tx,
            disposer,
        };
        (
            controller,
            ProgressHandle {
                commands: command_tx,
            },
            event_rx,
        )
    }

    pub fn view(&self) -> &ProgressViewState {
        self.model.view()
    }

    pub fn phase(&self) -> ControllerPhase {
        self.model.phase()
    }

    /// Release the broker subscription and the log tail. Safe to call any
    /// number of times; only the first call does anything.
    pub fn dispose(&mut self) -> bool {
        self.pending_abort = None;
        self.tail = None;
        self.subscription = None;
        let first = self.disposer.dispose();
        if first {
            debug!(job_id = self.model.job_id(), "progress view disposed");
        }
        first
    }

    /// Drive the view until a terminal outcome or a close command, then tear
    /// down. Returns the final view state.
    pub async fn run(mut self) -> ProgressViewState {
        loop {
            if self.model.is_terminal() {
                break;
            }
            let Some(subscription) = self.subscription.as_mut() else {
                break;
            };

            tokio::select! {
                event = subscription.recv() => match event {
                    Some(BrokerEvent::Snapshot(job)) => self.on_snapshot(job).await,
                    Some(BrokerEvent::TransportFailed(error)) => {
                        let reaction = self.model.apply_transport_failure(error);
                        self.emit(reaction.events);
                    }
                    None => {
                        let reaction = self.model.apply_transport_failure(TransportError::Closed);
                        self.emit(reaction.events);
                    }
                },
                chunk = next_chunk(&mut self.tail) => match chunk {
                    Some(Ok(text)) => {
                        if self.model.append_log(&text) {
                            self.emit(vec![ProgressEvent::Log(text)]);
                        }
                    }
                    Some(Err(error)) => {
                        let reaction = self.model.apply_transport_failure(error);
                        self.emit(reaction.events);
                    }
                    None => {
                        debug!(job_id = self.model.job_id(), "log tail ended");
                        self.tail = None;
                    }
                },
                decision = next_abort(&mut self.pending_abort) => {
                    self.pending_abort = None;
                    self.on_abort_decided(decision);
                }
                command = self.commands.recv(), if self.commands_open => match command {
                    Some(ProgressCommand::Close) => {
                        debug!(job_id = self.model.job_id(), "progress view closed by host");
                        break;
                    }
                    Some(ProgressCommand::Abort) => self.on_abort(),
                    None => self.commands_open = false,
                },
            }
        }

        self.dispose();
        self.model.view().clone()
    }

    async fn on_snapshot(&mut self, job: Job) {
        let reaction = self.model.apply_snapshot(job);
        self.emit(reaction.events);
        if reaction.terminal {
            return;
        }
        let Some(path) = reaction.start_tail else {
            return;
        };

        let job_id = self.model.job_id();
        let namespace = self.model.config.log_namespace.clone();
        match LogTail::start(self.transport.as_ref(), &namespace, &path).await {
            Ok(tail) => {
                info!(job_id, channel = tail.channel(), "tailing job log");
                self.tail = Some(tail);
            }
            Err(error) => {
                warn!(job_id, error = %error, "failed to start log tail");
                let reaction = self.model.apply_transport_failure(error);
                self.emit(reaction.events);
            }
        }
    }

    fn on_abort(&mut self) {
        let job_id = self.model.job_id();
        if self.pending_abort.is_some() {
            debug!(job_id, "abort already in progress; ignoring");
            return;
        }
        let Some(job) = self.model.last_job().cloned() else {
            debug!(job_id, "abort requested before first snapshot; ignoring");
            return;
        };
        let abort = self.abort.clone();
        self.pending_abort = Some(Box::pin(async move { abort.request_abort(&job).await }));
    }

    fn on_abort_decided(&mut self, decision: Result<AbortDecision, AbortError>) {
        match decision {
            Ok(AbortDecision::Requested) => {
                if let Some(update) = self.model.mark_aborting() {
                    self.emit(vec![ProgressEvent::Progress(update)]);
                }
            }
            Ok(decision) => debug!(job_id = self.model.job_id(), ?decision, "abort not sent"),
            Err(error) => self.emit(vec![ProgressEvent::AbortFailed(error)]),
        }
    }

    fn emit(&self, events: Vec<ProgressEvent>) {
        for event in events {
            // The host may have stopped listening; the view still runs to
            // completion so teardown happens.
            let _ = self.events.send(event);
        }
    }
}

impl Drop for ProgressController {
    fn drop(&mut self) {
        self.dispose();
    }
}

async fn next_abort(pending: &mut Option<PendingAbort>) -> Result<AbortDecision, AbortError> {
    match pending {
        Some(pending) => pending.await,
        None => std::future::pending().await,
    }
}

async fn next_chunk(tail: &mut Option<LogTail>) -> Option<Result<String, TransportError>> {
    match tail {
        Some(tail) => tail.next_chunk().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerConfig;
    use crate::mock::{eventually, MockTransport, StaticConfirm};
    use crate::model::JobFailure;
    use crate::transport::ChannelMessage;
    use pretty_assertions::assert_eq;

    fn running(id: JobId, percent: Option<f64>) -> Job {
        Job::new(id, "pool.scrub")
            .with_description("Scrub tank")
            .with_logs_path(format!("/var/log/jobs/{id}.log"))
            .with_abortable(true)
            .with_status(JobStatus::running(percent, None))
    }

    // ---- model ----

    #[test]
    fn test_first_snapshot_derives_title() {
        let mut model = ProgressModel::new(1, ProgressConfig::default());
        assert_eq!(model.phase(), ControllerPhase::Idle);

        let reaction = model.apply_snapshot(Job::new(1, "pool.scrub").with_description("Scrub tank"));
        assert_eq!(model.phase(), ControllerPhase::Attached);
        assert_eq!(model.view().title, "pool.scrub");
        assert_eq!(model.view().description.as_deref(), Some("Scrub tank"));
        assert_eq!(reaction.events.len(), 1);
    }

    #[test]
    fn test_configured_title_wins() {
        let config = ProgressConfig::default().with_title("Scrubbing pool");
        let mut model = ProgressModel::new(1, config);
        model.apply_snapshot(running(1, Some(5.0)));
        assert_eq!(model.view().title, "Scrubbing pool");
    }

    #[test]
    fn test_progress_updates_percent_and_description() {
        let mut model = ProgressModel::new(1, ProgressConfig::default());
        model.apply_snapshot(running(1, Some(10.0)));
        model.apply_snapshot(
            Job::new(1, "pool.scrub").with_status(JobStatus::running(Some(55.0), Some("Pass 2"))),
        );
        assert_eq!(model.view().percent_complete, Some(55.0));
        assert_eq!(model.view().description.as_deref(), Some("Pass 2"));
        assert_eq!(model.phase(), ControllerPhase::Running { logs: false });
    }

    #[test]
    fn test_null_percent_is_indeterminate() {
        let mut model = ProgressModel::new(1, ProgressConfig::default());
        model.apply_snapshot(running(1, Some(30.0)));
        model.apply_snapshot(running(1, None));
        assert_eq!(model.view().percent_complete, None);
    }

    #[test]
    fn test_logs_suppress_progress() {
        let mut model = ProgressModel::new(1, ProgressConfig::default().with_logs(true));
        model.apply_snapshot(running(1, Some(42.0)));
        assert_eq!(model.view().percent_complete, None);
        assert_eq!(model.phase(), ControllerPhase::Running { logs: true });
    }

    #[test]
    fn test_tail_requested_once() {
        let mut model = ProgressModel::new(1, ProgressConfig::default().with_logs(true));
        let first = model.apply_snapshot(running(1, Some(1.0)));
        let second = model.apply_snapshot(running(1, Some(2.0)));
        assert_eq!(first.start_tail.as_deref(), Some("/var/log/jobs/1.log"));
        assert_eq!(second.start_tail, None);
        assert!(model.view().is_logs_subscribed);
    }

    #[test]
    fn test_no_tail_without_logs_path() {
        let mut model = ProgressModel::new(1, ProgressConfig::default().with_logs(true));
        let reaction = model.apply_snapshot(Job::new(1, "x").with_status(JobStatus::running(None, None)));
        assert_eq!(reaction.start_tail, None);
        assert!(!model.view().is_logs_subscribed);
    }

    #[test]
    fn test_failure_does_not_start_tail() {
        let mut model = ProgressModel::new(1, ProgressConfig::default().with_logs(true));
        let reaction = model.apply_snapshot(
            running(1, None).with_status(JobStatus::Failed {
                error: JobFailure::new("boom"),
            }),
        );
        assert!(reaction.terminal);
        assert_eq!(reaction.start_tail, None);
        assert!(matches!(reaction.events.last(), Some(ProgressEvent::Failure(_))));
    }

    #[test]
    fn test_error_state_is_reported_as_failure() {
        let mut model = ProgressModel::new(1, ProgressConfig::default());
        let reaction = model.apply_snapshot(Job::new(1, "x").with_status(JobStatus::Error {
            error: JobFailure::new("EIO"),
        }));
        assert!(matches!(reaction.events.last(), Some(ProgressEvent::Failure(_))));
    }

    #[test]
    fn test_snapshots_after_terminal_are_ignored() {
        let mut model = ProgressModel::new(1, ProgressConfig::default().with_logs(true));
        model.apply_snapshot(Job::new(1, "x").with_status(JobStatus::Aborted));
        let late = model.apply_snapshot(running(1, Some(99.0)));
        assert_eq!(late, Reaction::default());
        assert!(!model.append_log("late"));
    }

    #[test]
    fn test_transport_failure_without_snapshot() {
        let mut model = ProgressModel::new(1, ProgressConfig::default());
        let reaction = model.apply_transport_failure(TransportError::Disconnected);
        assert!(reaction.terminal);
        assert_eq!(
            reaction.events,
            vec![ProgressEvent::TransportFailure(TransportError::Disconnected)]
        );
        assert!(model.last_job().is_none());
    }

    #[test]
    fn test_mark_aborting_once() {
        let mut model = ProgressModel::new(1, ProgressConfig::default());
        model.apply_snapshot(running(1, Some(3.0)));
        assert!(model.mark_aborting().unwrap().is_aborting);
        assert!(model.mark_aborting().is_none());
        // Still running: the flag is advisory only.
        model.apply_snapshot(running(1, Some(4.0)));
        assert!(model.view().is_aborting);
    }

    #[test]
    fn test_default_config_keeps_whole_log() {
        let mut model = ProgressModel::new(1, ProgressConfig::default().with_logs(true));
        model.apply_snapshot(running(1, None));
        assert!(model.append_log("FIRST LINE\n"));
        assert!(model.append_log(&"x".repeat(1024 * 1024)));
        assert!(model.view().log_buffer.as_str().starts_with("FIRST LINE\n"));
        assert_eq!(model.view().log_buffer.dropped_bytes(), 0);
    }

    #[test]
    fn test_disposer_runs_once() {
        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let mut disposer = Disposer::new();
        let c = count.clone();
        disposer.push(move || {
            c.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });
        assert!(disposer.dispose());
        assert!(!disposer.dispose());
        drop(disposer);
        assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    // ---- controller ----

    struct Fixture {
        mock: Arc<MockTransport>,
        broker: JobBroker,
        abort: AbortCoordinator,
    }

    fn fixture(confirm: bool) -> Fixture {
        let mock = MockTransport::new();
        let broker = JobBroker::new(mock.clone(), BrokerConfig::default());
        let abort = AbortCoordinator::new(mock.clone(), StaticConfirm::new(confirm));
        Fixture { mock, broker, abort }
    }

    impl Fixture {
        fn open(
            &self,
            job_id: JobId,
            config: ProgressConfig,
        ) -> (ProgressController, ProgressHandle, mpsc::UnboundedReceiver<ProgressEvent>) {
            ProgressController::open(&self.broker, self.mock.clone(), self.abort.clone(), job_id, config)
        }
    }

    #[tokio::test]
    async fn test_dispose_twice_releases_upstream_once() {
        let fx = fixture(true);
        let (mut controller, _handle, _events) = fx.open(1, ProgressConfig::default());
        assert!(eventually(|| fx.mock.opens(1) == 1).await);

        assert!(controller.dispose());
        assert!(!controller.dispose());
        drop(controller);

        assert!(eventually(|| fx.mock.releases(1) == 1).await);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(fx.mock.releases(1), 1);
    }

    #[tokio::test]
    async fn test_logs_are_tailed_and_released_on_success() {
        let fx = fixture(true);
        let (controller, _handle, mut events) = fx.open(1, ProgressConfig::default().with_logs(true));
        let task = tokio::spawn(controller.run());
        assert!(eventually(|| fx.mock.opens(1) == 1).await);

        let channel = "filesystem.file_tail_follow:/var/log/jobs/1.log";
        fx.mock.push(running(1, Some(10.0)));
        assert!(eventually(|| fx.mock.channel_opens(channel) == 1).await);
        fx.mock.push(running(1, Some(20.0)));

        fx.mock.push_chunk(channel, ChannelMessage::text("scrub started\n"));
        fx.mock.push_chunk(channel, ChannelMessage::text("scanned 1T\n"));
        assert!(eventually(|| {
            while let Ok(event) = events.try_recv() {
                if event == ProgressEvent::Log("scanned 1T\n".into()) {
                    return true;
                }
            }
            false
        })
        .await);

        fx.mock.push(running(1, None).with_status(JobStatus::Success {
            result: serde_json::Value::Null,
        }));
        let view = task.await.unwrap();

        assert_eq!(view.log_buffer.as_str(), "scrub started\nscanned 1T\n");
        assert_eq!(view.percent_complete, None);
        assert_eq!(fx.mock.channel_opens(channel), 1);
        assert_eq!(fx.mock.channel_releases(channel), 1);
        assert!(eventually(|| fx.mock.releases(1) == 1).await);
    }

    #[tokio::test]
    async fn test_close_releases_everything() {
        let fx = fixture(true);
        let (controller, handle, _events) = fx.open(1, ProgressConfig::default().with_logs(true));
        let task = tokio::spawn(controller.run());
        assert!(eventually(|| fx.mock.opens(1) == 1).await);

        fx.mock.push(running(1, Some(10.0)));
        let channel = "filesystem.file_tail_follow:/var/log/jobs/1.log";
        assert!(eventually(|| fx.mock.channel_opens(channel) == 1).await);

        assert!(handle.close());
        task.await.unwrap();
        assert_eq!(fx.mock.channel_releases(channel), 1);
        assert!(eventually(|| fx.mock.releases(1) == 1).await);
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn test_transport_failure_reaches_host() {
        let fx = fixture(true);
        let (controller, _handle, mut events) = fx.open(1, ProgressConfig::default());
        let task = tokio::spawn(controller.run());
        assert!(eventually(|| fx.mock.opens(1) == 1).await);

        fx.mock.fail(1, TransportError::Disconnected);
        task.await.unwrap();
        assert_eq!(
            events.recv().await,
            Some(ProgressEvent::TransportFailure(TransportError::Disconnected))
        );
    }

    #[tokio::test]
    async fn test_abort_sets_flag_and_keeps_running() {
        let fx = fixture(true);
        let (controller, handle, mut events) = fx.open(1, ProgressConfig::default());
        let task = tokio::spawn(controller.run());
        assert!(eventually(|| fx.mock.opens(1) == 1).await);

        fx.mock.push(running(1, Some(10.0)));
        assert!(matches!(events.recv().await, Some(ProgressEvent::Progress(_))));

        handle.request_abort();
        match events.recv().await {
            Some(ProgressEvent::Progress(update)) => assert!(update.is_aborting),
            other => panic!("expected aborting update, got {other:?}"),
        }
        assert_eq!(fx.mock.calls_to("core.job_abort").len(), 1);

        fx.mock.push(running(1, None).with_status(JobStatus::Aborted));
        let view = task.await.unwrap();
        assert!(view.is_aborting);
        assert!(matches!(events.recv().await, Some(ProgressEvent::Aborted(_))));
    }

    #[tokio::test]
    async fn test_tail_error_ends_view_and_releases_both() {
        let fx = fixture(true);
        let (controller, _handle, mut events) = fx.open(1, ProgressConfig::default().with_logs(true));
        let task = tokio::spawn(controller.run());
        assert!(eventually(|| fx.mock.opens(1) == 1).await);

        let channel = "filesystem.file_tail_follow:/var/log/jobs/1.log";
        fx.mock.push(running(1, Some(10.0)));
        assert!(eventually(|| fx.mock.channel_opens(channel) == 1).await);

        assert!(fx.mock.fail_channel(channel, TransportError::Disconnected));
        task.await.unwrap();

        let mut last = None;
        while let Ok(event) = events.try_recv() {
            last = Some(event);
        }
        assert_eq!(last, Some(ProgressEvent::TransportFailure(TransportError::Disconnected)));
        assert_eq!(fx.mock.channel_releases(channel), 1);
        assert!(eventually(|| fx.mock.releases(1) == 1).await);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(fx.mock.releases(1), 1);
    }

    #[tokio::test]
    async fn test_tail_open_failure_ends_view() {
        let fx = fixture(true);
        let channel = "filesystem.file_tail_follow:/var/log/jobs/1.log";
        fx.mock.reject_channel(
            channel,
            TransportError::Rpc {
                code: -32001,
                message: "[ENOENT] no such log".into(),
            },
        );
        let (controller, _handle, mut events) = fx.open(1, ProgressConfig::default().with_logs(true));
        let task = tokio::spawn(controller.run());
        assert!(eventually(|| fx.mock.opens(1) == 1).await);

        fx.mock.push(running(1, Some(10.0)));
        task.await.unwrap();

        let mut last = None;
        while let Ok(event) = events.try_recv() {
            last = Some(event);
        }
        assert!(matches!(
            last,
            Some(ProgressEvent::TransportFailure(TransportError::Rpc { code: -32001, .. }))
        ));
        assert_eq!(fx.mock.channel_opens(channel), 1);
        assert_eq!(fx.mock.channel_releases(channel), 0);
        assert!(eventually(|| fx.mock.releases(1) == 1).await);
    }

    /// Answers only once released, like a user sitting on a prompt.
    #[derive(Default)]
    struct HeldConfirm {
        release: tokio::sync::Notify,
    }

    #[async_trait::async_trait]
    impl crate::abort::Confirm for HeldConfirm {
        async fn confirm(&self, _job: &Job) -> bool {
            self.release.notified().await;
            true
        }
    }

    fn held_fixture() -> (Fixture, Arc<HeldConfirm>) {
        let mock = MockTransport::new();
        let broker = JobBroker::new(mock.clone(), BrokerConfig::default());
        let confirm = Arc::new(HeldConfirm::default());
        let abort = AbortCoordinator::new(mock.clone(), confirm.clone());
        (Fixture { mock, broker, abort }, confirm)
    }

    #[tokio::test]
    async fn test_open_prompt_does_not_stall_updates() {
        let (fx, confirm) = held_fixture();
        let (controller, handle, mut events) = fx.open(1, ProgressConfig::default());
        let task = tokio::spawn(controller.run());
        assert!(eventually(|| fx.mock.opens(1) == 1).await);

        fx.mock.push(running(1, Some(10.0)));
        assert!(matches!(events.recv().await, Some(ProgressEvent::Progress(_))));

        handle.request_abort();
        fx.mock.push(running(1, Some(20.0)));
        match events.recv().await {
            Some(ProgressEvent::Progress(update)) => {
                assert_eq!(update.percent_complete, Some(20.0));
                assert!(!update.is_aborting);
            }
            other => panic!("expected progress update, got {other:?}"),
        }
        assert!(fx.mock.calls_to("core.job_abort").is_empty());

        confirm.release.notify_one();
        match events.recv().await {
            Some(ProgressEvent::Progress(update)) => assert!(update.is_aborting),
            other => panic!("expected aborting update, got {other:?}"),
        }
        assert_eq!(fx.mock.calls_to("core.job_abort"), vec![serde_json::json!([1])]);

        handle.close();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_close_while_prompt_open() {
        let (fx, _confirm) = held_fixture();
        let (controller, handle, mut events) = fx.open(1, ProgressConfig::default());
        let task = tokio::spawn(controller.run());
        assert!(eventually(|| fx.mock.opens(1) == 1).await);

        fx.mock.push(running(1, Some(10.0)));
        events.recv().await;
        handle.request_abort();
        handle.close();

        let view = task.await.unwrap();
        assert!(!view.is_aborting);
        assert!(fx.mock.calls_to("core.job_abort").is_empty());
        assert!(eventually(|| fx.mock.releases(1) == 1).await);
    }

    #[tokio::test]
    async fn test_abort_failure_keeps_view_open() {
        let fx = fixture(true);
        fx.mock.set_call_failure(Some(TransportError::Timeout {
            method: "core.job_abort".into(),
        }));
        let (controller, handle, mut events) = fx.open(1, ProgressConfig::default());
        let task = tokio::spawn(controller.run());
        assert!(eventually(|| fx.mock.opens(1) == 1).await);

        fx.mock.push(running(1, Some(10.0)));
        events.recv().await;
        handle.request_abort();
        assert!(matches!(events.recv().await, Some(ProgressEvent::AbortFailed(_))));
        assert!(!task.is_finished());

        handle.close();
        let view = task.await.unwrap();
        assert!(!view.is_aborting);
    }
}
