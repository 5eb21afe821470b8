//! End-to-end flows across broker, panel and progress views, driven by the
//! in-memory transport.

use std::sync::Arc;

use jobwatch_core::config::BrokerConfig;
use jobwatch_core::mock::{eventually, MockTransport, StaticConfirm};
use jobwatch_core::{
    AbortCoordinator, DownloadOptions, Job, JobBroker, JobOperator, JobPanel, JobStatus, ProgressConfig,
    ProgressEvent, TransportError,
};
use serde_json::json;

struct Harness {
    mock: Arc<MockTransport>,
    broker: JobBroker,
    operator: JobOperator,
    panel: JobPanel,
}

fn harness() -> Harness {
    let mock = MockTransport::new();
    let broker = JobBroker::new(mock.clone(), BrokerConfig::default());
    let abort = AbortCoordinator::new(mock.clone(), StaticConfirm::new(true));
    let operator = JobOperator::new(mock.clone(), broker.clone(), abort.clone());
    let panel = JobPanel::new(broker.clone(), mock.clone(), abort);
    Harness {
        mock,
        broker,
        operator,
        panel,
    }
}

fn report(id: u64, status: JobStatus) -> Job {
    Job::new(id, "reporting.export").with_status(status)
}

#[tokio::test]
async fn download_request_carries_job_result() {
    let h = harness();
    let config = ProgressConfig::default()
        .with_download(DownloadOptions::new("core.download").with_result_as("report_name"));

    let mut session = h
        .operator
        .start("reporting.export", json!([{"format": "csv"}]), config)
        .await
        .unwrap();
    let id = session.job_id();
    assert_eq!(h.mock.calls_to("reporting.export"), vec![json!([{"format": "csv"}])]);
    assert!(eventually(|| h.mock.opens(id) == 1).await);

    h.mock.push(report(id, JobStatus::running(Some(10.0), None)));
    h.mock.push(report(id, JobStatus::running(Some(55.0), None)));
    h.mock.push(report(
        id,
        JobStatus::Success {
            result: json!("https://x/report.csv"),
        },
    ));

    let mut percents = Vec::new();
    let mut download = None;
    let mut succeeded = false;
    while let Some(event) = session.next_event().await {
        match event {
            ProgressEvent::Progress(update) => percents.push(update.percent_complete),
            ProgressEvent::Success(job) => {
                succeeded = true;
                assert_eq!(job.result(), Some(&json!("https://x/report.csv")));
            }
            ProgressEvent::DownloadRequested(request) => download = Some(request),
            other => panic!("unexpected event {other:?}"),
        }
    }

    assert!(succeeded);
    assert_eq!(percents, vec![Some(10.0), Some(55.0)]);
    let download = download.unwrap();
    assert_eq!(download.method, "core.download");
    assert_eq!(download.argument("report_name"), Some(&json!("https://x/report.csv")));

    let view = session.finish().await.unwrap();
    assert_eq!(view.percent_complete, Some(55.0));
    assert!(eventually(|| h.mock.releases(id) == 1).await);
}

#[tokio::test]
async fn panel_and_detail_view_share_one_upstream() {
    let h = harness();
    h.mock.set_jobs(vec![Job::new(21, "pool.scrub").with_status(JobStatus::running(Some(1.0), None))]);
    h.panel.load().await.unwrap();

    let mut first = h.operator.observe(21, ProgressConfig::default());
    let second = h.operator.observe(21, ProgressConfig::default());
    assert!(eventually(|| h.broker.subscriber_count(21) == 3).await);
    assert_eq!(h.mock.opens(21), 1);

    // Closing one detail view keeps the others attached.
    second.finish().await.unwrap();
    assert_eq!(h.broker.subscriber_count(21), 2);

    h.mock.push(Job::new(21, "pool.scrub").with_status(JobStatus::running(Some(70.0), None)));
    assert!(matches!(first.next_event().await, Some(ProgressEvent::Progress(_))));
    assert!(eventually(|| {
        h.panel
            .job_by_id(21)
            .and_then(|j| j.progress().and_then(|p| p.percent))
            == Some(70.0)
    })
    .await);

    h.mock.push(Job::new(21, "pool.scrub").with_status(JobStatus::Aborted));
    assert!(eventually(|| h.panel.running_count() == 0).await);
    assert!(eventually(|| h.mock.releases(21) == 1).await);
    assert_eq!(h.mock.opens(21), 1);
    assert_eq!(h.broker.active_count(), 0);

    // Late observer sees only the cached terminal snapshot.
    let mut late = h.operator.observe(21, ProgressConfig::default());
    let mut saw_aborted = false;
    while let Some(event) = late.next_event().await {
        if matches!(event, ProgressEvent::Aborted(_)) {
            saw_aborted = true;
        }
    }
    assert!(saw_aborted);
    assert_eq!(h.mock.opens(21), 1);
}

#[tokio::test]
async fn disconnect_fails_every_observer() {
    let h = harness();
    h.panel.watch(5);
    let mut view = h.operator.observe(5, ProgressConfig::default());
    assert!(eventually(|| h.mock.opens(5) == 1).await);

    h.mock.push(Job::new(5, "pool.scrub").with_status(JobStatus::running(Some(33.0), None)));
    h.mock.fail(5, TransportError::Disconnected);

    let mut failure = None;
    while let Some(event) = view.next_event().await {
        if let ProgressEvent::TransportFailure(e) = event {
            failure = Some(e);
        }
    }
    assert_eq!(failure, Some(TransportError::Disconnected));
    assert!(eventually(|| h.panel.last_error() == Some(TransportError::Disconnected)).await);
    assert_eq!(h.panel.running_count(), 1);

    // A new observer opens a fresh upstream; failures are not cached.
    let _again = h.operator.observe(5, ProgressConfig::default());
    assert!(eventually(|| h.mock.opens(5) == 2).await);
}

#[tokio::test]
async fn start_failure_is_returned() {
    let h = harness();
    h.mock.set_call_failure(Some(TransportError::Rpc {
        code: 13,
        message: "Method does not exist".into(),
    }));
    let err = h
        .operator
        .start("no.such", json!([]), ProgressConfig::default())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, TransportError::Rpc { code: 13, .. }));
    assert_eq!(h.broker.active_count(), 0);
}
