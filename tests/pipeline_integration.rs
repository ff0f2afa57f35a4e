//! End-to-end pipeline tests: real store, mock origin, recording publisher.

use std::path::Path;
use std::time::Duration;

use media_relay::{PipelineError, RunMode};
use wiremock::matchers::{method, path, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

mod support;
use support::socket_guard::start_mock_server_or_skip;
use support::{
    FixedSpace, Harness, RangeResponder, RecordingPublisher, RequestLog, SeenRequest,
    SimulatedDisk, payload,
};

async fn serve(server: &MockServer, len: usize) -> RequestLog {
    let responder = RangeResponder::new(payload(len), true);
    let log = responder.log();
    Mock::given(path_regex(r"^/v/.+"))
        .respond_with(responder)
        .mount(server)
        .await;
    log
}

fn count_files(dir: &Path) -> usize {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    entries
        .flatten()
        .map(|entry| {
            let path = entry.path();
            if path.is_dir() { count_files(&path) } else { 1 }
        })
        .sum()
}

#[tokio::test]
async fn test_fresh_record_is_downloaded_once_and_published_once() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    let log = serve(&server, 1_000_000).await;
    let harness = Harness::new().await;

    for n in 1..=6 {
        harness
            .add("other", &format!("filler-{n}"), "https://cdn.example.com/x.mp4", None)
            .await;
    }
    let id = harness
        .add(
            "site",
            "p7",
            &format!("{}/v/film.mp4", server.uri()),
            Some(1_000_000),
        )
        .await;
    assert_eq!(id, 7);

    let mut config = harness.config();
    config.mode = RunMode::Sequential;
    config.delete_after_publish = false;
    let summary = harness
        .orchestrator(config, FixedSpace::plenty())
        .run("site")
        .await
        .unwrap();

    assert_eq!(summary.total, 1);
    assert_eq!(summary.succeeded, 1);
    assert_eq!(
        log.transfers(),
        vec![SeenRequest {
            method: "GET".into(),
            range: None,
        }]
    );

    let record = harness.store.get(7).await.unwrap().unwrap();
    let local = record.local_path_buf().unwrap();
    assert!(local.to_string_lossy().ends_with("_7.mp4"));
    assert_eq!(std::fs::metadata(&local).unwrap().len(), 1_000_000);
    assert_eq!(record.local_size, 1_000_000);
    assert!(record.published);
    let downloaded_at = record.downloaded_at.unwrap();
    let published_at = record.published_at.unwrap();
    assert!(published_at >= downloaded_at);

    let published = harness.publisher.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].bytes, 1_000_000);
    assert_eq!(published[0].destination, "@relay_test");
    assert!(!published[0].streamed);
}

#[tokio::test]
async fn test_second_run_downloads_and_publishes_nothing() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    let log = serve(&server, 50_000).await;
    let harness = Harness::new().await;
    for n in 0..3 {
        harness
            .add("site", &format!("p{n}"), &format!("{}/v/{n}.mp4", server.uri()), None)
            .await;
    }

    let orchestrator = harness.orchestrator(harness.config(), FixedSpace::plenty());
    let first = orchestrator.run("site").await.unwrap();
    assert_eq!(first.succeeded, 3);
    let requests_after_first = log.all().len();

    let second = orchestrator.run("site").await.unwrap();
    assert_eq!(second.total, 0);
    assert_eq!(log.all().len(), requests_after_first);
    assert_eq!(harness.publisher.count(), 3);
}

#[tokio::test]
async fn test_downloaded_file_is_not_fetched_again() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    let log = serve(&server, 80_000).await;
    let harness = Harness::new().await;
    let id = harness
        .add("site", "p1", &format!("{}/v/1.mp4", server.uri()), None)
        .await;

    let mut download_only = harness.config();
    download_only.upload_concurrency = 0;
    let summary = harness
        .orchestrator(download_only, FixedSpace::plenty())
        .run("site")
        .await
        .unwrap();
    assert_eq!(summary.succeeded, 1);
    assert_eq!(harness.publisher.count(), 0);
    assert!(!harness.store.get(id).await.unwrap().unwrap().published);

    let summary = harness
        .orchestrator(harness.config(), FixedSpace::plenty())
        .run("site")
        .await
        .unwrap();
    assert_eq!(summary.succeeded, 1);
    assert_eq!(log.transfers().len(), 1);
    assert_eq!(harness.publisher.count(), 1);
    assert_eq!(harness.publisher.published()[0].bytes, 80_000);
}

#[tokio::test]
async fn test_many_consumers_publish_one_at_a_time() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    serve(&server, 20_000).await;
    let harness =
        Harness::with_publisher(RecordingPublisher::with_hold(Duration::from_millis(30))).await;
    for n in 0..6 {
        harness
            .add("site", &format!("p{n}"), &format!("{}/v/{n}.mp4", server.uri()), None)
            .await;
    }

    let mut config = harness.config();
    config.download_concurrency = 4;
    config.upload_concurrency = 4;
    let summary = harness
        .orchestrator(config, FixedSpace::plenty())
        .run("site")
        .await
        .unwrap();

    assert_eq!(summary.succeeded, 6);
    assert_eq!(harness.publisher.count(), 6);
    assert_eq!(harness.publisher.max_in_flight(), 1);
    assert_eq!(count_files(&harness.download_dir), 0);
}

#[tokio::test]
async fn test_low_space_skips_records_without_failing_them() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    let log = serve(&server, 10_000).await;
    let harness = Harness::new().await;
    for n in 0..2 {
        harness
            .add(
                "site",
                &format!("p{n}"),
                &format!("{}/v/{n}.mp4", server.uri()),
                Some(10_000),
            )
            .await;
    }

    let space = FixedSpace::new(500);
    let summary = harness
        .orchestrator(harness.config(), space.clone())
        .run("site")
        .await
        .unwrap();
    assert_eq!(summary.skipped, 2);
    assert_eq!(summary.failed, 0);
    assert!(log.transfers().is_empty());
    let counts = harness.store.counts("site").await.unwrap();
    assert_eq!(counts.pending_download, 2);
    assert_eq!(counts.over_attempt_limit, 0);

    space.set(10_000_000);
    let summary = harness
        .orchestrator(harness.config(), space)
        .run("site")
        .await
        .unwrap();
    assert_eq!(summary.succeeded, 2);
}

#[tokio::test]
async fn test_producer_waits_while_consumer_frees_space() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    serve(&server, 600_000).await;
    let harness = Harness::new().await;
    for n in 0..3 {
        harness
            .add(
                "site",
                &format!("p{n}"),
                &format!("{}/v/{n}.mp4", server.uri()),
                Some(600_000),
            )
            .await;
    }

    let mut config = harness.config();
    config.download_concurrency = 1;
    config.upload_concurrency = 1;
    config.disk.min_free_bytes = 500_000;
    config.disk.critical_free_bytes = 100_000;
    config.disk.space_wait = Duration::from_secs(10);
    // Room for exactly one file above the minimum.
    let disk = SimulatedDisk::new(1_700_000, harness.download_dir.clone());

    let summary = harness
        .orchestrator(config, disk)
        .run("site")
        .await
        .unwrap();

    assert_eq!(summary.succeeded, 3);
    assert_eq!(summary.skipped, 0);
    assert_eq!(harness.publisher.count(), 3);
    assert_eq!(harness.store.counts("site").await.unwrap().published, 3);
}

#[tokio::test]
async fn test_publish_only_sends_downloaded_files() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    let log = serve(&server, 30_000).await;
    let harness = Harness::new().await;
    let first = harness
        .add("site", "p1", &format!("{}/v/1.mp4", server.uri()), None)
        .await;
    harness
        .add("site", "p2", &format!("{}/v/2.mp4", server.uri()), None)
        .await;

    let orchestrator = harness.orchestrator(harness.config(), FixedSpace::plenty());
    let downloaded = orchestrator.download_only("site").await.unwrap();
    assert_eq!(downloaded.succeeded, 2);
    let requests_after_download = log.all().len();

    let published = orchestrator.publish_only("site").await.unwrap();
    assert_eq!(published.succeeded, 2);
    assert_eq!(log.all().len(), requests_after_download);
    assert_eq!(harness.publisher.count(), 2);

    let record = harness.store.get(first).await.unwrap().unwrap();
    assert!(record.published);
    assert!(record.local_path.is_none());
    assert_eq!(count_files(&harness.download_dir), 0);
}

#[tokio::test]
async fn test_publish_only_requires_publishers() {
    let harness = Harness::new().await;
    let mut config = harness.config();
    config.upload_concurrency = 0;

    let err = harness
        .orchestrator(config, FixedSpace::plenty())
        .publish_only("site")
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::PublishingDisabled));
}

#[tokio::test]
async fn test_streaming_mode_publishes_without_keeping_files() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    serve(&server, 300_000).await;
    let harness = Harness::new().await;
    for n in 0..2 {
        harness
            .add("site", &format!("p{n}"), &format!("{}/v/{n}.mp4", server.uri()), None)
            .await;
    }

    let mut config = harness.config();
    config.mode = RunMode::Streaming;
    let summary = harness
        .orchestrator(config, FixedSpace::plenty())
        .run("site")
        .await
        .unwrap();

    assert_eq!(summary.succeeded, 2);
    let published = harness.publisher.published();
    assert!(published.iter().all(|p| p.streamed && p.bytes == 300_000));
    assert_eq!(count_files(&harness.download_dir), 0);
    assert_eq!(harness.store.counts("site").await.unwrap().published, 2);
}

#[tokio::test]
async fn test_missing_origin_file_counts_a_failed_attempt() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path("/v/gone.mp4"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    let harness = Harness::new().await;
    let id = harness
        .add("site", "gone", &format!("{}/v/gone.mp4", server.uri()), Some(1_000))
        .await;

    let summary = harness
        .orchestrator(harness.config(), FixedSpace::plenty())
        .run("site")
        .await
        .unwrap();

    assert_eq!(summary.failed, 1);
    assert_eq!(harness.publisher.count(), 0);
    let record = harness.store.get(id).await.unwrap().unwrap();
    assert_eq!(record.failed_attempts, 1);
    assert!(record.last_error.is_some());
    assert!(!record.published);
}
