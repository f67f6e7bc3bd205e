use super::*;
use crate::config::RateLimitConfig;
use crate::types::DownloadStatus;
use std::time::{Duration, Instant};
use tempfile::{NamedTempFile, TempDir};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct Harness {
    db: Arc<Database>,
    _db_file: NamedTempFile,
    dir: TempDir,
    executor: FetchExecutor,
    site: SiteConfig,
    limiter: RequestLimiter,
}

async fn harness(max_concurrent: usize) -> Harness {
    let db_file = NamedTempFile::new().unwrap();
    let db = Arc::new(Database::new(db_file.path()).await.unwrap());
    let dir = tempfile::tempdir().unwrap();

    let fetch = FetchConfig {
        download_dir: dir.path().to_path_buf(),
        max_concurrent_downloads: max_concurrent,
        timeout: Duration::from_secs(5),
        ..FetchConfig::default()
    };
    let retry = RetryConfig {
        max_retries: 3,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(20),
        backoff_multiplier: 2.0,
        jitter: false,
    };
    let executor = FetchExecutor::new(Arc::clone(&db), &fetch, &retry).unwrap();

    let mut site = SiteConfig::new("city", "https://city.example/");
    site.rate_limit = RateLimitConfig {
        requests_per_minute: 60_000,
        burst: 50,
    };
    let limiter = RequestLimiter::new(&site.rate_limit);

    Harness {
        db,
        _db_file: db_file,
        dir,
        executor,
        site,
        limiter,
    }
}

fn pdf() -> ResponseTemplate {
    ResponseTemplate::new(200)
        .insert_header("content-type", "application/pdf")
        .set_body_bytes(b"%PDF-1.4 test body".to_vec())
}

fn candidate(server: &MockServer, name: &str) -> CandidateLink {
    CandidateLink::new(format!("{}/{name}", server.uri()), "city", ".pdf")
}

async fn files_in(dir: &std::path::Path) -> Vec<String> {
    let mut names = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await.unwrap();
    while let Some(entry) = entries.next_entry().await.unwrap() {
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    names.sort();
    names
}

#[tokio::test]
async fn transient_failure_is_attempted_max_retries_plus_one() {
    let h = harness(2).await;
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .expect(4)
        .mount(&server)
        .await;

    let link = candidate(&server, "flaky.pdf");
    let summary = h
        .executor
        .run(&h.site, vec![link.clone()], &h.limiter, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.failed, 1);
    assert_eq!(summary.succeeded, 0);

    let records = h.db.records_for_url(&link.url).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, DownloadStatus::Failed);
    assert_eq!(records[0].error_kind, Some(FailureKind::TransientExhausted));
    assert_eq!(records[0].attempt_count, 4);
    assert_eq!(
        h.db.is_visited(&link.url).await.unwrap(),
        None,
        "exhausted transient failures are retried next run"
    );
}

#[tokio::test]
async fn one_permanent_failure_does_not_affect_siblings() {
    let h = harness(3).await;
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/missing.pdf"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET")).respond_with(pdf()).mount(&server).await;

    let batch: Vec<_> = ["a.pdf", "b.pdf", "missing.pdf", "c.pdf", "d.pdf"]
        .into_iter()
        .map(|n| candidate(&server, n))
        .collect();

    let summary = h
        .executor
        .run(&h.site, batch, &h.limiter, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.succeeded, 4);
    assert_eq!(summary.failed, 1);
    assert!(summary.ledger_error.is_none());
    assert_eq!(summary.bytes_downloaded, 4 * b"%PDF-1.4 test body".len() as u64);

    let missing = format!("{}/missing.pdf", server.uri());
    let records = h.db.records_for_url(&missing).await.unwrap();
    assert_eq!(records[0].error_kind, Some(FailureKind::Permanent));
    assert_eq!(records[0].attempt_count, 1);
    assert_eq!(
        h.db.is_visited(&missing).await.unwrap(),
        Some(VisitedOutcome::FailedPermanent)
    );

    let errors = h.db.recent_errors("city", 10).await.unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].error_kind, "http_404");
    assert_eq!(errors[0].url.as_deref(), Some(missing.as_str()));

    assert_eq!(h.db.count_successes("city").await.unwrap(), 4);
    assert_eq!(files_in(h.dir.path()).await.len(), 4);
}

#[tokio::test]
async fn rate_limited_response_is_retried() {
    let h = harness(1).await;
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "120"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET")).respond_with(pdf()).mount(&server).await;

    let link = candidate(&server, "busy.pdf");
    let started = Instant::now();
    let summary = h
        .executor
        .run(&h.site, vec![link.clone()], &h.limiter, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.succeeded, 1);
    assert!(
        started.elapsed() < Duration::from_secs(10),
        "Retry-After must be capped by max_delay"
    );
    let record = h.db.success_record(&link.url).await.unwrap().unwrap();
    assert_eq!(record.attempt_count, 2);
}

#[tokio::test]
async fn already_recorded_success_is_skipped_duplicate() {
    let h = harness(2).await;
    let server = MockServer::start().await;
    Mock::given(method("GET")).respond_with(pdf()).mount(&server).await;

    let link = candidate(&server, "dup.pdf");
    h.db.record_attempt(&NewDownloadRecord::success(
        "city",
        &link.url,
        "/elsewhere/dup.pdf".into(),
        10,
        "00".into(),
        1,
    ))
    .await
    .unwrap();

    let summary = h
        .executor
        .run(&h.site, vec![link.clone()], &h.limiter, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.skipped_duplicate, 1);
    assert_eq!(summary.succeeded, 0);
    assert_eq!(summary.failed, 0);
    assert!(files_in(h.dir.path()).await.is_empty(), "redundant copy must be deleted");
    assert_eq!(
        h.db.is_visited(&link.url).await.unwrap(),
        Some(VisitedOutcome::Downloaded),
        "the earlier download keeps its visited outcome"
    );
    assert_eq!(h.db.records_for_url(&link.url).await.unwrap().len(), 1);
}

#[tokio::test]
async fn concurrent_workers_on_same_url_record_one_success() {
    let h = harness(4).await;
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(pdf().set_delay(Duration::from_millis(100)))
        .expect(2)
        .mount(&server)
        .await;

    let link = candidate(&server, "shared.pdf");
    let cancel = CancellationToken::new();
    let (a, b) = tokio::join!(
        h.executor.run(&h.site, vec![link.clone()], &h.limiter, &cancel),
        h.executor.run(&h.site, vec![link.clone()], &h.limiter, &cancel),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a.succeeded + b.succeeded, 1);
    assert_eq!(a.skipped_duplicate + b.skipped_duplicate, 1);
    assert_eq!(h.db.records_for_url(&link.url).await.unwrap().len(), 1);
    assert_eq!(files_in(h.dir.path()).await.len(), 1);
    assert_eq!(
        h.db.visited_for_site("city", &link.url).await.unwrap().unwrap().outcome,
        VisitedOutcome::Downloaded
    );
}

#[tokio::test]
async fn concurrency_is_bounded() {
    let h = harness(2).await;
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(pdf().set_delay(Duration::from_millis(200)))
        .mount(&server)
        .await;

    let batch: Vec<_> = (0..4).map(|i| candidate(&server, &format!("{i}.pdf"))).collect();
    let started = Instant::now();
    let summary = h
        .executor
        .run(&h.site, batch, &h.limiter, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.succeeded, 4);
    assert!(
        started.elapsed() >= Duration::from_millis(400),
        "four 200ms fetches through two slots need at least two rounds"
    );
}

#[tokio::test]
async fn site_cap_below_global_cap_is_honored() {
    let mut h = harness(4).await;
    h.site.max_concurrent_downloads = Some(1);
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(pdf().set_delay(Duration::from_millis(150)))
        .mount(&server)
        .await;

    let batch: Vec<_> = (0..3).map(|i| candidate(&server, &format!("{i}.pdf"))).collect();
    let started = Instant::now();
    let summary = h
        .executor
        .run(&h.site, batch, &h.limiter, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.succeeded, 3);
    assert!(started.elapsed() >= Duration::from_millis(450));
}

#[tokio::test]
async fn cancelled_run_starts_nothing() {
    let h = harness(2).await;
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(pdf())
        .expect(0)
        .mount(&server)
        .await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let batch: Vec<_> = (0..3).map(|i| candidate(&server, &format!("{i}.pdf"))).collect();
    let summary = h.executor.run(&h.site, batch, &h.limiter, &cancel).await.unwrap();

    assert_eq!(summary.cancelled, 3);
    assert_eq!(summary.succeeded + summary.failed, 0);
    assert_eq!(h.db.count_successes("city").await.unwrap(), 0);
}

fn cancel_after(cancel: &CancellationToken, delay: Duration) {
    let cancel = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        cancel.cancel();
    });
}

#[tokio::test]
async fn cancellation_while_waiting_for_rate_token_sends_nothing_more() {
    let mut h = harness(2).await;
    h.site.rate_limit = RateLimitConfig {
        requests_per_minute: 60,
        burst: 1,
    };
    h.limiter = RequestLimiter::new(&h.site.rate_limit);
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(pdf().set_delay(Duration::from_millis(300)))
        .mount(&server)
        .await;

    let cancel = CancellationToken::new();
    cancel_after(&cancel, Duration::from_millis(100));
    let batch = vec![candidate(&server, "first.pdf"), candidate(&server, "second.pdf")];
    let summary = h.executor.run(&h.site, batch, &h.limiter, &cancel).await.unwrap();

    assert_eq!(server.received_requests().await.unwrap().len(), 1);
    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.cancelled, 1);
    assert_eq!(summary.failed, 0);

    let second = format!("{}/second.pdf", server.uri());
    assert!(h.db.records_for_url(&second).await.unwrap().is_empty());
    assert_eq!(h.db.is_visited(&second).await.unwrap(), None);
}

#[tokio::test]
async fn cancellation_mid_fetch_lets_in_flight_attempt_finish() {
    let h = harness(1).await;
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(pdf().set_delay(Duration::from_millis(300)))
        .mount(&server)
        .await;

    let cancel = CancellationToken::new();
    cancel_after(&cancel, Duration::from_millis(100));
    let batch = vec![candidate(&server, "0.pdf"), candidate(&server, "1.pdf")];
    let summary = h.executor.run(&h.site, batch, &h.limiter, &cancel).await.unwrap();

    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.cancelled, 1);
    assert_eq!(server.received_requests().await.unwrap().len(), 1);

    let first = format!("{}/0.pdf", server.uri());
    let record = h.db.success_record(&first).await.unwrap().unwrap();
    assert!(record.local_path.unwrap().exists());
    assert_eq!(h.db.count_successes("city").await.unwrap(), 1);

    let files = files_in(h.dir.path()).await;
    assert_eq!(files, vec!["city_0.pdf".to_string()]);
    assert!(files.iter().all(|f| !f.ends_with(PART_SUFFIX)));
}

#[tokio::test]
async fn ledger_failure_is_reported_and_artifact_removed() {
    let h = harness(1).await;
    let server = MockServer::start().await;
    Mock::given(method("GET")).respond_with(pdf()).mount(&server).await;

    h.db.pool().close().await;

    let summary = h
        .executor
        .run(
            &h.site,
            vec![candidate(&server, "a.pdf"), candidate(&server, "b.pdf")],
            &h.limiter,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(summary.ledger_error.is_some());
    assert_eq!(summary.succeeded, 0);
    assert!(files_in(h.dir.path()).await.is_empty());
}
