//! End-to-end runs through the public API against a local HTTP server

use async_trait::async_trait;
use harvest_dl::config::RateLimitConfig;
use harvest_dl::{
    CandidateLink, CollectionError, Collector, Config, Coordinator, RetryConfig, ScorerConfig,
    SessionState, SiteConfig, StaticCollector, VisitedOutcome,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const BODY: &[u8] = b"%PDF-1.7 annual report";

fn pdf() -> ResponseTemplate {
    ResponseTemplate::new(200)
        .insert_header("content-type", "application/pdf")
        .set_body_bytes(BODY.to_vec())
}

fn site(name: &str, server: &MockServer) -> SiteConfig {
    let mut site = SiteConfig::new(name, server.uri());
    site.rate_limit = RateLimitConfig {
        requests_per_minute: 60_000,
        burst: 50,
    };
    site
}

fn config(dir: &TempDir, sites: Vec<SiteConfig>) -> Config {
    let mut config = Config {
        sites,
        database_path: dir.path().join("ledger.db"),
        ..Config::default()
    };
    config.fetch.download_dir = dir.path().join("downloads");
    config.retry = RetryConfig {
        max_retries: 2,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(10),
        backoff_multiplier: 2.0,
        jitter: false,
    };
    config
}

fn link(server: &MockServer, site: &str, file: &str) -> CandidateLink {
    let ext = file.rsplit_once('.').map_or(String::new(), |(_, e)| format!(".{e}"));
    CandidateLink::new(format!("{}/{file}", server.uri()), site, ext).with_title(file)
}

async fn downloaded_files(dir: &Path) -> Vec<String> {
    let mut names = Vec::new();
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return names;
    };
    while let Some(entry) = entries.next_entry().await.unwrap() {
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    names.sort();
    names
}

fn reports_site(server: &MockServer) -> SiteConfig {
    let mut reports = site("reports", server);
    reports.file_types = vec![".pdf".into()];
    reports.filters.include = vec!["2025".into()];
    reports.filters.exclude = vec!["draft".into()];
    reports
}

fn reports_batch(server: &MockServer) -> Vec<CandidateLink> {
    vec![
        link(server, "reports", "report-2025.pdf"),
        link(server, "reports", "report-2025-draft.pdf"),
        link(server, "reports", "notes.txt"),
    ]
}

#[tokio::test]
async fn only_matching_report_is_downloaded() {
    let dir = tempfile::tempdir().unwrap();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/report-2025.pdf"))
        .respond_with(pdf())
        .expect(1)
        .mount(&server)
        .await;

    let collector = StaticCollector::new().with_batch("reports", reports_batch(&server));
    let coordinator = Coordinator::new(config(&dir, vec![reports_site(&server)]), Arc::new(collector))
        .await
        .unwrap();

    let summary = coordinator.run(&CancellationToken::new()).await;

    assert!(summary.all_sites_fetched());
    assert_eq!(summary.links_found, 3);
    assert_eq!(summary.links_filtered_in, 1);
    assert_eq!(summary.downloads_succeeded, 1);
    assert_eq!(summary.bytes_downloaded, BODY.len() as u64);

    let files = downloaded_files(&dir.path().join("downloads")).await;
    assert_eq!(files.len(), 1);
    assert!(files[0].starts_with("reports_"), "unexpected name {}", files[0]);
    assert!(files[0].ends_with(".pdf"));

    let db = coordinator.database();
    let record = db
        .success_record(&format!("{}/report-2025.pdf", server.uri()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.file_size_bytes, Some(BODY.len() as u64));
    assert_eq!(record.checksum.as_deref().map(str::len), Some(64));
    assert!(record.local_path.unwrap().exists());
    assert_eq!(
        db.is_visited(&format!("{}/report-2025-draft.pdf", server.uri()))
            .await
            .unwrap(),
        Some(VisitedOutcome::SkippedFiltered)
    );
}

#[tokio::test]
async fn second_run_downloads_nothing_new() {
    let dir = tempfile::tempdir().unwrap();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/report-2025.pdf"))
        .respond_with(pdf())
        .expect(1)
        .mount(&server)
        .await;

    for run in 0..2 {
        let collector = StaticCollector::new().with_batch("reports", reports_batch(&server));
        let coordinator =
            Coordinator::new(config(&dir, vec![reports_site(&server)]), Arc::new(collector))
                .await
                .unwrap();
        let summary = coordinator.run(&CancellationToken::new()).await;
        assert!(summary.all_sites_fetched());

        let site = &summary.sites[0];
        if run == 0 {
            assert_eq!(summary.downloads_succeeded, 1);
        } else {
            assert_eq!(summary.downloads_succeeded, 0);
            assert_eq!(summary.links_filtered_in, 0);
            assert_eq!(site.drops.history, 1);
            assert_eq!(site.drops.rules, 2, "filtered links are re-evaluated each run");

            let url = format!("{}/report-2025.pdf", server.uri());
            let records = coordinator.database().records_for_url(&url).await.unwrap();
            assert_eq!(records.len(), 1);
            assert_eq!(
                coordinator.database().count_visited("reports").await.unwrap(),
                3
            );
        }
        coordinator.database().pool().close().await;
    }

    assert_eq!(downloaded_files(&dir.path().join("downloads")).await.len(), 1);
}

struct PartiallyDownCollector {
    server_uri: String,
}

#[async_trait]
impl Collector for PartiallyDownCollector {
    async fn collect(&self, site: &SiteConfig) -> Result<Vec<CandidateLink>, CollectionError> {
        if site.name == "down" {
            return Err(CollectionError::new(&site.name, "listing page returned 502"));
        }
        Ok(vec![CandidateLink::new(
            format!("{}/{}.pdf", self.server_uri, site.name),
            &site.name,
            ".pdf",
        )])
    }
}

#[tokio::test]
async fn failing_site_does_not_stop_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let server = MockServer::start().await;
    Mock::given(method("GET")).respond_with(pdf()).mount(&server).await;

    let collector = PartiallyDownCollector {
        server_uri: server.uri(),
    };
    let sites = vec![site("first", &server), site("down", &server), site("last", &server)];
    let coordinator = Coordinator::new(config(&dir, sites), Arc::new(collector))
        .await
        .unwrap();

    let summary = coordinator.run(&CancellationToken::new()).await;

    assert_eq!(summary.sites_processed, 3);
    assert_eq!(summary.downloads_succeeded, 2);
    assert!(summary.fatal_error.is_none());
    assert!(!summary.all_sites_fetched());

    let states: Vec<_> = summary.sites.iter().map(|s| s.state).collect();
    assert_eq!(
        states,
        vec![SessionState::Done, SessionState::Failed, SessionState::Done]
    );
    assert!(
        summary.sites[1]
            .error
            .as_deref()
            .is_some_and(|e| e.contains("502"))
    );

    let db = coordinator.database();
    let sessions = db.recent_sessions(Some("down"), 5).await.unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].success, Some(false));
    assert!(db.open_sessions().await.unwrap().is_empty());
}

#[tokio::test]
async fn keyword_scorer_prunes_irrelevant_links() {
    let dir = tempfile::tempdir().unwrap();
    let server = MockServer::start().await;
    Mock::given(method("GET")).respond_with(pdf()).mount(&server).await;

    let mut budget = site("budget", &server);
    budget.relevance_threshold = 0.5;
    let mut config = config(&dir, vec![budget]);
    config.scorer = ScorerConfig::Keyword {
        keywords: vec!["budget".into(), "capital".into()],
    };

    let collector = StaticCollector::new().with_batch(
        "budget",
        vec![
            link(&server, "budget", "capital-budget.pdf"),
            link(&server, "budget", "operating-budget.pdf"),
            link(&server, "budget", "parks-newsletter.pdf"),
        ],
    );
    let coordinator = Coordinator::new(config, Arc::new(collector)).await.unwrap();
    let summary = coordinator.run(&CancellationToken::new()).await;

    assert_eq!(summary.downloads_succeeded, 2);
    assert_eq!(summary.sites[0].drops.relevance, 1);
    assert_eq!(
        coordinator
            .database()
            .is_visited(&format!("{}/parks-newsletter.pdf", server.uri()))
            .await
            .unwrap(),
        Some(VisitedOutcome::SkippedFiltered)
    );
}
