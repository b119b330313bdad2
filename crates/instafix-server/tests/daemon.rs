//! Daemon wiring: settings -> services -> resolve, listener, maintenance.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use instafix::{FetchErrorKind, RemoteWorker, WorkerConfig};
use instafix_server::maintenance;
use instafix_server::{Services, Settings};

// ─────────────────────── helpers ───────────────────────

#[derive(Parser)]
struct TestCli {
    #[command(flatten)]
    settings: Settings,
}

fn parse_settings(dir: &tempfile::TempDir, extra: &[&str]) -> Settings {
    let data_dir = dir.path().to_str().unwrap().to_string();
    let mut argv = vec!["instafix".to_string(), "--data-dir".to_string(), data_dir];
    argv.extend(extra.iter().map(|s| s.to_string()));
    TestCli::try_parse_from(argv).unwrap().settings
}

const EMBED_DOC: &str = concat!(
    "<html><body>\n",
    r#"<script>s.handle("x", "{\"gql_data\":{\"shortcode_media\":{\"__typename\":\"GraphImage\",\"display_url\":\"https://cdninstagram.example/v/1.jpg?x=1\",\"owner\":{\"username\":\"frank\"}}}}");</script>"#,
    "\n</body></html>"
);

// ─────────────────────── tests ───────────────────────

#[tokio::test]
async fn test_services_resolve_and_cache() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/p/Cdaemon/embed/captioned/"))
        .respond_with(ResponseTemplate::new(200).set_body_string(EMBED_DOC))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let settings = parse_settings(&dir, &["--origin-url", &server.uri()]);
    let services = Services::build(&settings).unwrap();

    let record = services.coordinator.resolve("Cdaemon").await.unwrap();
    assert_eq!(record.username, "frank");
    assert_eq!(record.media[0].url, "https://scontent.cdninstagram.com/v/1.jpg?x=1");
    assert!(dir.path().join("cache.db").exists());
    assert!(dir.path().join("grid").is_dir());

    // Same data dir, fresh services: served from the persisted cache.
    drop(services);
    let reopened = Services::build(&settings).unwrap();
    let cached = reopened.coordinator.resolve("Cdaemon").await.unwrap();
    assert_eq!(cached, record);

    let report = maintenance::run_once(&reopened.store, &reopened.grid).await;
    assert_eq!(report.expired_removed, 0);
    assert_eq!(report.cache_entries_after, 1);
}

#[tokio::test]
async fn test_serve_with_remote_worker() {
    let origin = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/p/Cworker/embed/captioned/"))
        .respond_with(ResponseTemplate::new(200).set_body_string(EMBED_DOC))
        .mount(&origin)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let settings = parse_settings(
        &dir,
        &[
            "--remote-listen",
            "127.0.0.1:0",
            "--remote-token",
            "tok",
            "--route",
            "remote-only",
        ],
    );
    let mut services = Services::build(&settings).unwrap();
    let addr = services.start_remote_listener(&settings).await.unwrap().unwrap();

    // The worker fetches from the mock origin; the daemon never does.
    let worker_settings = parse_settings(&dir, &["--origin-url", &origin.uri()]);
    let worker = RemoteWorker::new(
        WorkerConfig::new(addr.to_string(), b"tok".to_vec()).unwrap(),
        instafix_server::services::local_source(&worker_settings),
    );
    let worker_shutdown = CancellationToken::new();
    let worker_task = {
        let shutdown = worker_shutdown.clone();
        tokio::spawn(async move { worker.run(shutdown).await })
    };

    let pool = Arc::clone(services.remote.as_ref().unwrap());
    for _ in 0..500 {
        if pool.sessions().first().map(|s| s.open_streams) == Some(8) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let record = services.coordinator.resolve("Cworker").await.unwrap();
    assert_eq!(record.username, "frank");
    assert!(record.media[0].url.starts_with("https://scontent.cdninstagram.com/"));

    let missing = services.coordinator.resolve("Cnope").await.unwrap_err();
    assert_eq!(missing.kind(), FetchErrorKind::NotFound);

    worker_shutdown.cancel();
    worker_task.await.unwrap().unwrap();
    services.stop().await;
}
