//! End-to-end acquisition: mock origin -> extractor -> coordinator -> cache.

use std::sync::Arc;
use std::time::Duration;

use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use instafix::*;

// ─────────────────────── helpers ───────────────────────

const EMBED_DOC: &str = concat!(
    "<html><head><title>Embed</title></head><body>\n",
    r#"<script type="text/javascript">requireLazy(["TimeSliceImpl"], function(t) {s.handle("embed", "{\"gql_data\":{\"shortcode_media\":{\"__typename\":\"GraphImage\",\"display_url\":\"https:\/\/x\/1.jpg\",\"owner\":{\"username\":\"alice\"},\"edge_media_to_caption\":{\"edges\":[{\"node\":{\"text\":\"hi\"}}]}}}}")});</script>"#,
    "\n</body></html>"
);

const CAROL_QUERY: &str = r#"{"data":{"xdt_shortcode_media":{"__typename":"XDTGraphImage","display_url":"https://x/c.jpg","owner":{"username":"carol"},"edge_media_to_caption":{"edges":[{"node":{"text":"from the query"}}]}}},"status":"ok"}"#;

fn alice() -> PostRecord {
    PostRecord {
        post_id: "Cabc123".into(),
        username: "alice".into(),
        caption: "hi".into(),
        media: vec![MediaItem::new("GraphImage", "https://x/1.jpg")],
    }
}

fn origin_for(server: &MockServer) -> Arc<HttpOrigin> {
    let mut config = OriginConfig::default().with_base_url(&server.uri());
    config.retry_backoff = Duration::from_millis(10);
    config.timeout = Duration::from_secs(2);
    Arc::new(HttpOrigin::new(config))
}

fn coordinator(server: &MockServer, store: Arc<CacheStore>) -> FetchCoordinator {
    let local = LocalFetcher::new(origin_for(server), Extractor::new());
    let config = CoordinatorConfig {
        route: FetchRoute::LocalOnly,
        media_host: None,
        ..CoordinatorConfig::default()
    };
    FetchCoordinator::new(store, Arc::new(local), None, config)
}

// ─────────────────────── store ───────────────────────

#[test]
fn test_record_round_trips_through_store() {
    let dir = tempfile::tempdir().unwrap();
    let store = CacheStore::open(&dir.path().join("cache.db")).unwrap();

    store.put("Cabc123", &alice(), Duration::from_secs(60)).unwrap();
    let cached = store.get("Cabc123").unwrap().unwrap();
    assert_eq!(cached.record, alice());
    assert_eq!(store.index_len().unwrap(), 1);
}

// ─────────────────────── resolve ───────────────────────

#[tokio::test]
async fn test_resolve_fetches_once_then_serves_cache() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/p/Cabc123/embed/captioned/"))
        .respond_with(ResponseTemplate::new(200).set_body_string(EMBED_DOC))
        .expect(1)
        .mount(&server)
        .await;

    let store = Arc::new(CacheStore::open_in_memory().unwrap());
    let coordinator = coordinator(&server, Arc::clone(&store));

    let record = coordinator.resolve("Cabc123").await.unwrap();
    assert_eq!(record, alice());
    assert!(store.get("Cabc123").unwrap().is_some());

    let again = coordinator.resolve("Cabc123").await.unwrap();
    assert_eq!(again, record);
}

#[tokio::test]
async fn test_transport_error_after_exactly_three_attempts() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/p/Cdown/embed/captioned/"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&server)
        .await;
    // The structured query still gets its one chance, and fails too.
    Mock::given(method("POST"))
        .and(path("/graphql/query/"))
        .respond_with(ResponseTemplate::new(503))
        .expect(1)
        .mount(&server)
        .await;

    let store = Arc::new(CacheStore::open_in_memory().unwrap());
    let err = coordinator(&server, Arc::clone(&store))
        .resolve("Cdown")
        .await
        .unwrap_err();

    assert_eq!(err.kind(), FetchErrorKind::Transport);
    assert!(store.is_empty().unwrap());
}

#[tokio::test]
async fn test_rate_limited_embed_falls_back_to_query() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/p/Cabc123/embed/captioned/"))
        .respond_with(ResponseTemplate::new(429))
        .expect(3)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/graphql/query/"))
        .respond_with(ResponseTemplate::new(200).set_body_string(CAROL_QUERY))
        .expect(1)
        .mount(&server)
        .await;

    let store = Arc::new(CacheStore::open_in_memory().unwrap());
    let record = coordinator(&server, Arc::clone(&store))
        .resolve("Cabc123")
        .await
        .unwrap();

    assert_eq!(record.username, "carol");
    assert_eq!(record.caption, "from the query");
    assert_eq!(record.media, vec![MediaItem::new("XDTGraphImage", "https://x/c.jpg")]);
    assert!(store.get("Cabc123").unwrap().is_some());
}

#[tokio::test]
async fn test_concurrent_resolves_share_one_fetch() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/p/Cabc123/embed/captioned/"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(EMBED_DOC)
                .set_delay(Duration::from_millis(200)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let store = Arc::new(CacheStore::open_in_memory().unwrap());
    let coordinator = coordinator(&server, store);

    let calls = (0..8).map(|_| {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.resolve("Cabc123").await })
    });
    for result in futures::future::join_all(calls).await {
        assert_eq!(result.unwrap().unwrap().username, "alice");
    }
    assert_eq!(coordinator.in_flight(), 0);
}

#[tokio::test]
async fn test_unresolvable_post_is_not_cached() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/p/Cgone/embed/captioned/"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html><body></body></html>"))
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/graphql/query/"))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"data":{"xdt_shortcode_media":null},"status":"ok"}"#))
        .expect(2)
        .mount(&server)
        .await;

    let store = Arc::new(CacheStore::open_in_memory().unwrap());
    let coordinator = coordinator(&server, Arc::clone(&store));

    for _ in 0..2 {
        let err = coordinator.resolve("Cgone").await.unwrap_err();
        assert_eq!(err.kind(), FetchErrorKind::NotFound);
    }
    assert!(store.is_empty().unwrap());
}

#[tokio::test]
async fn test_media_host_rewritten_before_caching() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/p/Cabc123/embed/captioned/"))
        .respond_with(ResponseTemplate::new(200).set_body_string(EMBED_DOC))
        .mount(&server)
        .await;

    let store = Arc::new(CacheStore::open_in_memory().unwrap());
    let local = LocalFetcher::new(origin_for(&server), Extractor::new());
    let coordinator = FetchCoordinator::new(
        Arc::clone(&store),
        Arc::new(local),
        None,
        CoordinatorConfig::default(),
    );

    let record = coordinator.resolve("Cabc123").await.unwrap();
    assert_eq!(record.media[0].url, "https://scontent.cdninstagram.com/1.jpg");
    let cached = store.get("Cabc123").unwrap().unwrap();
    assert_eq!(cached.record.media[0].url, record.media[0].url);
}

#[tokio::test]
async fn test_invalid_id_never_reaches_origin() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let store = Arc::new(CacheStore::open_in_memory().unwrap());
    let err = coordinator(&server, store)
        .resolve("X../../admin")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), FetchErrorKind::InvalidPostId);
}
