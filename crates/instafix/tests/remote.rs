//! Remote worker link over real sockets: handshake, dispatch, timeouts.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use instafix::*;

// ─────────────────────── helpers ───────────────────────

const TOKEN: &[u8] = b"s3cret";

/// Post source with canned records and an optional per-post delay.
#[derive(Default)]
struct CannedSource {
    records: HashMap<String, PostRecord>,
    delays: HashMap<String, Duration>,
}

impl CannedSource {
    fn with(mut self, record: PostRecord) -> Self {
        self.records.insert(record.post_id.clone(), record);
        self
    }

    fn slow(mut self, post_id: &str, delay: Duration) -> Self {
        self.delays.insert(post_id.to_string(), delay);
        self
    }
}

#[async_trait]
impl PostSource for CannedSource {
    async fn fetch_post(&self, post_id: &str) -> FetchResult<PostRecord> {
        if let Some(delay) = self.delays.get(post_id) {
            tokio::time::sleep(*delay).await;
        }
        self.records
            .get(post_id)
            .cloned()
            .ok_or_else(|| FetchError::NotFound(post_id.to_string()))
    }
}

fn record(post_id: &str, username: &str) -> PostRecord {
    PostRecord {
        post_id: post_id.into(),
        username: username.into(),
        caption: "from the worker".into(),
        media: vec![MediaItem::new("GraphImage", "https://cdn.example/a.jpg")],
    }
}

struct Harness {
    pool: Arc<RemotePool>,
    addr: SocketAddr,
    shutdown: CancellationToken,
}

impl Harness {
    async fn start(config: RemoteConfig) -> Self {
        let pool = RemotePool::new(config);
        let listener = RemoteListener::bind("127.0.0.1:0", Arc::clone(&pool)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        tokio::spawn(listener.run(shutdown.clone()));
        Self { pool, addr, shutdown }
    }

    fn spawn_worker(&self, source: CannedSource, streams: u32) {
        let mut config = WorkerConfig::new(self.addr.to_string(), TOKEN).unwrap();
        config.streams = streams;
        config.reconnect_delay = Duration::from_millis(50);
        let worker = RemoteWorker::new(config, Arc::new(source));
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move { worker.run(shutdown).await });
    }

    /// Wait until one session reports `streams` open streams.
    async fn ready(&self, streams: usize) {
        for _ in 0..500 {
            let sessions = self.pool.sessions();
            if sessions.len() == 1 && sessions[0].open_streams == streams {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("worker never became ready: {:?}", self.pool.sessions());
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn config() -> RemoteConfig {
    RemoteConfig::new(TOKEN).unwrap()
}

// ─────────────────────── handshake ───────────────────────

#[tokio::test]
async fn test_wrong_token_is_closed() {
    let harness = Harness::start(config()).await;

    let mut stream = TcpStream::connect(harness.addr).await.unwrap();
    stream.write_all(&[6, b'w', b'r', b'o', b'n', b'g', b'!']).await.unwrap();
    let mut buf = [0u8; 1];
    let read = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
        .await
        .unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));
    assert_eq!(harness.pool.session_count(), 0);
}

#[tokio::test]
async fn test_oversized_token_is_closed() {
    let harness = Harness::start(config()).await;

    let mut stream = TcpStream::connect(harness.addr).await.unwrap();
    stream.write_all(&[9, 1, 2, 3, 4, 5, 6, 7, 8, 9]).await.unwrap();
    let mut buf = [0u8; 1];
    let read = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
        .await
        .unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));
    assert_eq!(harness.pool.session_count(), 0);
}

#[tokio::test]
async fn test_silent_client_times_out() {
    let mut config = config();
    config.handshake_timeout = Duration::from_millis(200);
    let harness = Harness::start(config).await;

    let mut stream = TcpStream::connect(harness.addr).await.unwrap();
    let mut buf = [0u8; 1];
    let read = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
        .await
        .unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));
}

#[tokio::test]
async fn test_worker_with_wrong_token_is_rejected() {
    let harness = Harness::start(config()).await;

    let config = WorkerConfig::new(harness.addr.to_string(), b"nope".to_vec()).unwrap();
    let worker = RemoteWorker::new(config, Arc::new(CannedSource::default()));
    let err = worker
        .serve_connection(&CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, RemoteError::AuthRejected));
}

// ─────────────────────── dispatch ───────────────────────

#[tokio::test]
async fn test_dispatch_round_trip() {
    let harness = Harness::start(config()).await;
    harness.spawn_worker(CannedSource::default().with(record("Cremote1", "bob")), 4);
    harness.ready(4).await;

    let got = harness.pool.dispatch("Cremote1").await.unwrap();
    assert_eq!(got, record("Cremote1", "bob"));

    let missing = harness.pool.dispatch("Cmissing").await.unwrap_err();
    assert_eq!(missing, FetchError::NotFound("remote returned empty data".into()));
}

#[tokio::test]
async fn test_empty_username_is_not_found() {
    let harness = Harness::start(config()).await;
    harness.spawn_worker(CannedSource::default().with(record("Cnameless", "")), 2);
    harness.ready(2).await;

    let err = harness.pool.dispatch("Cnameless").await.unwrap_err();
    assert_eq!(err.kind(), FetchErrorKind::NotFound);
}

#[tokio::test]
async fn test_parallel_dispatches_across_streams() {
    let harness = Harness::start(config()).await;
    let mut source = CannedSource::default();
    for i in 0..8 {
        let id = format!("Cpar{i}");
        source = source
            .with(record(&id, &format!("user{i}")))
            .slow(&id, Duration::from_millis(100));
    }
    harness.spawn_worker(source, 8);
    harness.ready(8).await;

    let calls = (0..8).map(|i| {
        let pool = Arc::clone(&harness.pool);
        tokio::spawn(async move { pool.dispatch(&format!("Cpar{i}")).await })
    });
    let results = futures::future::join_all(calls).await;
    for (i, result) in results.into_iter().enumerate() {
        assert_eq!(result.unwrap().unwrap().username, format!("user{i}"));
    }
}

#[tokio::test]
async fn test_acquire_timeout_when_streams_busy() {
    let mut config = config();
    config.acquire_timeout = Duration::from_millis(200);
    let harness = Harness::start(config).await;
    harness.spawn_worker(
        CannedSource::default()
            .with(record("Cbusy", "slowpoke"))
            .slow("Cbusy", Duration::from_secs(1)),
        1,
    );
    harness.ready(1).await;

    let pool = Arc::clone(&harness.pool);
    let first = tokio::spawn(async move { pool.dispatch("Cbusy").await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = harness.pool.dispatch("Cbusy").await.unwrap_err();
    assert_eq!(err.kind(), FetchErrorKind::RemoteUnavailable);
    assert_eq!(first.await.unwrap().unwrap().username, "slowpoke");
}

#[tokio::test]
async fn test_read_timeout_closes_stream_and_worker_replaces_it() {
    let mut config = config();
    config.read_timeout = Duration::from_millis(200);
    config.acquire_timeout = Duration::from_secs(3);
    let harness = Harness::start(config).await;
    harness.spawn_worker(
        CannedSource::default()
            .with(record("Cslow", "late"))
            .with(record("Cfast", "quick"))
            .slow("Cslow", Duration::from_millis(800)),
        1,
    );
    harness.ready(1).await;

    let err = harness.pool.dispatch("Cslow").await.unwrap_err();
    assert_eq!(err.kind(), FetchErrorKind::Transport);

    // The next job waits for the replacement stream and must not receive
    // the late answer for the timed-out request.
    let got = harness.pool.dispatch("Cfast").await.unwrap();
    assert_eq!(got.username, "quick");
}

#[tokio::test]
async fn test_coordinator_falls_back_to_remote() {
    struct Failing;

    #[async_trait]
    impl PostSource for Failing {
        async fn fetch_post(&self, _post_id: &str) -> FetchResult<PostRecord> {
            Err(FetchError::Transport("rate limited".into()))
        }
    }

    let harness = Harness::start(config()).await;
    harness.spawn_worker(CannedSource::default().with(record("Cfallback", "carol")), 2);
    harness.ready(2).await;

    let store = Arc::new(CacheStore::open_in_memory().unwrap());
    let remote: Arc<dyn PostSource> = harness.pool.clone();
    let coordinator = FetchCoordinator::new(
        Arc::clone(&store),
        Arc::new(Failing),
        Some(remote),
        CoordinatorConfig {
            media_host: None,
            ..CoordinatorConfig::default()
        },
    );

    let got = coordinator.resolve("Cfallback").await.unwrap();
    assert_eq!(got.username, "carol");
    assert!(store.get("Cfallback").unwrap().is_some());
}
