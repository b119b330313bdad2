//! Server side of the remote worker link.
//!
//! [`RemoteListener`] accepts worker connections and runs one session per
//! connection. Every stream a worker opens becomes a task that pulls jobs
//! from the pool's shared queue, so any idle stream on any session can take
//! the next job. [`RemotePool::dispatch`] enqueues a job and waits, with
//! deadlines, first for a stream to claim it and then for the response.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::frame::{self, Frame, FrameKind, StreamId};
use super::{accept_token, RemoteConfig, RemoteError};
use crate::codec;
use crate::coordinator::PostSource;
use crate::types::{FetchError, FetchResult, PostRecord};

/// Frames queued towards one worker connection.
const OUTBOUND_CAPACITY: usize = 64;

struct Job {
    post_id: String,
    claimed: oneshot::Sender<()>,
    reply: oneshot::Sender<FetchResult<PostRecord>>,
}

/// Live counters for one connected worker.
struct SessionState {
    peer: SocketAddr,
    connected_at: DateTime<Utc>,
    open_streams: AtomicUsize,
    in_flight: AtomicUsize,
}

/// Snapshot of a connected worker.
#[derive(Debug, Clone, Serialize)]
pub struct RemoteSession {
    pub id: u64,
    pub peer: SocketAddr,
    pub connected_at: DateTime<Utc>,
    pub open_streams: usize,
    pub in_flight: usize,
}

/// Shared job queue and registry of connected workers.
pub struct RemotePool {
    config: RemoteConfig,
    jobs_tx: mpsc::Sender<Job>,
    jobs_rx: Mutex<mpsc::Receiver<Job>>,
    sessions: DashMap<u64, Arc<SessionState>>,
    next_session: AtomicU64,
}

impl RemotePool {
    pub fn new(config: RemoteConfig) -> Arc<Self> {
        let (jobs_tx, jobs_rx) = mpsc::channel(config.queue_capacity.max(1));
        Arc::new(Self {
            config,
            jobs_tx,
            jobs_rx: Mutex::new(jobs_rx),
            sessions: DashMap::new(),
            next_session: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &RemoteConfig {
        &self.config
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn sessions(&self) -> Vec<RemoteSession> {
        let mut sessions: Vec<RemoteSession> = self
            .sessions
            .iter()
            .map(|entry| {
                let state = entry.value();
                RemoteSession {
                    id: *entry.key(),
                    peer: state.peer,
                    connected_at: state.connected_at,
                    open_streams: state.open_streams.load(Ordering::Relaxed),
                    in_flight: state.in_flight.load(Ordering::Relaxed),
                }
            })
            .collect();
        sessions.sort_by_key(|s| s.id);
        sessions
    }

    /// Fetch a post through any connected worker.
    pub async fn dispatch(&self, post_id: &str) -> FetchResult<PostRecord> {
        if self.sessions.is_empty() {
            return Err(FetchError::RemoteUnavailable(
                "no remote workers available".to_string(),
            ));
        }

        let (claimed_tx, claimed_rx) = oneshot::channel();
        let (reply_tx, reply_rx) = oneshot::channel();
        let job = Job {
            post_id: post_id.to_string(),
            claimed: claimed_tx,
            reply: reply_tx,
        };

        let acquire = self.config.acquire_timeout;
        let claimed = timeout(acquire, async {
            self.jobs_tx.send(job).await.map_err(|_| ())?;
            claimed_rx.await.map_err(|_| ())
        })
        .await;
        match claimed {
            Ok(Ok(())) => {}
            Ok(Err(())) => {
                return Err(FetchError::RemoteUnavailable(
                    "remote pool dropped the job".to_string(),
                ))
            }
            Err(_) => {
                // The queued job stays behind; its stream will see the
                // closed claim channel and skip it.
                return Err(FetchError::RemoteUnavailable(format!(
                    "no remote stream free within {acquire:?}"
                )));
            }
        }

        // The stream enforces its own write and read deadlines; this bound
        // only guards against a stream task dying without replying.
        let round_trip = self.config.write_timeout + self.config.read_timeout + Duration::from_secs(1);
        match timeout(round_trip, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(FetchError::Transport(
                "remote stream ended without a reply".to_string(),
            )),
            Err(_) => Err(FetchError::Transport(format!(
                "remote round trip exceeded {round_trip:?}"
            ))),
        }
    }

    fn register(&self, peer: SocketAddr) -> (u64, Arc<SessionState>) {
        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        let state = Arc::new(SessionState {
            peer,
            connected_at: Utc::now(),
            open_streams: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
        });
        self.sessions.insert(id, Arc::clone(&state));
        (id, state)
    }

    fn unregister(&self, id: u64) {
        self.sessions.remove(&id);
    }

    async fn next_job(&self) -> Option<Job> {
        self.jobs_rx.lock().await.recv().await
    }
}

#[async_trait]
impl PostSource for RemotePool {
    async fn fetch_post(&self, post_id: &str) -> FetchResult<PostRecord> {
        self.dispatch(post_id).await
    }
}

/// Accepts worker connections for a [`RemotePool`].
pub struct RemoteListener {
    listener: TcpListener,
    pool: Arc<RemotePool>,
}

impl RemoteListener {
    pub async fn bind(addr: &str, pool: Arc<RemotePool>) -> Result<Self, RemoteError> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, pool })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, RemoteError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` fires. Sessions are cancelled
    /// along with it.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), RemoteError> {
        info!(addr = %self.local_addr()?, "remote worker listener started");
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let pool = Arc::clone(&self.pool);
                        tokio::spawn(handle_connection(stream, peer, pool, shutdown.child_token()));
                    }
                    Err(e) => error!("accept error: {e}"),
                },
                _ = shutdown.cancelled() => {
                    info!("remote worker listener stopped");
                    return Ok(());
                }
            }
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    pool: Arc<RemotePool>,
    shutdown: CancellationToken,
) {
    let _ = stream.set_nodelay(true);
    if let Err(e) = accept_token(&mut stream, &pool.config.token, pool.config.handshake_timeout).await {
        warn!(%peer, error = %e, "rejected remote worker");
        return;
    }

    let (id, state) = pool.register(peer);
    info!(session = id, %peer, "remote worker connected");
    let result = run_session(stream, Arc::clone(&pool), state, shutdown).await;
    pool.unregister(id);
    match result {
        Ok(()) => info!(session = id, %peer, "remote worker disconnected"),
        Err(e) => warn!(session = id, %peer, error = %e, "remote session ended"),
    }
}

async fn run_session(
    stream: TcpStream,
    pool: Arc<RemotePool>,
    state: Arc<SessionState>,
    shutdown: CancellationToken,
) -> Result<(), RemoteError> {
    let (mut sink, mut frames) = frame::framed(stream).split::<Bytes>();
    let (out_tx, mut out_rx) = mpsc::channel::<Frame>(OUTBOUND_CAPACITY);

    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            sink.send(frame.encode()).await?;
        }
        Ok::<(), std::io::Error>(())
    });

    // Stream tasks live as long as the session.
    let streams = shutdown.child_token();
    let mut inboxes: HashMap<StreamId, mpsc::Sender<Bytes>> = HashMap::new();

    let result = loop {
        let next = tokio::select! {
            next = frames.next() => next,
            _ = shutdown.cancelled() => break Ok(()),
        };
        let buf = match next {
            Some(Ok(buf)) => buf,
            Some(Err(e)) => break Err(RemoteError::Io(e)),
            None => break Ok(()),
        };
        let frame = match Frame::decode(buf.freeze()) {
            Ok(frame) => frame,
            Err(e) => break Err(e),
        };

        match frame.kind {
            FrameKind::Open => {
                inboxes.retain(|_, inbox| !inbox.is_closed());
                if inboxes.contains_key(&frame.stream_id) {
                    warn!(stream = frame.stream_id, "duplicate stream open ignored");
                    continue;
                }
                let (inbox_tx, inbox_rx) = mpsc::channel(1);
                inboxes.insert(frame.stream_id, inbox_tx);
                tokio::spawn(serve_stream(
                    frame.stream_id,
                    inbox_rx,
                    out_tx.clone(),
                    Arc::clone(&pool),
                    Arc::clone(&state),
                    streams.clone(),
                ));
            }
            FrameKind::Response => match inboxes.get(&frame.stream_id) {
                Some(inbox) => {
                    if inbox.try_send(frame.payload).is_err() {
                        debug!(stream = frame.stream_id, "unexpected response dropped");
                    }
                }
                None => debug!(stream = frame.stream_id, "response for unknown stream"),
            },
            FrameKind::Close => {
                inboxes.remove(&frame.stream_id);
            }
            FrameKind::Request => {
                warn!(stream = frame.stream_id, "worker sent a request frame");
            }
        }
    };

    streams.cancel();
    drop(inboxes);
    writer.abort();
    result
}

/// One logical stream: claim a job, send it, wait for the answer, repeat.
async fn serve_stream(
    stream_id: StreamId,
    mut inbox: mpsc::Receiver<Bytes>,
    out: mpsc::Sender<Frame>,
    pool: Arc<RemotePool>,
    state: Arc<SessionState>,
    cancel: CancellationToken,
) {
    state.open_streams.fetch_add(1, Ordering::Relaxed);
    loop {
        let job = tokio::select! {
            job = pool.next_job() => match job {
                Some(job) => job,
                None => break,
            },
            _ = cancel.cancelled() => break,
        };
        if job.claimed.send(()).is_err() {
            debug!(post_id = %job.post_id, "dispatcher gave up before claim, skipping");
            continue;
        }

        state.in_flight.fetch_add(1, Ordering::Relaxed);
        let outcome = exchange(stream_id, &job.post_id, &mut inbox, &out, &pool.config).await;
        state.in_flight.fetch_sub(1, Ordering::Relaxed);

        match outcome {
            Exchange::Answered(result) => {
                let _ = job.reply.send(result);
            }
            Exchange::Broken(err) => {
                warn!(stream = stream_id, post_id = %job.post_id, error = %err, "closing remote stream");
                let _ = job.reply.send(Err(err));
                send_close(stream_id, &out, pool.config.write_timeout).await;
                break;
            }
        }
    }
    state.open_streams.fetch_sub(1, Ordering::Relaxed);
}

enum Exchange {
    /// The worker replied; the stream can take more work.
    Answered(FetchResult<PostRecord>),
    /// Deadline missed or session gone; the stream must not be reused.
    Broken(FetchError),
}

async fn exchange(
    stream_id: StreamId,
    post_id: &str,
    inbox: &mut mpsc::Receiver<Bytes>,
    out: &mpsc::Sender<Frame>,
    config: &RemoteConfig,
) -> Exchange {
    match timeout(config.write_timeout, out.send(Frame::request(stream_id, post_id))).await {
        Ok(Ok(())) => {}
        Ok(Err(_)) => return Exchange::Broken(FetchError::Transport("remote session closed".into())),
        Err(_) => return Exchange::Broken(FetchError::Transport("remote write timed out".into())),
    }

    let payload = match timeout(config.read_timeout, inbox.recv()).await {
        Ok(Some(payload)) => payload,
        Ok(None) => return Exchange::Broken(FetchError::Transport("remote session closed".into())),
        Err(_) => {
            return Exchange::Broken(FetchError::Transport(format!(
                "remote response for {post_id} timed out"
            )))
        }
    };

    Exchange::Answered(decode_response(post_id, &payload))
}

/// Tell the worker a stream is finished so it opens a replacement.
/// Returns false when the frame could not be queued in time.
async fn send_close(stream_id: StreamId, out: &mpsc::Sender<Frame>, wait: Duration) -> bool {
    match timeout(wait, out.send(Frame::close(stream_id))).await {
        Ok(Ok(())) => true,
        Ok(Err(_)) => {
            debug!(stream = stream_id, "session gone before close frame");
            false
        }
        Err(_) => {
            warn!(stream = stream_id, "close frame not sent, session loses a stream");
            false
        }
    }
}

fn decode_response(post_id: &str, payload: &[u8]) -> FetchResult<PostRecord> {
    if payload.is_empty() {
        return Err(FetchError::NotFound("remote returned empty data".to_string()));
    }
    let mut record = codec::decode(payload)
        .map_err(|e| FetchError::Parse(format!("remote record for {post_id}: {e}")))?;
    if record.username.is_empty() {
        return Err(FetchError::NotFound("remote returned empty data".to_string()));
    }
    record.post_id = post_id.to_string();
    Ok(record)
}
