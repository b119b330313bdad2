//! Worker side of the remote link: dial the server and answer its requests
//! with local fetches.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::frame::{self, Frame, FrameKind, StreamId, MAX_PAYLOAD};
use super::{check_token, send_token, RemoteError};
use crate::codec;
use crate::coordinator::PostSource;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// `host:port` of the server's worker listener.
    pub server_addr: String,
    pub token: Vec<u8>,
    /// Logical streams opened per connection.
    pub streams: u32,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    /// Pause between reconnect attempts.
    pub reconnect_delay: Duration,
}

impl WorkerConfig {
    pub fn new(server_addr: impl Into<String>, token: impl Into<Vec<u8>>) -> Result<Self, RemoteError> {
        let token = token.into();
        check_token(&token)?;
        Ok(Self {
            server_addr: server_addr.into(),
            token,
            streams: 8,
            connect_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(5),
            reconnect_delay: Duration::from_secs(5),
        })
    }
}

pub struct RemoteWorker {
    config: WorkerConfig,
    source: Arc<dyn PostSource>,
}

impl RemoteWorker {
    pub fn new(config: WorkerConfig, source: Arc<dyn PostSource>) -> Self {
        Self { config, source }
    }

    /// Serve connections until `shutdown` fires, reconnecting after failures.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), RemoteError> {
        loop {
            match self.serve_connection(&shutdown).await {
                Ok(()) if shutdown.is_cancelled() => return Ok(()),
                Ok(()) => info!(server = %self.config.server_addr, "server closed the connection"),
                Err(RemoteError::AuthRejected) => {
                    warn!(server = %self.config.server_addr, "server rejected the worker token");
                }
                Err(e) => warn!(server = %self.config.server_addr, error = %e, "worker connection failed"),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
                _ = shutdown.cancelled() => return Ok(()),
            }
        }
    }

    /// Dial, authenticate and serve one connection until it closes.
    pub async fn serve_connection(&self, shutdown: &CancellationToken) -> Result<(), RemoteError> {
        let mut stream = timeout(
            self.config.connect_timeout,
            TcpStream::connect(&self.config.server_addr),
        )
        .await
        .map_err(|_| RemoteError::Timeout("connect"))??;
        let _ = stream.set_nodelay(true);
        send_token(&mut stream, &self.config.token, self.config.handshake_timeout).await?;
        info!(server = %self.config.server_addr, streams = self.config.streams, "connected to server");

        let (mut sink, mut frames) = frame::framed(stream).split::<Bytes>();
        for id in 0..self.config.streams {
            sink.feed(Frame::open(id).encode()).await?;
        }
        sink.flush().await?;
        let mut next_stream: StreamId = self.config.streams;

        let (out_tx, mut out_rx) = mpsc::channel::<Frame>(64);
        let writer = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                sink.send(frame.encode()).await?;
            }
            Ok::<(), std::io::Error>(())
        });

        let result = loop {
            let next = tokio::select! {
                next = frames.next() => next,
                _ = shutdown.cancelled() => break Ok(()),
            };
            let frame = match next {
                Some(Ok(buf)) => match Frame::decode(buf.freeze()) {
                    Ok(frame) => frame,
                    Err(e) => break Err(e),
                },
                Some(Err(e)) => break Err(RemoteError::Io(e)),
                None => break Ok(()),
            };

            match frame.kind {
                FrameKind::Request => {
                    let post_id = String::from_utf8_lossy(&frame.payload).into_owned();
                    tokio::spawn(answer(
                        frame.stream_id,
                        post_id,
                        Arc::clone(&self.source),
                        out_tx.clone(),
                    ));
                }
                FrameKind::Close => {
                    // The server gave up on that stream; replace it.
                    debug!(stream = frame.stream_id, replacement = next_stream, "stream closed by server");
                    if out_tx.send(Frame::open(next_stream)).await.is_err() {
                        break Err(RemoteError::Protocol("connection writer stopped".into()));
                    }
                    next_stream = next_stream.wrapping_add(1);
                }
                FrameKind::Open | FrameKind::Response => {
                    debug!(stream = frame.stream_id, kind = ?frame.kind, "ignoring unexpected frame");
                }
            }
        };

        writer.abort();
        result
    }
}

async fn answer(
    stream_id: StreamId,
    post_id: String,
    source: Arc<dyn PostSource>,
    out: mpsc::Sender<Frame>,
) {
    let payload = match source.fetch_post(&post_id).await {
        Ok(record) => match codec::encode(&record) {
            Ok(encoded) if encoded.len() <= MAX_PAYLOAD => Bytes::from(encoded),
            Ok(encoded) => {
                warn!(post_id, bytes = encoded.len(), "record too large for one frame");
                Bytes::new()
            }
            Err(e) => {
                warn!(post_id, error = %e, "failed to encode record");
                Bytes::new()
            }
        },
        Err(e) => {
            info!(post_id, error = %e, "remote request failed locally");
            Bytes::new()
        }
    };
    let _ = out.send(Frame::response(stream_id, payload)).await;
}
