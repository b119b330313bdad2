//! Remote workers: fetch posts on other hosts over a multiplexed TCP link.
//!
//! A worker dials the server, proves it knows the shared token, then opens
//! several logical streams on the one connection. The server hands each
//! stream one post id at a time and waits for the encoded record.
//!
//! - [`pool`]: server side (listener, sessions, dispatch).
//! - [`worker`]: client side (dial, authenticate, answer requests).
//! - [`frame`]: the wire framing shared by both.

pub mod frame;
pub mod pool;
pub mod worker;

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub use pool::{RemoteListener, RemotePool, RemoteSession};
pub use worker::{RemoteWorker, WorkerConfig};

/// Longest token the handshake carries.
pub const MAX_TOKEN_LEN: usize = 8;

/// Acknowledgement byte sent by the server after a good token.
const AUTH_OK: u8 = 0x01;

#[derive(thiserror::Error, Debug)]
pub enum RemoteError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Authentication rejected")]
    AuthRejected,

    #[error("Timed out during {0}")]
    Timeout(&'static str),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Server-side tuning for the worker pool.
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    /// Shared secret, at most [`MAX_TOKEN_LEN`] bytes.
    pub token: Vec<u8>,
    /// Time a fresh connection has to present its token.
    pub handshake_timeout: Duration,
    /// Time a dispatch waits for a free stream to claim it.
    pub acquire_timeout: Duration,
    /// Deadline for handing a request frame to the connection.
    pub write_timeout: Duration,
    /// Deadline for the worker's response once the request is sent.
    pub read_timeout: Duration,
    /// Jobs that may wait for a stream at once.
    pub queue_capacity: usize,
}

impl RemoteConfig {
    pub fn new(token: impl Into<Vec<u8>>) -> Result<Self, RemoteError> {
        let token = token.into();
        check_token(&token)?;
        Ok(Self {
            token,
            handshake_timeout: Duration::from_secs(5),
            acquire_timeout: Duration::from_secs(1),
            write_timeout: Duration::from_millis(500),
            read_timeout: Duration::from_secs(5),
            queue_capacity: 1024,
        })
    }
}

pub(crate) fn check_token(token: &[u8]) -> Result<(), RemoteError> {
    if token.is_empty() || token.len() > MAX_TOKEN_LEN {
        return Err(RemoteError::Config(format!(
            "token must be 1 to {MAX_TOKEN_LEN} bytes, got {}",
            token.len()
        )));
    }
    Ok(())
}

/// Worker side of the handshake: send `len | token`, wait for the ack.
pub async fn send_token<S>(stream: &mut S, token: &[u8], deadline: Duration) -> Result<(), RemoteError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    check_token(token)?;
    tokio::time::timeout(deadline, present_token(stream, token))
        .await
        .map_err(|_| RemoteError::Timeout("handshake"))?
}

async fn present_token<S>(stream: &mut S, token: &[u8]) -> Result<(), RemoteError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut msg = Vec::with_capacity(1 + token.len());
    msg.push(token.len() as u8);
    msg.extend_from_slice(token);
    stream.write_all(&msg).await?;
    stream.flush().await?;
    match stream.read_u8().await {
        Ok(AUTH_OK) => Ok(()),
        Ok(_) => Err(RemoteError::AuthRejected),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(RemoteError::AuthRejected),
        Err(e) => Err(e.into()),
    }
}

/// Server side of the handshake. The caller drops the connection on error.
pub async fn accept_token<S>(stream: &mut S, expected: &[u8], deadline: Duration) -> Result<(), RemoteError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    tokio::time::timeout(deadline, verify_token(stream, expected))
        .await
        .map_err(|_| RemoteError::Timeout("handshake"))?
}

async fn verify_token<S>(stream: &mut S, expected: &[u8]) -> Result<(), RemoteError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let len = stream.read_u8().await? as usize;
    if len == 0 || len > MAX_TOKEN_LEN {
        return Err(RemoteError::AuthRejected);
    }
    let mut presented = [0u8; MAX_TOKEN_LEN];
    stream.read_exact(&mut presented[..len]).await?;
    if &presented[..len] != expected {
        return Err(RemoteError::AuthRejected);
    }
    stream.write_all(&[AUTH_OK]).await?;
    stream.flush().await?;
    Ok(())
}
