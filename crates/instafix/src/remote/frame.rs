//! Multiplexed frames carried over one authenticated TCP connection.
//!
//! Each frame travels inside a length-delimited envelope (u32 big-endian
//! length, from `LengthDelimitedCodec`) and starts with a one byte kind and a
//! u32 big-endian stream id:
//!
//! ```text
//! | kind (u8) | stream id (u32) | payload ... |
//! ```
//!
//! - `Open` (worker to server): a new logical stream is ready for work.
//! - `Request` (server to worker): payload is the post id.
//! - `Response` (worker to server): payload is an encoded record, or empty
//!   when the worker could not fetch the post.
//! - `Close` (either way): the stream is done; the worker may open another.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use super::RemoteError;

/// kind + stream id
pub const FRAME_HEADER_LEN: usize = 5;

/// Largest payload accepted on either side.
pub const MAX_PAYLOAD: usize = 1024 * 1024;

pub type StreamId = u32;

pub type FramedConnection = Framed<TcpStream, LengthDelimitedCodec>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Open = 1,
    Request = 2,
    Response = 3,
    Close = 4,
}

impl TryFrom<u8> for FrameKind {
    type Error = RemoteError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(FrameKind::Open),
            2 => Ok(FrameKind::Request),
            3 => Ok(FrameKind::Response),
            4 => Ok(FrameKind::Close),
            other => Err(RemoteError::Protocol(format!("unknown frame kind {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub stream_id: StreamId,
    pub payload: Bytes,
}

impl Frame {
    pub fn open(stream_id: StreamId) -> Self {
        Self::new(FrameKind::Open, stream_id, Bytes::new())
    }

    pub fn request(stream_id: StreamId, post_id: &str) -> Self {
        Self::new(
            FrameKind::Request,
            stream_id,
            Bytes::copy_from_slice(post_id.as_bytes()),
        )
    }

    pub fn response(stream_id: StreamId, payload: Bytes) -> Self {
        Self::new(FrameKind::Response, stream_id, payload)
    }

    pub fn close(stream_id: StreamId) -> Self {
        Self::new(FrameKind::Close, stream_id, Bytes::new())
    }

    fn new(kind: FrameKind, stream_id: StreamId, payload: Bytes) -> Self {
        Self {
            kind,
            stream_id,
            payload,
        }
    }

    /// Serialize into the body of one length-delimited envelope.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + self.payload.len());
        buf.put_u8(self.kind as u8);
        buf.put_u32(self.stream_id);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Parse the body of one envelope.
    pub fn decode(mut buf: Bytes) -> Result<Self, RemoteError> {
        if buf.len() < FRAME_HEADER_LEN {
            return Err(RemoteError::Protocol(format!(
                "frame of {} bytes is shorter than its header",
                buf.len()
            )));
        }
        let kind = FrameKind::try_from(buf.get_u8())?;
        let stream_id = buf.get_u32();
        Ok(Self::new(kind, stream_id, buf))
    }
}

/// Codec for the envelope layer.
pub fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .max_frame_length(FRAME_HEADER_LEN + MAX_PAYLOAD)
        .new_codec()
}

pub fn framed(stream: TcpStream) -> FramedConnection {
    Framed::new(stream, codec())
}
