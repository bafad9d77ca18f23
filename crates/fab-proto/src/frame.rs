//! Tagged frame codec.
//!
//! Sessions exchange text frames (JSON) and binary frames (tar streams,
//! file chunks) over one duplex connection. Each frame is a tag byte, a
//! 32-bit big-endian length, and the payload. Frame length is validated
//! before allocation.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Decoder, Encoder, Framed};

use crate::error::ProtoError;

/// Any duplex byte stream a framed session can run over.
pub trait AsyncDuplex: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncDuplex for T {}

/// A type-erased framed session channel.
pub type FramedChannel = Framed<Box<dyn AsyncDuplex>, FrameCodec>;

/// Wrap a concrete stream into a [`FramedChannel`].
pub fn framed<S: AsyncDuplex + 'static>(stream: S, codec: FrameCodec) -> FramedChannel {
    Framed::new(Box::new(stream) as Box<dyn AsyncDuplex>, codec)
}

/// Default frame size cap: large enough for a buffered source archive.
pub const DEFAULT_MAX_FRAME: usize = 128 * 1024 * 1024;

const TAG_TEXT: u8 = 0;
const TAG_BINARY: u8 = 1;
const HEADER_LEN: usize = 5;

/// One protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
}

impl Frame {
    pub fn text(s: impl Into<String>) -> Self {
        Frame::Text(s.into())
    }

    pub fn binary(b: impl Into<Bytes>) -> Self {
        Frame::Binary(b.into())
    }

    /// The empty binary frame, used as an end-of-stream marker in file
    /// transfers.
    pub fn end_of_stream() -> Self {
        Frame::Binary(Bytes::new())
    }

    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, Frame::Binary(b) if b.is_empty())
    }
}

/// Codec for [`Frame`]s, usable with `tokio_util::codec::Framed`.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame: usize,
}

impl FrameCodec {
    pub fn new() -> Self {
        FrameCodec {
            max_frame: DEFAULT_MAX_FRAME,
        }
    }

    pub fn with_max_frame(max_frame: usize) -> Self {
        FrameCodec { max_frame }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtoError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, ProtoError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let tag = src[0];
        let len = u32::from_be_bytes([src[1], src[2], src[3], src[4]]) as usize;
        if len > self.max_frame {
            return Err(ProtoError::FrameTooLarge {
                len,
                max: self.max_frame,
            });
        }
        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(len).freeze();
        match tag {
            TAG_TEXT => {
                let text = String::from_utf8(payload.to_vec())
                    .map_err(|e| ProtoError::Io(std::io::Error::other(e)))?;
                Ok(Some(Frame::Text(text)))
            }
            TAG_BINARY => Ok(Some(Frame::Binary(payload))),
            other => Err(ProtoError::BadFrameTag(other)),
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtoError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), ProtoError> {
        let (tag, payload) = match frame {
            Frame::Text(s) => (TAG_TEXT, Bytes::from(s)),
            Frame::Binary(b) => (TAG_BINARY, b),
        };
        if payload.len() > self.max_frame {
            return Err(ProtoError::FrameTooLarge {
                len: payload.len(),
                max: self.max_frame,
            });
        }
        dst.reserve(HEADER_LEN + payload.len());
        dst.put_u8(tag);
        dst.put_u32(payload.len() as u32);
        dst.put_slice(&payload);
        Ok(())
    }
}
