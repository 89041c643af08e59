//! # Frame Parsing
//!
//! The pool never understands a protocol's framing. It hands inbound bytes to
//! a `FrameParser` and routes each decoded `Frame` by its stream identifier.
//!
//! `LengthDelimited` is a minimal parser for the layout
//! `[stream id: u32 BE][length: u32 BE][payload]`, enough for tools, tests
//! and protocols that have no framing of their own.

use bytes::Buf;
use bytes::BufMut;
use bytes::Bytes;
use bytes::BytesMut;

use crate::error::Error;
use crate::error::Result;

/// One demultiplexed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub stream_id: u32,
    pub payload: Bytes,
}

/// Extracts frames from the bytes read off a physical connection.
pub trait FrameParser: Send + 'static {
    /// Decodes the next frame from the front of `buf`.
    ///
    /// # invariants
    /// - Returns `Ok(None)` and leaves `buf` untouched when more bytes are needed.
    /// - Consumes exactly the bytes of the returned frame.
    /// - Returns `Err` only for bytes that can never form a valid frame.
    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>>;
}

/// Builds one parser per physical session, since parsers may hold state.
pub trait FrameParserBuilder: Send + Sync + 'static {
    fn build(&self) -> Box<dyn FrameParser>;
}

impl<F> FrameParserBuilder for F
where
    F: Fn() -> Box<dyn FrameParser> + Send + Sync + 'static,
{
    fn build(&self) -> Box<dyn FrameParser> {
        self()
    }
}

const HEADER_LEN: usize = 8;

/// Frames larger than this are rejected unless configured otherwise.
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy)]
pub struct LengthDelimited {
    max_frame_len: usize,
}

impl LengthDelimited {
    pub fn new() -> Self {
        Self {
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }

    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }
}

impl Default for LengthDelimited {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameParser for LengthDelimited {
    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>> {
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let mut header = &buf[..HEADER_LEN];
        let stream_id = header.get_u32();
        let len = header.get_u32() as usize;
        if len > self.max_frame_len {
            return Err(Error::Protocol(format!(
                "frame of {} bytes exceeds limit of {}",
                len, self.max_frame_len
            )));
        }

        if buf.len() < HEADER_LEN + len {
            buf.reserve(HEADER_LEN + len - buf.len());
            return Ok(None);
        }

        buf.advance(HEADER_LEN);
        let payload = buf.split_to(len).freeze();
        Ok(Some(Frame { stream_id, payload }))
    }
}

impl FrameParserBuilder for LengthDelimited {
    fn build(&self) -> Box<dyn FrameParser> {
        Box::new(*self)
    }
}

/// Encodes `payload` in the `LengthDelimited` layout.
pub fn encode_frame(stream_id: u32, payload: &[u8]) -> Result<Bytes> {
    let len = u32::try_from(payload.len())
        .map_err(|_| Error::Protocol(format!("payload of {} bytes is too large", payload.len())))?;
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u32(stream_id);
    buf.put_u32(len);
    buf.put_slice(payload);
    Ok(buf.freeze())
}
