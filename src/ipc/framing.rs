//! Length-prefixed message framing for the engine byte stream.
//!
//! The engine speaks a self-delimiting binary framing over its pipes and
//! socket. Every frame starts with a one-byte tag and a big-endian `u64`
//! body length, so an incomplete frame is always detectable without
//! over-reading.
//!
//! # Wire Format
//!
//! ```text
//! +---------+----------------------+----------------------+
//! | tag: u8 | length: u64 (BE)     | body: length bytes   |
//! +---------+----------------------+----------------------+
//! ```
//!
//! Bodies are UTF-8 JSON. [`FrameDecoder`] is pure and does no I/O; the
//! transports feed it whatever chunks the OS hands back.

use serde::Serialize;

use crate::ipc::error::{FrameError, RpcError};
use crate::models::{Event, Inbound, Request, Response};

/// Maximum frame body size (100MB) to prevent OOM from a broken engine.
pub const MAX_FRAME_SIZE: usize = 100 * 1024 * 1024;

/// Size of the tag + length prefix.
pub const FRAME_HEADER_LEN: usize = 1 + std::mem::size_of::<u64>();

/// Frame tag identifying the body shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameTag {
    Request = 0x01,
    Response = 0x02,
    Event = 0x03,
}

impl FrameTag {
    pub fn parse(byte: u8) -> Result<Self, FrameError> {
        match byte {
            0x01 => Ok(FrameTag::Request),
            0x02 => Ok(FrameTag::Response),
            0x03 => Ok(FrameTag::Event),
            other => Err(FrameError::UnknownTag(other)),
        }
    }
}

/// One complete frame extracted from the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub tag: FrameTag,
    pub body: Vec<u8>,
}

impl Frame {
    /// Parse an inbound frame body.
    ///
    /// A malformed body is a recoverable error: the frame boundary is known,
    /// so the caller can drop this frame and keep decoding.
    pub fn into_inbound(self) -> Result<Inbound, RpcError> {
        match self.tag {
            FrameTag::Response => serde_json::from_slice::<Response>(&self.body)
                .map(Inbound::Response)
                .map_err(|e| RpcError::Protocol(format!("Invalid response body: {}", e))),
            FrameTag::Event => serde_json::from_slice::<Event>(&self.body)
                .map(Inbound::Event)
                .map_err(|e| RpcError::Protocol(format!("Invalid event body: {}", e))),
            FrameTag::Request => Err(RpcError::Protocol(
                "Engine sent a request frame to the client".to_string(),
            )),
        }
    }

    /// Parse a request frame body (engine side).
    pub fn into_request(self) -> Result<Request, RpcError> {
        match self.tag {
            FrameTag::Request => serde_json::from_slice(&self.body)
                .map_err(|e| RpcError::Protocol(format!("Invalid request body: {}", e))),
            other => Err(RpcError::Protocol(format!(
                "Expected request frame, got {:?}",
                other
            ))),
        }
    }
}

/// Try to decode one frame from the front of `buf`.
///
/// Returns `Ok(None)` when `buf` holds an incomplete frame, or the frame and
/// the number of bytes it occupied.
pub fn decode_frame(buf: &[u8]) -> Result<Option<(Frame, usize)>, FrameError> {
    let Some(&tag_byte) = buf.first() else {
        return Ok(None);
    };
    // Validate the tag before waiting on the length so garbage is caught early.
    let tag = FrameTag::parse(tag_byte)?;

    if buf.len() < FRAME_HEADER_LEN {
        return Ok(None);
    }

    let mut length_bytes = [0u8; 8];
    length_bytes.copy_from_slice(&buf[1..FRAME_HEADER_LEN]);
    let length = u64::from_be_bytes(length_bytes);

    if length > MAX_FRAME_SIZE as u64 {
        return Err(FrameError::Oversized {
            length,
            max: MAX_FRAME_SIZE,
        });
    }

    let end = FRAME_HEADER_LEN + length as usize;
    if buf.len() < end {
        return Ok(None);
    }

    let frame = Frame {
        tag,
        body: buf[FRAME_HEADER_LEN..end].to_vec(),
    };
    Ok(Some((frame, end)))
}

/// Incremental frame decoder over an append-only buffer.
///
/// After every decode attempt the buffer holds exactly the unconsumed tail.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `chunk` and lazily yield every complete frame now available.
    ///
    /// Frames not pulled from the iterator stay buffered and are yielded by
    /// the next call. After a [`FrameError`] the buffer is discarded, since
    /// the stream position can no longer be trusted.
    pub fn feed(&mut self, chunk: &[u8]) -> Frames<'_> {
        self.buffer.extend_from_slice(chunk);
        Frames {
            decoder: self,
            failed: false,
        }
    }

    /// Number of bytes held back waiting for more data.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Drop any partial frame, e.g. when the transport is replaced.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }
}

/// Lazy sequence of frames returned by [`FrameDecoder::feed`].
pub struct Frames<'a> {
    decoder: &'a mut FrameDecoder,
    failed: bool,
}

impl Iterator for Frames<'_> {
    type Item = Result<Frame, FrameError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }

        match decode_frame(&self.decoder.buffer) {
            Ok(Some((frame, consumed))) => {
                self.decoder.buffer.drain(..consumed);
                Some(Ok(frame))
            }
            Ok(None) => None,
            Err(e) => {
                self.failed = true;
                self.decoder.buffer.clear();
                Some(Err(e))
            }
        }
    }
}

/// Encode a frame with the given tag and raw body.
pub fn encode_frame(tag: FrameTag, body: &[u8]) -> Vec<u8> {
    let mut encoded = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
    encoded.push(tag as u8);
    encoded.extend_from_slice(&(body.len() as u64).to_be_bytes());
    encoded.extend_from_slice(body);
    encoded
}

fn encode_json<T: Serialize>(tag: FrameTag, value: &T) -> Result<Vec<u8>, serde_json::Error> {
    let body = serde_json::to_vec(value)?;
    Ok(encode_frame(tag, &body))
}

/// Encode a client request.
pub fn encode_request(request: &Request) -> Result<Vec<u8>, serde_json::Error> {
    encode_json(FrameTag::Request, request)
}

/// Encode an engine response.
pub fn encode_response(response: &Response) -> Result<Vec<u8>, serde_json::Error> {
    encode_json(FrameTag::Response, response)
}

/// Encode an engine push event.
pub fn encode_event(event: &Event) -> Result<Vec<u8>, serde_json::Error> {
    encode_json(FrameTag::Event, event)
}
