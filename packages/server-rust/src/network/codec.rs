//! Length-prefixed message framing.
//!
//! Every frame is a big-endian `u32` payload length followed by the payload.
//! Payloads are opaque to the server. An inbound frame that exceeds the
//! configured maximum is skipped byte-for-byte and surfaced as
//! [`Frame::Oversized`], so one bad message does not desynchronize or close
//! the connection.

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Default upper bound on a single payload (8 MiB).
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 8 * 1024 * 1024;

const HEADER_LEN: usize = 4;

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A complete message payload.
    Message(Bytes),
    /// A frame larger than the limit whose payload was discarded.
    Oversized { length: usize },
}

#[derive(Debug, Clone, Copy)]
struct Discard {
    length: usize,
    remaining: usize,
}

/// Codec for length-prefixed frames.
#[derive(Debug, Clone)]
pub struct MessageCodec {
    max_frame_length: usize,
    discard: Option<Discard>,
}

impl MessageCodec {
    /// Creates a codec accepting payloads up to `max_frame_length` bytes.
    #[must_use]
    pub fn new(max_frame_length: usize) -> Self {
        Self {
            max_frame_length,
            discard: None,
        }
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LENGTH)
    }
}

impl Decoder for MessageCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, io::Error> {
        if let Some(discard) = self.discard.as_mut() {
            let skipped = discard.remaining.min(src.len());
            src.advance(skipped);
            discard.remaining -= skipped;
            if discard.remaining > 0 {
                return Ok(None);
            }
            let length = discard.length;
            self.discard = None;
            return Ok(Some(Frame::Oversized { length }));
        }

        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&src[..HEADER_LEN]);
        let length = u32::from_be_bytes(header) as usize;

        if length > self.max_frame_length {
            src.advance(HEADER_LEN);
            self.discard = Some(Discard {
                length,
                remaining: length,
            });
            return self.decode(src);
        }

        let frame_len = HEADER_LEN + length;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }
        src.advance(HEADER_LEN);
        Ok(Some(Frame::Message(src.split_to(length).freeze())))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, io::Error> {
        match self.decode(buf)? {
            Some(frame) => Ok(Some(frame)),
            None if buf.is_empty() && self.discard.is_none() => Ok(None),
            None => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "stream ended in the middle of a frame",
            )),
        }
    }
}

impl Encoder<Bytes> for MessageCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), io::Error> {
        if item.len() > self.max_frame_length {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "message of {} bytes exceeds the frame limit of {} bytes",
                    item.len(),
                    self.max_frame_length
                ),
            ));
        }
        let length = u32::try_from(item.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "message too large"))?;
        dst.reserve(HEADER_LEN + item.len());
        dst.put_u32(length);
        dst.extend_from_slice(&item);
        Ok(())
    }
}
