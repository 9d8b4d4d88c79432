//! Spindle wire format: length-prefixed JSON frames.
//!
//! Every frame on a spindle stream is
//!
//!   [u32 big-endian length][length bytes of UTF-8 JSON]
//!
//! repeated back to back with no separator. The length counts payload bytes
//! only. A zero-length frame carries nothing; decoders skip it. Changing the
//! prefix width or byte order is a breaking change for every tier at once.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::envelope::Envelope;

// ── Constants ─────────────────────────────────────────────────────────────────

/// Width of the length prefix in bytes.
pub const LENGTH_PREFIX: usize = 4;

/// Default ceiling for a single frame payload (16 MiB).
pub const DEFAULT_MAX_FRAME: usize = 16 * 1024 * 1024;

// ── Encoding ──────────────────────────────────────────────────────────────────

/// Prefix `payload` with its big-endian length.
pub fn encode_frame(payload: &[u8], max_frame: usize) -> Result<Bytes, WireError> {
    if payload.len() > max_frame || payload.len() > u32::MAX as usize {
        return Err(WireError::FrameTooLarge {
            len: payload.len(),
            max: max_frame,
        });
    }
    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Serialize an envelope and frame it in one step.
pub fn encode_envelope(envelope: &Envelope, max_frame: usize) -> Result<Bytes, WireError> {
    let json = serde_json::to_vec(envelope).map_err(|e| WireError::Encode(e.to_string()))?;
    encode_frame(&json, max_frame)
}

// ── Decoding ──────────────────────────────────────────────────────────────────

/// Incremental frame decoder.
///
/// Bytes arrive in arbitrary pieces; callers append them to a `BytesMut`
/// and call [`FrameDecoder::decode`] until it returns `Ok(None)`. A frame is
/// never yielded until all of its payload bytes are buffered.
#[derive(Debug)]
pub struct FrameDecoder {
    max_frame: usize,
    empty_frames: u64,
}

impl FrameDecoder {
    pub fn new(max_frame: usize) -> Self {
        Self {
            max_frame,
            empty_frames: 0,
        }
    }

    /// Pull the next complete payload out of `buf`.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, WireError> {
        loop {
            if buf.len() < LENGTH_PREFIX {
                return Ok(None);
            }
            let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
            if len > self.max_frame {
                return Err(WireError::FrameTooLarge {
                    len,
                    max: self.max_frame,
                });
            }
            if len == 0 {
                buf.advance(LENGTH_PREFIX);
                self.empty_frames += 1;
                continue;
            }
            let needed = LENGTH_PREFIX + len;
            if buf.len() < needed {
                buf.reserve(needed - buf.len());
                return Ok(None);
            }
            buf.advance(LENGTH_PREFIX);
            return Ok(Some(buf.split_to(len).freeze()));
        }
    }

    /// Decode the next frame and parse it as an [`Envelope`].
    pub fn decode_envelope(&mut self, buf: &mut BytesMut) -> Result<Option<Envelope>, WireError> {
        match self.decode(buf)? {
            Some(frame) => serde_json::from_slice(&frame)
                .map(Some)
                .map_err(|e| WireError::Malformed(e.to_string())),
            None => Ok(None),
        }
    }

    /// Number of zero-length frames skipped so far.
    pub fn empty_frames(&self) -> u64 {
        self.empty_frames
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME)
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when framing or parsing stream data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("frame length {len} exceeds maximum {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("malformed frame payload: {0}")]
    Malformed(String),

    #[error("failed to encode envelope: {0}")]
    Encode(String),

    #[error("stream ended with {0} bytes of an incomplete frame")]
    Truncated(usize),
}
