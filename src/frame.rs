//! Length-prefixed framing for the raw pipe transport.
//!
//! ## Wire Format
//!
//! ```text
//! +----------------+------------------+--------------------+
//! | length: u32    | reserved: u16    | payload[length]    |
//! +----------------+------------------+--------------------+
//! ```
//!
//! Header fields use native byte order; both ends of the link are expected to
//! share it. `length` never exceeds the link MTU. There is no checksum, the
//! transport is trusted for integrity.

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the frame header (length + reserved).
pub const HEADER_LEN: usize = 6;

/// Baseline link MTU in bytes.
pub const DEFAULT_MTU: usize = 250;

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Reserved header field, carried through but not interpreted.
    pub reserved: u16,
    /// Frame payload, exactly `length` bytes.
    pub payload: Bytes,
}

impl Frame {
    /// Number of valid payload bytes.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// True if the frame carries no payload.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Framing errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Payload length exceeds the link MTU.
    TooLarge { length: usize, mtu: usize },
    /// Input ended before the header or payload was complete.
    Truncated { needed: usize, available: usize },
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::TooLarge { length, mtu } => {
                write!(f, "Frame of {} bytes exceeds MTU of {} bytes", length, mtu)
            }
            FrameError::Truncated { needed, available } => {
                write!(f, "Truncated frame: need {} bytes, have {}", needed, available)
            }
        }
    }
}

impl std::error::Error for FrameError {}

/// Encode `payload` as a single frame.
///
/// Payloads larger than `mtu` are rejected, never truncated.
pub fn encode(payload: &[u8], mtu: usize) -> Result<BytesMut, FrameError> {
    if payload.len() > mtu {
        return Err(FrameError::TooLarge {
            length: payload.len(),
            mtu,
        });
    }

    let mut out = BytesMut::with_capacity(HEADER_LEN + payload.len());
    out.put_u32_ne(payload.len() as u32);
    out.put_u16_ne(0);
    out.extend_from_slice(payload);
    Ok(out)
}

/// Decode one frame from the start of `raw`.
///
/// The length prefix is read first, then exactly `length` payload bytes.
/// Any bytes after the frame are ignored.
pub fn decode(raw: &[u8], mtu: usize) -> Result<Frame, FrameError> {
    if raw.len() < HEADER_LEN {
        return Err(FrameError::Truncated {
            needed: HEADER_LEN,
            available: raw.len(),
        });
    }

    let mut header = &raw[..HEADER_LEN];
    let length = header.get_u32_ne() as usize;
    let reserved = header.get_u16_ne();

    if length > mtu {
        return Err(FrameError::TooLarge { length, mtu });
    }

    let end = HEADER_LEN + length;
    if raw.len() < end {
        return Err(FrameError::Truncated {
            needed: end,
            available: raw.len(),
        });
    }

    Ok(Frame {
        reserved,
        payload: Bytes::copy_from_slice(&raw[HEADER_LEN..end]),
    })
}

/// Incremental decoder over a byte stream.
///
/// Bytes are accumulated by the caller into a `BytesMut`; each call to
/// [`FrameDecoder::decode`] consumes at most one frame. When an oversized
/// header is seen the error is reported once and the announced payload is
/// then skipped as it arrives, so the next frame starts on its own boundary.
#[derive(Debug)]
pub struct FrameDecoder {
    mtu: usize,
    /// Bytes of a rejected frame still to be skipped.
    discard: usize,
}

impl FrameDecoder {
    /// Create a decoder for a link with the given MTU.
    pub fn new(mtu: usize) -> Self {
        Self { mtu, discard: 0 }
    }

    /// Link MTU this decoder enforces.
    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// True while the payload of a rejected frame is being skipped.
    pub fn is_discarding(&self) -> bool {
        self.discard > 0
    }

    /// Try to take one frame off the front of `src`.
    ///
    /// Returns `Ok(None)` when more bytes are needed.
    pub fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        if self.discard > 0 {
            let n = self.discard.min(src.len());
            src.advance(n);
            self.discard -= n;
            if self.discard > 0 {
                return Ok(None);
            }
        }

        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let mut header = &src[..HEADER_LEN];
        let length = header.get_u32_ne() as usize;
        let reserved = header.get_u16_ne();

        if length > self.mtu {
            src.advance(HEADER_LEN);
            let n = length.min(src.len());
            src.advance(n);
            self.discard = length - n;
            return Err(FrameError::TooLarge {
                length,
                mtu: self.mtu,
            });
        }

        if src.len() < HEADER_LEN + length {
            src.reserve(HEADER_LEN + length - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(length).freeze();
        Ok(Some(Frame { reserved, payload }))
    }
}
