//! Frame envelope codec for the binary control plane.
//!
//! A frame on the wire is `type (varint) | length (varint) | payload`. Frame
//! types defined by the protocol are all below 64, so the writer emits the
//! type as a single byte; the reader accepts any varint width.
//!
//! The codec never allocates: envelopes are written into fixed destination
//! slices owned by the transport, and read from borrowed input.

use crate::error::{Error, Result};
use crate::varint;

/// Frame type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameType(pub u64);

impl FrameType {
    /// Request or response body bytes.
    pub const DATA: FrameType = FrameType(0x00);
    /// Encoded header block.
    pub const HEADERS: FrameType = FrameType(0x01);
    /// Cancels a server push.
    pub const CANCEL_PUSH: FrameType = FrameType(0x03);
    /// Connection settings, sent once per connection.
    pub const SETTINGS: FrameType = FrameType(0x04);
    /// Announces a server push.
    pub const PUSH_PROMISE: FrameType = FrameType(0x05);
    /// Graceful shutdown.
    pub const GOAWAY: FrameType = FrameType(0x07);
    /// Upper bound on push identifiers.
    pub const MAX_PUSH_ID: FrameType = FrameType(0x0d);

    /// HTTP/2 frame types that must not appear on this protocol.
    pub fn is_reserved_h2(self) -> bool {
        matches!(self.0, 0x02 | 0x06 | 0x08 | 0x09)
    }
}

/// Largest possible envelope: one type byte plus an 8-byte length.
pub const MAX_ENVELOPE_LEN: usize = 1 + 8;

/// The `(type, length)` prefix of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameEnvelope {
    /// Type byte of the frame.
    pub frame_type: FrameType,
    /// Length of the payload following the envelope.
    pub payload_len: u64,
}

/// Writes a one-byte frame type followed by the varint payload length.
///
/// Returns the number of bytes written, or `None` (with no bytes written) if
/// the type does not fit in one byte, the length is not encodable, or `buf`
/// is too short.
pub fn try_write_frame_envelope(
    frame_type: FrameType,
    payload_len: u64,
    buf: &mut [u8],
) -> Option<usize> {
    let tag = u8::try_from(frame_type.0).ok().filter(|t| *t < 0x40)?;
    let len_width = varint::encoded_len(payload_len)?;
    if buf.len() < 1 + len_width {
        return None;
    }

    buf[0] = tag;
    let written = varint::try_write(&mut buf[1..], payload_len)?;
    Some(1 + written)
}

/// Reads a frame envelope from the front of `buf`.
///
/// Returns the envelope and the number of bytes it occupied. Truncated input
/// yields `None` with nothing consumed; the payload itself is not required to
/// be present.
pub fn try_read_frame_envelope(buf: &[u8]) -> Option<(FrameEnvelope, usize)> {
    let ((frame_type, payload_len), consumed) = varint::try_read_integer_pair(buf)?;
    Some((
        FrameEnvelope {
            frame_type: FrameType(frame_type),
            payload_len,
        },
        consumed,
    ))
}

/// Well-known SETTINGS identifiers.
pub mod settings {
    /// Dynamic table capacity of the header decoder.
    pub const QPACK_MAX_TABLE_CAPACITY: u64 = 0x01;
    /// Largest header section the sender accepts.
    pub const MAX_FIELD_SECTION_SIZE: u64 = 0x06;
    /// Streams that may block on the dynamic table.
    pub const QPACK_BLOCKED_STREAMS: u64 = 0x07;
    /// Extended CONNECT support.
    pub const ENABLE_CONNECT_PROTOCOL: u64 = 0x08;
}

/// Iterates the `(identifier, value)` pairs of a SETTINGS payload.
///
/// Yields a single [`Error::Decode`] if the payload ends in a malformed pair,
/// then stops.
pub struct SettingsReader<'a> {
    buf: &'a [u8],
    failed: bool,
}

impl<'a> SettingsReader<'a> {
    /// Reader over a complete SETTINGS payload.
    pub fn new(payload: &'a [u8]) -> Self {
        Self {
            buf: payload,
            failed: false,
        }
    }
}

impl Iterator for SettingsReader<'_> {
    type Item = Result<(u64, u64)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.buf.is_empty() {
            return None;
        }
        match varint::try_read_integer_pair(self.buf) {
            Some((pair, consumed)) => {
                self.buf = &self.buf[consumed..];
                Some(Ok(pair))
            }
            None => {
                self.failed = true;
                Some(Err(Error::Decode {
                    what: "settings pair",
                }))
            }
        }
    }
}

/// Writes one `(identifier, value)` setting into `buf`.
pub fn try_write_setting(id: u64, value: u64, buf: &mut [u8]) -> Option<usize> {
    let needed = varint::encoded_len(id)? + varint::encoded_len(value)?;
    if buf.len() < needed {
        return None;
    }
    let n = varint::try_write(buf, id)?;
    let m = varint::try_write(&mut buf[n..], value)?;
    Some(n + m)
}
