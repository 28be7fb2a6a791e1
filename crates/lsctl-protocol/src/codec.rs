//! Command frame encoder/decoder.
//!
//! Every exchange on the command socket is a fixed 128-byte little-endian
//! frame, optionally followed by a raw payload whose length is declared in
//! the frame header. This module does the byte-level work only; no I/O is
//! performed.
//!
//! # Frame format
//!
//! ```text
//! offset  size  field
//!      0     4  start marker (0xF321E654)
//!      4     4  command code
//!      8     4  status
//!     12    28  params[7]   (slot 6 carries the callback flag in bit 31)
//!     40     8  value       (f64)
//!     48     4  additional payload length
//!     52    72  data        (zero padded)
//!    124     4  end marker  (0xFEDC4321)
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use lsctl_core::error::{DecodeError, Marker};
use lsctl_core::types::{CommandFrame, CommandRequest, DATA_SIZE, FRAME_SIZE, PARAM_COUNT};

/// Constant at offset 0 of every frame.
pub const START_MARKER: u32 = 0xF321_E654;

/// Constant at offset 124 of every frame.
pub const END_MARKER: u32 = 0xFEDC_4321;

/// Largest additional payload accepted from the stream. Anything larger is
/// treated as a corrupted header.
pub const MAX_PAYLOAD_LEN: usize = 16 * 1024 * 1024;

const END_MARKER_OFFSET: usize = FRAME_SIZE - 4;

/// Encode a frame into its 128-byte wire form.
///
/// # Example
///
/// ```
/// use lsctl_core::CommandFrame;
/// use lsctl_protocol::codec::{encode, START_MARKER};
///
/// let bytes = encode(&CommandFrame::new(0x3004));
/// assert_eq!(bytes.len(), 128);
/// assert_eq!(&bytes[..4], &START_MARKER.to_le_bytes());
/// assert_eq!(&bytes[4..8], &0x3004u32.to_le_bytes());
/// ```
pub fn encode(frame: &CommandFrame) -> [u8; FRAME_SIZE] {
    let mut out = [0u8; FRAME_SIZE];
    let mut w = &mut out[..];
    w.put_u32_le(START_MARKER);
    w.put_u32_le(frame.code);
    w.put_u32_le(frame.status);
    for p in frame.params {
        w.put_u32_le(p);
    }
    w.put_f64_le(frame.value);
    w.put_u32_le(frame.additional_len);
    w.put_slice(&frame.data);
    w.put_u32_le(END_MARKER);
    out
}

/// Encode a request into the bytes written to the socket: the frame
/// followed by any additional payload.
pub fn encode_request(request: &CommandRequest) -> Bytes {
    let frame = request.to_frame();
    let mut buf = BytesMut::with_capacity(FRAME_SIZE + request.payload.len());
    buf.put_slice(&encode(&frame));
    buf.put_slice(&request.payload);
    buf.freeze()
}

/// Decode the first 128 bytes of `buf` into a frame.
///
/// Fails with [`DecodeError::Truncated`] if fewer than 128 bytes are
/// supplied, or [`DecodeError::BadMarker`] if either marker mismatches.
/// Bytes past the first frame are ignored; accumulating partial reads is
/// the caller's job.
pub fn decode(buf: &[u8]) -> Result<CommandFrame, DecodeError> {
    if buf.len() < FRAME_SIZE {
        return Err(DecodeError::Truncated { len: buf.len() });
    }

    let mut r = &buf[..FRAME_SIZE];
    let start = r.get_u32_le();
    if start != START_MARKER {
        return Err(DecodeError::BadMarker {
            which: Marker::Start,
            found: start,
        });
    }

    let end = u32::from_le_bytes([
        buf[END_MARKER_OFFSET],
        buf[END_MARKER_OFFSET + 1],
        buf[END_MARKER_OFFSET + 2],
        buf[END_MARKER_OFFSET + 3],
    ]);
    if end != END_MARKER {
        return Err(DecodeError::BadMarker {
            which: Marker::End,
            found: end,
        });
    }

    let code = r.get_u32_le();
    let status = r.get_u32_le();
    let mut params = [0u32; PARAM_COUNT];
    for p in params.iter_mut() {
        *p = r.get_u32_le();
    }
    let value = r.get_f64_le();
    let additional_len = r.get_u32_le();
    let mut data = [0u8; DATA_SIZE];
    r.copy_to_slice(&mut data);

    Ok(CommandFrame {
        code,
        status,
        params,
        value,
        additional_len,
        data,
    })
}

/// Result of scanning an accumulation buffer for the next message.
#[derive(Debug, Clone, PartialEq)]
pub enum Scan {
    /// A frame and its full payload are available. `len` is the number of
    /// bytes (frame plus payload) the message occupies.
    Complete { frame: CommandFrame, len: usize },

    /// More bytes are needed.
    Incomplete,

    /// The buffer does not start with a valid frame. The caller should
    /// discard one byte and scan again.
    Corrupt(DecodeError),
}

/// Look for a complete message at the start of `buf`.
pub fn scan(buf: &[u8]) -> Scan {
    if buf.len() < FRAME_SIZE {
        return Scan::Incomplete;
    }

    let frame = match decode(buf) {
        Ok(frame) => frame,
        Err(e) => return Scan::Corrupt(e),
    };

    let payload_len = frame.additional_len as usize;
    if payload_len > MAX_PAYLOAD_LEN {
        tracing::debug!(
            code = frame.code,
            payload_len,
            "declared payload length exceeds limit"
        );
        return Scan::Corrupt(DecodeError::PayloadTooLarge { len: payload_len });
    }

    let len = FRAME_SIZE + payload_len;
    if buf.len() < len {
        return Scan::Incomplete;
    }
    Scan::Complete { frame, len }
}
