//! Length-prefixed framer for the MeshCore companion serial/TCP link.
//!
//! Each direction marks its frames with a single byte followed by a
//! little-endian `u16` payload length:
//!
//!   app → radio: `0x3C ('<') len_lo len_hi <payload>`
//!   radio → app: `0x3E ('>') len_lo len_hi <payload>`
//!
//! [`CompanionFramer`] is fed arbitrary chunks and yields whole payloads. On a
//! wrong marker or an oversize length it drops one byte and tries again.
use bytes::{Buf, BytesMut};

/// Largest payload the companion firmware will emit or accept.
pub const MAX_FRAME_SIZE: usize = 300;

pub const APP_TO_RADIO: u8 = b'<';
pub const RADIO_TO_APP: u8 = b'>';

const HEADER_LEN: usize = 3;

pub struct CompanionFramer {
    marker: u8,
    buf: BytesMut,
    dropped: usize,
}

impl CompanionFramer {
    /// Framer accepting frames that start with `marker`.
    pub fn new(marker: u8) -> Self {
        Self {
            marker,
            buf: BytesMut::with_capacity(1024),
            dropped: 0,
        }
    }

    /// Framer for the application side of the link.
    pub fn inbound() -> Self {
        Self::new(RADIO_TO_APP)
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes discarded while resynchronizing since creation.
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    /// Next complete payload, if one is buffered.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        loop {
            if self.buf.len() < HEADER_LEN {
                if !self.buf.is_empty() && self.buf[0] != self.marker {
                    self.resync();
                    continue;
                }
                return None;
            }
            if self.buf[0] != self.marker {
                self.resync();
                continue;
            }
            let len = u16::from_le_bytes([self.buf[1], self.buf[2]]) as usize;
            if len == 0 || len > MAX_FRAME_SIZE {
                self.resync();
                continue;
            }
            if self.buf.len() < HEADER_LEN + len {
                return None;
            }
            self.buf.advance(HEADER_LEN);
            return Some(self.buf.split_to(len).to_vec());
        }
    }

    fn resync(&mut self) {
        self.buf.advance(1);
        self.dropped += 1;
    }
}

/// Wrap `payload` in a frame with the given direction marker.
pub fn encode_frame(marker: u8, payload: &[u8]) -> Vec<u8> {
    let len = payload.len().min(MAX_FRAME_SIZE);
    let mut out = Vec::with_capacity(HEADER_LEN + len);
    out.push(marker);
    out.extend_from_slice(&(len as u16).to_le_bytes());
    out.extend_from_slice(&payload[..len]);
    out
}

/// Payload of a single whole frame carrying `marker`, or `None` when `frame`
/// is not exactly one well-formed frame.
pub fn frame_payload(marker: u8, frame: &[u8]) -> Option<&[u8]> {
    if frame.len() < HEADER_LEN || frame[0] != marker {
        return None;
    }
    let len = u16::from_le_bytes([frame[1], frame[2]]) as usize;
    if len == 0 || len > MAX_FRAME_SIZE || frame.len() != HEADER_LEN + len {
        return None;
    }
    Some(&frame[HEADER_LEN..])
}
