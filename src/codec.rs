//! Framing codec: wire layout, CRC, and streaming frame reassembly.
//!
//! Wire layout (little-endian multi-byte fields), spec §4.1/§6:
//!
//! ```text
//! SOF (1)     = 0xAA
//! VERSION (1) = 0x01
//! TYPE (1)
//! SEQ (2)
//! LEN (2)      payload length only
//! PAYLOAD (LEN)
//! CRC (2)      CRC-16 over VERSION..last payload byte
//! ```
//!
//! The CRC is CRC-16/CCITT-FALSE (poly 0x1021, init 0xFFFF, no reflection,
//! xorout 0x0000) — see `DESIGN.md` for why this instance was picked absent a
//! captured reference frame to derive the polynomial from.

use bytes::{Buf, BufMut, BytesMut};
use crc::{Crc, CRC_16_IBM_3740};
use thiserror::Error;

pub const SOF: u8 = 0xAA;
pub const VERSION: u8 = 0x01;
const HEADER_LEN: usize = 7; // SOF, VERSION, TYPE, SEQ(2), LEN(2)
const CRC_LEN: usize = 2;
pub const DEFAULT_MAX_PAYLOAD_LEN: usize = 512;

static CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// Computes the wire CRC over `VERSION..=last payload byte`.
pub fn crc16(version_through_payload: &[u8]) -> u16 {
    CRC16.checksum(version_through_payload)
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("crc mismatch")]
    CrcMismatch,
    #[error("unsupported protocol version {0}")]
    VersionUnsupported(u8),
    #[error("payload length {0} exceeds maximum {1}")]
    LengthExceeded(usize, usize),
}

/// A decoded (or to-be-encoded) frame. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: u8,
    pub seq: u16,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(frame_type: u8, seq: u16, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            frame_type,
            seq,
            payload: payload.into(),
        }
    }
}

/// Encodes `frame` onto the wire. Rejects a payload longer than `max_payload_len`
/// (the peer-advertised maximum once negotiated, `DEFAULT_MAX_PAYLOAD_LEN` otherwise).
pub fn encode(frame: &Frame, max_payload_len: usize) -> Result<Vec<u8>, DecodeError> {
    if frame.payload.len() > max_payload_len {
        return Err(DecodeError::LengthExceeded(
            frame.payload.len(),
            max_payload_len,
        ));
    }
    let len = frame.payload.len();
    let mut out = Vec::with_capacity(HEADER_LEN + len + CRC_LEN);
    out.put_u8(SOF);
    out.put_u8(VERSION);
    out.put_u8(frame.frame_type);
    out.put_u16_le(frame.seq);
    out.put_u16_le(len as u16);
    out.extend_from_slice(&frame.payload);
    let crc = crc16(&out[1..]);
    out.put_u16_le(crc);
    Ok(out)
}

/// Stateful streaming decoder. Buffers appended bytes and yields every complete,
/// CRC-valid frame on `drain_frames`. Resynchronizes on CRC/version errors by
/// consuming exactly one byte past the rejected SOF (spec §4.1), so a bogus LEN
/// can never swallow a later valid frame.
#[derive(Default)]
pub struct Decoder {
    buf: BytesMut,
    max_payload_len: usize,
}

impl Decoder {
    pub fn new(max_payload_len: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_payload_len,
        }
    }

    pub fn append(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Adopts a new negotiated maximum payload length (e.g. once a `HelloAck`
    /// reports the peer's `max_frame_len`). Buffered-but-undecoded bytes are
    /// preserved.
    pub fn set_max_payload_len(&mut self, max_payload_len: usize) {
        self.max_payload_len = max_payload_len;
    }

    /// Drains every frame presently decodable, interleaving frames with decode
    /// errors in wire order. Call repeatedly (e.g. in a loop) until it returns
    /// an empty vector to make sure multiple back-to-back frames are all drained.
    pub fn drain_frames(&mut self) -> Vec<Result<Frame, DecodeError>> {
        let mut out = Vec::new();
        loop {
            match self.try_decode_one() {
                Some(item) => out.push(item),
                None => break,
            }
        }
        out
    }

    /// Attempts to decode a single frame (or error) from the front of the
    /// buffer. Returns `None` when there isn't enough data yet to decide.
    fn try_decode_one(&mut self) -> Option<Result<Frame, DecodeError>> {
        loop {
            let sof_pos = self.buf.iter().position(|&b| b == SOF)?;
            if sof_pos > 0 {
                self.buf.advance(sof_pos);
            }

            // Need at least the fixed header to read TYPE/SEQ/LEN.
            if self.buf.len() < HEADER_LEN {
                return None;
            }

            let version = self.buf[1];
            let frame_type = self.buf[2];
            let seq = u16::from_le_bytes([self.buf[3], self.buf[4]]);
            let len = u16::from_le_bytes([self.buf[5], self.buf[6]]) as usize;

            if version != VERSION {
                self.buf.advance(1);
                return Some(Err(DecodeError::VersionUnsupported(version)));
            }

            if len > self.max_payload_len {
                // Oversized LEN: resynchronize past this SOF rather than
                // waiting to buffer a payload we'll never accept.
                self.buf.advance(1);
                return Some(Err(DecodeError::LengthExceeded(len, self.max_payload_len)));
            }

            let total = HEADER_LEN + len + CRC_LEN;
            if self.buf.len() < total {
                return None;
            }

            let crc_expected = crc16(&self.buf[1..HEADER_LEN + len]);
            let crc_actual = u16::from_le_bytes([self.buf[total - 2], self.buf[total - 1]]);
            if crc_expected != crc_actual {
                self.buf.advance(1);
                return Some(Err(DecodeError::CrcMismatch));
            }

            let payload = self.buf[HEADER_LEN..HEADER_LEN + len].to_vec();
            self.buf.advance(total);
            return Some(Ok(Frame {
                frame_type,
                seq,
                payload,
            }));
        }
    }
}
