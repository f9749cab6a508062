//! Frame reassembly from an arbitrarily chunked byte stream.
//!
//! Two framing disciplines are supported:
//! - `LengthPrefixed`: every frame is preceded by a 4-byte big-endian length
//!   whose top bit is ignored. This is the canonical protocol (socket channel).
//! - `ShortRead`: no framing on the wire. A read that returns fewer bytes than
//!   requested ends the current frame. This is a compatibility mode for the
//!   USB accessory channel and only works while the transport preserves the
//!   producer's write boundaries.
//!
//! Reassemblers never block: they consume whatever chunk the driving loop
//! read and return the frames completed by it (zero, one or many).

use bytes::{BufMut, Bytes, BytesMut};

use super::types::Frame;
use crate::error::ProtocolError;

/// Size of the length header in the length-prefixed discipline.
pub const HEADER_LEN: usize = 4;

/// Convention used to delimit frames within the byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discipline {
    LengthPrefixed,
    ShortRead,
}

impl Discipline {
    /// Index assigned to the first frame when computing paced timestamps.
    pub fn first_frame_index(&self) -> u64 {
        match self {
            Discipline::LengthPrefixed => 1,
            Discipline::ShortRead => 0,
        }
    }
}

impl std::fmt::Display for Discipline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Discipline::LengthPrefixed => write!(f, "length-prefixed"),
            Discipline::ShortRead => write!(f, "short-read"),
        }
    }
}

/// Encode a payload in the length-prefixed wire form.
pub fn encode_frame(payload: &[u8]) -> Result<Bytes, ProtocolError> {
    if payload.len() > i32::MAX as usize {
        return Err(ProtocolError::FrameTooLarge {
            len: payload.len(),
            max: i32::MAX as usize,
        });
    }
    let mut out = BytesMut::with_capacity(HEADER_LEN + payload.len());
    out.put_u32(payload.len() as u32);
    out.put_slice(payload);
    Ok(out.freeze())
}

/// Decode the masked 31-bit length of a complete header.
fn decode_length(header: &[u8; HEADER_LEN]) -> i64 {
    (((header[0] & 0x7f) as i64) << 24)
        | ((header[1] as i64) << 16)
        | ((header[2] as i64) << 8)
        | (header[3] as i64)
}

/// Result of pushing one chunk: the frames it completed, in order, and the
/// protocol error that ended the stream, if any.
#[derive(Debug, Default)]
pub struct Reassembled {
    pub frames: Vec<Frame>,
    pub error: Option<ProtocolError>,
}

impl Reassembled {
    fn ok(frames: Vec<Frame>) -> Self {
        Self {
            frames,
            error: None,
        }
    }

    fn failed(frames: Vec<Frame>, err: ProtocolError) -> Self {
        Self {
            frames,
            error: Some(err),
        }
    }
}

/// Mutable reassembly state of the length-prefixed discipline.
#[derive(Debug, Default)]
pub struct StreamCursor {
    header: [u8; HEADER_LEN],
    header_len: usize,
    remaining: usize,
    payload: BytesMut,
}

impl StreamCursor {
    /// True when no header byte and no payload byte is held.
    pub fn is_empty(&self) -> bool {
        self.header_len == 0 && self.payload.is_empty() && self.remaining == 0
    }

    /// Bytes of the frame being assembled that are already buffered.
    pub fn write_offset(&self) -> usize {
        self.payload.len()
    }

    /// Payload bytes still missing from the current frame.
    pub fn remaining(&self) -> usize {
        self.remaining
    }

    fn header_complete(&self) -> bool {
        self.header_len == HEADER_LEN
    }

    fn reset(&mut self) {
        self.header_len = 0;
        self.remaining = 0;
        self.payload = BytesMut::new();
    }
}

/// Reassembler for `[4-byte length][payload]` streams.
pub struct LengthPrefixedReassembler {
    cursor: StreamCursor,
    max_frame_size: usize,
    keepalives: u64,
    failed: Option<ProtocolError>,
}

impl LengthPrefixedReassembler {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            cursor: StreamCursor::default(),
            max_frame_size,
            keepalives: 0,
            failed: None,
        }
    }

    pub fn cursor(&self) -> &StreamCursor {
        &self.cursor
    }

    /// Number of zero-length frames skipped so far.
    pub fn keepalives(&self) -> u64 {
        self.keepalives
    }

    /// Consume one chunk and return every frame it completes.
    ///
    /// Frames completed before a protocol error in the same chunk are still
    /// returned. Once an error has been reported the stream is considered
    /// corrupted and every later call reports the same error and no frames.
    pub fn push(&mut self, chunk: &[u8]) -> Reassembled {
        if let Some(err) = &self.failed {
            return Reassembled::failed(Vec::new(), err.clone());
        }

        let mut frames = Vec::new();
        let mut rest = chunk;

        while !rest.is_empty() {
            if !self.cursor.header_complete() {
                let take = (HEADER_LEN - self.cursor.header_len).min(rest.len());
                let start = self.cursor.header_len;
                self.cursor.header[start..start + take].copy_from_slice(&rest[..take]);
                self.cursor.header_len += take;
                rest = &rest[take..];

                if !self.cursor.header_complete() {
                    break;
                }

                let len = decode_length(&self.cursor.header);
                if len < 0 {
                    let err = self.fail(ProtocolError::NegativeLength(len));
                    return Reassembled::failed(frames, err);
                }
                let len = len as usize;
                if len > self.max_frame_size {
                    let err = self.fail(ProtocolError::FrameTooLarge {
                        len,
                        max: self.max_frame_size,
                    });
                    return Reassembled::failed(frames, err);
                }
                if len == 0 {
                    self.keepalives += 1;
                    self.cursor.reset();
                    continue;
                }

                self.cursor.remaining = len;
                self.cursor.payload = BytesMut::with_capacity(len);
            }

            let take = self.cursor.remaining.min(rest.len());
            self.cursor.payload.extend_from_slice(&rest[..take]);
            self.cursor.remaining -= take;
            rest = &rest[take..];

            if self.cursor.remaining == 0 {
                let payload = std::mem::take(&mut self.cursor.payload);
                frames.push(Frame::new(payload.freeze()));
                self.cursor.reset();
            }
        }

        Reassembled::ok(frames)
    }

    fn fail(&mut self, err: ProtocolError) -> ProtocolError {
        self.cursor.reset();
        self.failed = Some(err.clone());
        err
    }
}

/// Reassembler that infers frame ends from short reads.
pub struct ShortReadReassembler {
    buffer: Vec<u8>,
    offset: usize,
    read_size: usize,
}

impl ShortReadReassembler {
    /// `read_size` is the capacity requested from the channel on every read,
    /// `max_frame_size` the capacity of the accumulation buffer.
    pub fn new(read_size: usize, max_frame_size: usize) -> Self {
        Self {
            buffer: vec![0; max_frame_size],
            offset: 0,
            read_size,
        }
    }

    pub fn read_size(&self) -> usize {
        self.read_size
    }

    pub fn pending_bytes(&self) -> usize {
        self.offset
    }

    /// Consume the result of one read of `read_size` bytes.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Option<Frame>, ProtocolError> {
        if chunk.is_empty() {
            return Ok(None);
        }

        let end = self.offset + chunk.len();
        if end > self.buffer.len() {
            let err = ProtocolError::AccumulationOverflow {
                len: end,
                max: self.buffer.len(),
            };
            self.reset();
            return Err(err);
        }
        self.buffer[self.offset..end].copy_from_slice(chunk);
        self.offset = end;

        if chunk.len() < self.read_size {
            let frame = Frame::new(Bytes::copy_from_slice(&self.buffer[..self.offset]));
            self.reset();
            return Ok(Some(frame));
        }
        Ok(None)
    }

    fn reset(&mut self) {
        self.buffer[..self.offset].fill(0);
        self.offset = 0;
    }
}

/// Frame reassembler selected by the channel's discipline.
pub enum FrameReassembler {
    LengthPrefixed(LengthPrefixedReassembler),
    ShortRead(ShortReadReassembler),
}

impl FrameReassembler {
    pub fn new(discipline: Discipline, read_size: usize, max_frame_size: usize) -> Self {
        match discipline {
            Discipline::LengthPrefixed => {
                FrameReassembler::LengthPrefixed(LengthPrefixedReassembler::new(max_frame_size))
            }
            Discipline::ShortRead => {
                FrameReassembler::ShortRead(ShortReadReassembler::new(read_size, max_frame_size))
            }
        }
    }

    pub fn discipline(&self) -> Discipline {
        match self {
            FrameReassembler::LengthPrefixed(_) => Discipline::LengthPrefixed,
            FrameReassembler::ShortRead(_) => Discipline::ShortRead,
        }
    }

    /// Zero-length frames skipped so far. Always 0 for the short-read discipline.
    pub fn keepalives(&self) -> u64 {
        match self {
            FrameReassembler::LengthPrefixed(r) => r.keepalives(),
            FrameReassembler::ShortRead(_) => 0,
        }
    }

    /// Bytes of an unfinished frame currently buffered.
    pub fn pending_bytes(&self) -> usize {
        match self {
            FrameReassembler::LengthPrefixed(r) => {
                r.cursor().header_len + r.cursor().write_offset()
            }
            FrameReassembler::ShortRead(r) => r.pending_bytes(),
        }
    }

    pub fn push(&mut self, chunk: &[u8]) -> Reassembled {
        match self {
            FrameReassembler::LengthPrefixed(r) => r.push(chunk),
            FrameReassembler::ShortRead(r) => match r.push(chunk) {
                Ok(frame) => Reassembled::ok(frame.into_iter().collect()),
                Err(e) => Reassembled::failed(Vec::new(), e),
            },
        }
    }
}
