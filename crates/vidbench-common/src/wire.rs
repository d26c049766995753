//! # Segment Datagram Wire Format
//!
//! The UDP transport moves one segment per request over a single socket,
//! multiplexed by `request_id`. Every datagram starts with a 1-byte kind
//! followed by QUIC-style VarInt fields:
//!
//! ```text
//! Request  (0x01): request_id, quality_id, segment_index
//! Chunk    (0x02): request_id, chunk_index, chunk_count, total_len, payload…
//! Nack     (0x03): request_id, n, n × (start, count)
//! Error    (0x04): request_id, code (u8)
//! ```
//!
//! A chunk's payload runs to the end of the datagram.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use thiserror::Error;

/// Payload bytes per chunk; keeps datagrams below common path MTUs.
pub const DEFAULT_CHUNK_SIZE: usize = 1200;

/// Upper bound on NACK ranges in one datagram.
pub const MAX_NACK_RANGES: usize = 256;

/// Largest segment body a chunk may announce.
pub const MAX_SEGMENT_LEN: u64 = 256 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("datagram truncated")]
    Truncated,
    #[error("unknown datagram kind 0x{0:02x}")]
    UnknownKind(u8),
    #[error("unknown error code 0x{0:02x}")]
    UnknownErrorCode(u8),
    #[error("too many NACK ranges ({0})")]
    TooManyRanges(usize),
    #[error("chunk {index} outside of {count} chunks")]
    ChunkOutOfRange { index: u64, count: u64 },
    #[error("segment of {0} bytes exceeds the {MAX_SEGMENT_LEN}-byte limit")]
    SegmentTooLarge(u64),
    #[error("{count} chunks cannot carry {total_len} bytes")]
    BadChunkLayout { count: u32, total_len: u64 },
}

// ─── VarInt (QUIC-style, RFC 9000 §16) ──────────────────────────────────────

/// A 62-bit variable-length integer encoded in 1, 2, 4, or 8 bytes.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VarInt(u64);

impl VarInt {
    /// Maximum representable value: 2^62 - 1.
    pub const MAX: u64 = (1 << 62) - 1;

    #[inline]
    pub fn new(val: u64) -> Option<Self> {
        if val <= Self::MAX {
            Some(VarInt(val))
        } else {
            None
        }
    }

    #[inline]
    pub fn value(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn encoded_len(self) -> usize {
        if self.0 < 0x40 {
            1
        } else if self.0 < 0x4000 {
            2
        } else if self.0 < 0x4000_0000 {
            4
        } else {
            8
        }
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        match self.encoded_len() {
            1 => buf.put_u8(self.0 as u8),
            2 => buf.put_u16(0x4000 | self.0 as u16),
            4 => buf.put_u32(0x8000_0000 | self.0 as u32),
            _ => buf.put_u64(0xC000_0000_0000_0000 | self.0),
        }
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, WireError> {
        if !buf.has_remaining() {
            return Err(WireError::Truncated);
        }
        let first = buf.chunk()[0];
        let len = 1usize << (first >> 6);
        if buf.remaining() < len {
            return Err(WireError::Truncated);
        }
        let val = match len {
            1 => {
                buf.advance(1);
                (first & 0x3F) as u64
            }
            2 => (buf.get_u16() & 0x3FFF) as u64,
            4 => (buf.get_u32() & 0x3FFF_FFFF) as u64,
            _ => buf.get_u64() & 0x3FFF_FFFF_FFFF_FFFF,
        };
        Ok(VarInt(val))
    }
}

impl fmt::Debug for VarInt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VarInt({})", self.0)
    }
}

impl From<u32> for VarInt {
    fn from(v: u32) -> Self {
        VarInt(v as u64)
    }
}

fn put_varint(buf: &mut BytesMut, v: u64) {
    // Every field on this wire is a u32 or a length well below 2^62.
    VarInt(v.min(VarInt::MAX)).encode(buf);
}

fn get_u32(buf: &mut impl Buf) -> Result<u32, WireError> {
    let v = VarInt::decode(buf)?.value();
    u32::try_from(v).map_err(|_| WireError::Truncated)
}

// ─── Datagrams ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Kind {
    Request = 0x01,
    Chunk = 0x02,
    Nack = 0x03,
    Error = 0x04,
}

/// Reason a server refused a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorCode {
    /// Quality or segment index does not exist.
    NotFound = 0x01,
    /// Storage failure on the server side.
    Internal = 0x02,
}

impl ErrorCode {
    fn from_byte(b: u8) -> Result<Self, WireError> {
        match b {
            0x01 => Ok(ErrorCode::NotFound),
            0x02 => Ok(ErrorCode::Internal),
            other => Err(WireError::UnknownErrorCode(other)),
        }
    }
}

/// Client → server: fetch one segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentRequest {
    pub request_id: u32,
    pub quality_id: u32,
    pub index: u32,
}

/// Server → client: one slice of a segment body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub request_id: u32,
    pub chunk_index: u32,
    pub chunk_count: u32,
    /// Length of the whole segment body.
    pub total_len: u64,
    pub payload: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NackRange {
    pub start: u32,
    pub count: u32,
}

/// Client → server: chunks still missing for a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nack {
    pub request_id: u32,
    pub ranges: Vec<NackRange>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Datagram {
    Request(SegmentRequest),
    Chunk(Chunk),
    Nack(Nack),
    Error { request_id: u32, code: ErrorCode },
}

impl Datagram {
    pub fn request_id(&self) -> u32 {
        match self {
            Datagram::Request(r) => r.request_id,
            Datagram::Chunk(c) => c.request_id,
            Datagram::Nack(n) => n.request_id,
            Datagram::Error { request_id, .. } => *request_id,
        }
    }

    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(16);
        match self {
            Datagram::Request(r) => {
                buf.put_u8(Kind::Request as u8);
                put_varint(&mut buf, r.request_id as u64);
                put_varint(&mut buf, r.quality_id as u64);
                put_varint(&mut buf, r.index as u64);
            }
            Datagram::Chunk(c) => {
                buf.reserve(c.payload.len() + 24);
                buf.put_u8(Kind::Chunk as u8);
                put_varint(&mut buf, c.request_id as u64);
                put_varint(&mut buf, c.chunk_index as u64);
                put_varint(&mut buf, c.chunk_count as u64);
                put_varint(&mut buf, c.total_len);
                buf.put_slice(&c.payload);
            }
            Datagram::Nack(n) => {
                buf.put_u8(Kind::Nack as u8);
                put_varint(&mut buf, n.request_id as u64);
                put_varint(&mut buf, n.ranges.len() as u64);
                for range in &n.ranges {
                    put_varint(&mut buf, range.start as u64);
                    put_varint(&mut buf, range.count as u64);
                }
            }
            Datagram::Error { request_id, code } => {
                buf.put_u8(Kind::Error as u8);
                put_varint(&mut buf, *request_id as u64);
                buf.put_u8(*code as u8);
            }
        }
        buf
    }

    /// Decode one datagram. Chunk payloads are zero-copy slices of `data`.
    pub fn decode(mut data: Bytes) -> Result<Self, WireError> {
        if !data.has_remaining() {
            return Err(WireError::Truncated);
        }
        let kind = data.get_u8();
        match kind {
            k if k == Kind::Request as u8 => Ok(Datagram::Request(SegmentRequest {
                request_id: get_u32(&mut data)?,
                quality_id: get_u32(&mut data)?,
                index: get_u32(&mut data)?,
            })),
            k if k == Kind::Chunk as u8 => {
                let request_id = get_u32(&mut data)?;
                let chunk_index = get_u32(&mut data)?;
                let chunk_count = get_u32(&mut data)?;
                let total_len = VarInt::decode(&mut data)?.value();
                if chunk_index >= chunk_count {
                    return Err(WireError::ChunkOutOfRange {
                        index: chunk_index as u64,
                        count: chunk_count as u64,
                    });
                }
                check_layout(chunk_count, total_len)?;
                Ok(Datagram::Chunk(Chunk {
                    request_id,
                    chunk_index,
                    chunk_count,
                    total_len,
                    payload: data,
                }))
            }
            k if k == Kind::Nack as u8 => {
                let request_id = get_u32(&mut data)?;
                let n = VarInt::decode(&mut data)?.value() as usize;
                if n > MAX_NACK_RANGES {
                    return Err(WireError::TooManyRanges(n));
                }
                let mut ranges = Vec::with_capacity(n);
                for _ in 0..n {
                    ranges.push(NackRange {
                        start: get_u32(&mut data)?,
                        count: get_u32(&mut data)?,
                    });
                }
                Ok(Datagram::Nack(Nack { request_id, ranges }))
            }
            k if k == Kind::Error as u8 => {
                let request_id = get_u32(&mut data)?;
                if !data.has_remaining() {
                    return Err(WireError::Truncated);
                }
                let code = ErrorCode::from_byte(data.get_u8())?;
                Ok(Datagram::Error { request_id, code })
            }
            other => Err(WireError::UnknownKind(other)),
        }
    }
}

/// A segment of `total_len` bytes split into `count` chunks: within
/// [`MAX_SEGMENT_LEN`], and no more chunks than bytes (an empty body is
/// one empty chunk).
pub fn check_layout(count: u32, total_len: u64) -> Result<(), WireError> {
    if total_len > MAX_SEGMENT_LEN {
        return Err(WireError::SegmentTooLarge(total_len));
    }
    if count == 0 || count as u64 > total_len.max(1) {
        return Err(WireError::BadChunkLayout { count, total_len });
    }
    Ok(())
}

/// Number of chunks needed to carry `len` bytes (an empty body still takes one).
pub fn chunk_count(len: usize, chunk_size: usize) -> u32 {
    len.div_ceil(chunk_size.max(1)).max(1) as u32
}

/// Collapse a sorted list of missing chunk indices into NACK ranges,
/// keeping at most [`MAX_NACK_RANGES`].
pub fn coalesce_ranges(missing: impl IntoIterator<Item = u32>) -> Vec<NackRange> {
    let mut ranges: Vec<NackRange> = Vec::new();
    for idx in missing {
        match ranges.last_mut() {
            Some(last) if last.start + last.count == idx => last.count += 1,
            _ => {
                if ranges.len() == MAX_NACK_RANGES {
                    break;
                }
                ranges.push(NackRange {
                    start: idx,
                    count: 1,
                });
            }
        }
    }
    ranges
}
