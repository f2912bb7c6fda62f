//! Shard vector clock and its wire codec.
//!
//! A `ShardClock` totally orders events within one shard: `clock` is a
//! task id drawn from the shard's allocator. The wire format is
//! tag-length-value with varint tags so that zero values cost zero
//! bytes; unknown fields are skipped on decode.

use thiserror::Error;

use super::shard_info::ShardId;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ShardClock {
    pub id: i32,
    pub clock: i64,
}

const ID_TAG: u64 = (1 << 3) | WIRE_VARINT;
const CLOCK_TAG: u64 = (2 << 3) | WIRE_VARINT;
const WIRE_VARINT: u64 = 0;
const WIRE_LEN_DELIMITED: u64 = 2;

impl ShardClock {
    pub fn new(shard_id: ShardId, clock: i64) -> Self {
        Self {
            id: shard_id.get(),
            clock,
        }
    }

    /// Zero-valued fields are omitted; the zero clock encodes to zero
    /// bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(12);
        if self.id != 0 {
            put_uvarint(&mut buf, ID_TAG);
            // int32 fields sign-extend to 64 bits on the wire
            put_uvarint(&mut buf, self.id as i64 as u64);
        }
        if self.clock != 0 {
            put_uvarint(&mut buf, CLOCK_TAG);
            put_uvarint(&mut buf, self.clock as u64);
        }
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ClockDecodeError> {
        let mut out = ShardClock::default();
        let mut pos = 0usize;
        while pos < buf.len() {
            let tag = read_uvarint(buf, &mut pos)?;
            let field = tag >> 3;
            match (field, tag & 0x7) {
                (1, WIRE_VARINT) => out.id = read_uvarint(buf, &mut pos)? as i64 as i32,
                (2, WIRE_VARINT) => out.clock = read_uvarint(buf, &mut pos)? as i64,
                (_, WIRE_VARINT) => {
                    read_uvarint(buf, &mut pos)?;
                }
                (_, WIRE_LEN_DELIMITED) => {
                    let len = read_uvarint(buf, &mut pos)? as usize;
                    if buf.len() - pos < len {
                        return Err(ClockDecodeError::Truncated);
                    }
                    pos += len;
                }
                (field, wire) => return Err(ClockDecodeError::UnsupportedWireType { field, wire }),
            }
        }
        Ok(out)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClockDecodeError {
    #[error("shard clock truncated")]
    Truncated,

    #[error("varint longer than 64 bits")]
    VarintOverflow,

    #[error("unsupported wire type {wire} for field {field}")]
    UnsupportedWireType { field: u64, wire: u64 },
}

fn put_uvarint(buf: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        buf.push((v as u8) | 0x80);
        v >>= 7;
    }
    buf.push(v as u8);
}

fn read_uvarint(buf: &[u8], pos: &mut usize) -> Result<u64, ClockDecodeError> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = *buf.get(*pos).ok_or(ClockDecodeError::Truncated)?;
        *pos += 1;
        if shift == 63 && byte > 1 {
            return Err(ClockDecodeError::VarintOverflow);
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift > 63 {
            return Err(ClockDecodeError::VarintOverflow);
        }
    }
}
