//! ONC RPC record marking (RFC 1831 section 10)
//!
//! On stream transports every message is split into one or more record
//! fragments, each preceded by a 4-byte record mark:
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-------------------------------------------------------------+
//! |L|                    fragment length (31 bits)                 |
//! +-+-------------------------------------------------------------+
//! ```
//!
//! `L` is set on the last fragment of a message. The length excludes the
//! record mark itself.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Result, RpcError};

/// Last-fragment flag
pub const RM_LAST_FRAGMENT: u32 = 0x8000_0000;

/// Fragment length mask
pub const RM_FRAGMENT_LEN: u32 = 0x7fff_ffff;

/// Size of the record mark
pub const RECORD_MARK_SIZE: usize = 4;

/// Default maximum fragment length (4 MiB)
pub const DEFAULT_MAX_FRAGMENT_LEN: usize = 4 * 1024 * 1024;

/// A decoded record mark
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordMark {
    pub is_last: bool,
    pub fragment_len: u32,
}

impl RecordMark {
    pub fn new(is_last: bool, fragment_len: u32) -> Self {
        Self {
            is_last,
            fragment_len: fragment_len & RM_FRAGMENT_LEN,
        }
    }

    /// Parse a raw 32-bit mark without any length policy
    pub fn from_u32(raw: u32) -> Self {
        Self {
            is_last: raw & RM_LAST_FRAGMENT != 0,
            fragment_len: raw & RM_FRAGMENT_LEN,
        }
    }

    pub fn to_u32(self) -> u32 {
        let flag = if self.is_last { RM_LAST_FRAGMENT } else { 0 };
        flag | self.fragment_len
    }

    /// Bytes occupied on the wire, record mark included
    pub fn wire_len(self) -> usize {
        RECORD_MARK_SIZE + self.fragment_len as usize
    }

    pub fn encode(self, buf: &mut BytesMut) {
        buf.put_u32(self.to_u32());
    }
}

/// Reads record marks and enforces the maximum fragment length
#[derive(Debug, Clone, Copy)]
pub struct RecordFramer {
    max_fragment_len: usize,
}

impl Default for RecordFramer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAGMENT_LEN)
    }
}

impl RecordFramer {
    pub fn new(max_fragment_len: usize) -> Self {
        Self { max_fragment_len }
    }

    pub fn max_fragment_len(&self) -> usize {
        self.max_fragment_len
    }

    /// Read the record mark at the start of `data`.
    ///
    /// Fails with `TruncatedHeader` on fewer than 4 bytes and with
    /// `OversizedFragment` when the announced length is above the limit.
    pub fn read_mark(&self, data: &[u8]) -> Result<RecordMark> {
        if data.len() < RECORD_MARK_SIZE {
            return Err(RpcError::TruncatedHeader {
                needed: RECORD_MARK_SIZE,
                have: data.len(),
            });
        }
        let raw = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        let mark = RecordMark::from_u32(raw);
        if mark.fragment_len as usize > self.max_fragment_len {
            return Err(RpcError::OversizedFragment {
                size: mark.fragment_len as usize,
                max: self.max_fragment_len,
            });
        }
        Ok(mark)
    }
}

/// Split `message` into record-marked fragments of at most
/// `max_fragment_len` payload bytes each.
///
/// An empty message still produces one (empty, last) fragment.
pub fn encode_record(message: &[u8], max_fragment_len: usize) -> Bytes {
    let max = max_fragment_len.clamp(1, RM_FRAGMENT_LEN as usize);
    let fragments = message.len().div_ceil(max).max(1);
    let mut buf = BytesMut::with_capacity(message.len() + fragments * RECORD_MARK_SIZE);

    let mut offset = 0;
    loop {
        let end = (offset + max).min(message.len());
        let is_last = end == message.len();
        RecordMark::new(is_last, (end - offset) as u32).encode(&mut buf);
        buf.put_slice(&message[offset..end]);
        offset = end;
        if is_last {
            break;
        }
    }

    buf.freeze()
}
