//! Zero-copy XDR reader
//!
//! The reader wraps a [`Bytes`] handle, so opaque fields come back as
//! cheap slices of the original buffer instead of fresh allocations.

use bytes::{Buf, Bytes};

use crate::{padding, Result, XdrDecode, XdrError, MAX_XDR_ALLOCATION_SIZE};

/// Cursor over an XDR-encoded buffer
#[derive(Debug, Clone)]
pub struct XdrReader {
    buf: Bytes,
    total: usize,
}

impl XdrReader {
    /// Create a reader positioned at the start of `buf`
    pub fn new(buf: impl Into<Bytes>) -> Self {
        let buf = buf.into();
        let total = buf.len();
        Self { buf, total }
    }

    /// Bytes consumed so far
    #[inline]
    pub fn position(&self) -> usize {
        self.total - self.buf.len()
    }

    /// Bytes left to read
    #[inline]
    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Fail with `BufferUnderflow` unless `needed` bytes are available
    #[inline]
    pub fn ensure(&self, needed: usize) -> Result<()> {
        if self.buf.len() < needed {
            return Err(XdrError::BufferUnderflow {
                needed,
                have: self.buf.len(),
            });
        }
        Ok(())
    }

    /// Look at the next 32-bit word without consuming it
    pub fn peek_u32(&self) -> Option<u32> {
        if self.buf.len() < 4 {
            return None;
        }
        Some(u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]))
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        self.ensure(4)?;
        Ok(self.buf.get_u32())
    }

    pub fn get_i32(&mut self) -> Result<i32> {
        self.ensure(4)?;
        Ok(self.buf.get_i32())
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        self.ensure(8)?;
        Ok(self.buf.get_u64())
    }

    pub fn get_i64(&mut self) -> Result<i64> {
        self.ensure(8)?;
        Ok(self.buf.get_i64())
    }

    /// Read a boolean; anything other than 0 or 1 is rejected
    pub fn get_bool(&mut self) -> Result<bool> {
        match self.get_u32()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(XdrError::InvalidBool(other)),
        }
    }

    /// Read `len` bytes of fixed-length opaque data plus its padding
    pub fn get_fixed_opaque(&mut self, len: usize) -> Result<Bytes> {
        let pad = padding(len);
        self.ensure(len + pad)?;
        let data = self.buf.split_to(len);
        self.buf.advance(pad);
        Ok(data)
    }

    /// Read length-prefixed opaque data, rejecting lengths above `max`
    pub fn get_opaque(&mut self, max: usize) -> Result<Bytes> {
        let len = self.get_length(max)?;
        self.get_fixed_opaque(len)
    }

    /// Read a length-prefixed string.
    ///
    /// Bytes that are not valid UTF-8 are replaced rather than rejected,
    /// since machine names and netnames on the wire are not always clean.
    pub fn get_string(&mut self, max: usize) -> Result<String> {
        let data = self.get_opaque(max)?;
        Ok(String::from_utf8_lossy(&data).into_owned())
    }

    /// Read a 32-bit length prefix and check it against `max` and the
    /// bytes actually present.
    pub fn get_length(&mut self, max: usize) -> Result<usize> {
        let len = self.get_u32()? as usize;
        let max = max.min(MAX_XDR_ALLOCATION_SIZE);
        if len > max {
            return Err(XdrError::LengthTooLarge { len, max });
        }
        Ok(len)
    }

    /// Decode any [`XdrDecode`] value
    pub fn get<T: XdrDecode>(&mut self) -> Result<T> {
        T::xdr_decode(self)
    }

    /// Skip `n` bytes
    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.ensure(n)?;
        self.buf.advance(n);
        Ok(())
    }

    /// Split off the next `n` bytes as their own buffer
    pub fn split_to(&mut self, n: usize) -> Result<Bytes> {
        self.ensure(n)?;
        Ok(self.buf.split_to(n))
    }

    /// Take everything that is left
    pub fn take_rest(&mut self) -> Bytes {
        self.buf.split_off(0)
    }

    /// The unread bytes, without consuming them
    pub fn rest(&self) -> &Bytes {
        &self.buf
    }
}
