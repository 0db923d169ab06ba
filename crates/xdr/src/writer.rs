//! XDR writer

use bytes::{BufMut, Bytes, BytesMut};

use crate::{padding, XdrEncode};

/// Growable XDR output buffer
#[derive(Debug, Default, Clone)]
pub struct XdrWriter {
    buf: BytesMut,
}

impl XdrWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn put_u32(&mut self, value: u32) {
        self.buf.put_u32(value);
    }

    pub fn put_i32(&mut self, value: i32) {
        self.buf.put_i32(value);
    }

    pub fn put_u64(&mut self, value: u64) {
        self.buf.put_u64(value);
    }

    pub fn put_i64(&mut self, value: i64) {
        self.buf.put_i64(value);
    }

    pub fn put_bool(&mut self, value: bool) {
        self.buf.put_u32(value as u32);
    }

    /// Fixed-length opaque data followed by its padding
    pub fn put_fixed_opaque(&mut self, data: &[u8]) {
        self.buf.put_slice(data);
        self.buf.put_bytes(0, padding(data.len()));
    }

    /// Length-prefixed opaque data
    pub fn put_opaque(&mut self, data: &[u8]) {
        self.buf.put_u32(data.len() as u32);
        self.put_fixed_opaque(data);
    }

    pub fn put_string(&mut self, s: &str) {
        self.put_opaque(s.as_bytes());
    }

    /// Append bytes that are already XDR encoded
    pub fn put_raw(&mut self, data: &[u8]) {
        self.buf.put_slice(data);
    }

    /// Encode any [`XdrEncode`] value
    pub fn put<T: XdrEncode + ?Sized>(&mut self, value: &T) {
        value.xdr_encode(self);
    }

    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }

    pub fn into_inner(self) -> BytesMut {
        self.buf
    }
}
