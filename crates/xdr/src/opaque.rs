//! XDR opaque data and string types
//!
//! Wire format:
//! ```text
//! length: u32
//! data[length]
//! padding to 4-byte alignment
//! ```

use bytes::Bytes;

use crate::{padded_len, Result, XdrDecode, XdrEncode, XdrError, XdrReader, XdrWriter};

/// Variable-length opaque data (`opaque<>`)
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Opaque(pub Bytes);

impl Opaque {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self(data.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Bytes {
        self.0
    }
}

impl From<Bytes> for Opaque {
    fn from(b: Bytes) -> Self {
        Self(b)
    }
}

impl XdrEncode for Opaque {
    fn xdr_encode(&self, writer: &mut XdrWriter) {
        writer.put_opaque(&self.0);
    }

    fn xdr_size(&self) -> usize {
        4 + padded_len(self.0.len())
    }
}

impl XdrDecode for Opaque {
    fn xdr_decode(reader: &mut XdrReader) -> Result<Self> {
        Ok(Self(reader.get_opaque(usize::MAX)?))
    }
}

/// Strictly UTF-8 string (`string<>`)
///
/// Use [`XdrReader::get_string`] instead when the peer may send arbitrary
/// bytes and a lossy conversion is acceptable.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct XdrString(pub String);

impl XdrString {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for XdrString {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl XdrEncode for XdrString {
    fn xdr_encode(&self, writer: &mut XdrWriter) {
        writer.put_string(&self.0);
    }

    fn xdr_size(&self) -> usize {
        4 + padded_len(self.0.len())
    }
}

impl XdrDecode for XdrString {
    fn xdr_decode(reader: &mut XdrReader) -> Result<Self> {
        let data = reader.get_opaque(usize::MAX)?;
        String::from_utf8(data.to_vec())
            .map(Self)
            .map_err(|e| XdrError::InvalidString(e.to_string()))
    }
}
