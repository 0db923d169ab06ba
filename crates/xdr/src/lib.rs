//! XDR (External Data Representation) runtime library
//!
//! This crate implements the XDR wire format from RFC 4506, the encoding
//! used by every ONC RPC message and program.
//!
//! # XDR Wire Format
//!
//! XDR is much simpler than most RPC encodings:
//! - Everything is big-endian
//! - Every item occupies a multiple of 4 bytes (opaque data and strings are
//!   zero-padded up to the next 4-byte boundary)
//! - Variable-length items (opaque data, strings, arrays) carry a 32-bit
//!   count in front of the payload
//! - Optional data is a 32-bit boolean followed by the value when true
//!
//! # Example
//!
//! ```rust
//! use xdr::{XdrReader, XdrWriter};
//!
//! let mut writer = XdrWriter::new();
//! writer.put_u32(100003);
//! writer.put_string("host");
//! let bytes = writer.into_bytes();
//! assert_eq!(bytes.len(), 12);
//!
//! let mut reader = XdrReader::new(bytes);
//! assert_eq!(reader.get_u32().unwrap(), 100003);
//! assert_eq!(reader.get_string(255).unwrap(), "host");
//! assert_eq!(reader.remaining(), 0);
//! ```

mod arrays;
mod decode;
mod encode;
mod error;
mod opaque;
mod primitives;
mod reader;
mod writer;

pub use arrays::{decode_array, encode_array};
pub use decode::XdrDecode;
pub use encode::XdrEncode;
pub use error::{Result, XdrError, MAX_XDR_ALLOCATION_SIZE};
pub use opaque::{Opaque, XdrString};
pub use reader::XdrReader;
pub use writer::XdrWriter;

/// Re-export bytes for convenience
pub use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Round `len` up to the next multiple of the 4-byte XDR unit.
#[inline]
pub fn padded_len(len: usize) -> usize {
    (len + 3) & !3
}

/// Number of zero bytes that follow `len` bytes of opaque data.
#[inline]
pub fn padding(len: usize) -> usize {
    padded_len(len) - len
}
