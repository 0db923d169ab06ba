//! XDR decoding trait

use crate::{Result, XdrReader};

/// Trait for types that can be decoded from XDR format
pub trait XdrDecode: Sized {
    /// Decode a value, advancing the reader past it and its padding.
    fn xdr_decode(reader: &mut XdrReader) -> Result<Self>;
}
