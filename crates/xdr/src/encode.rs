//! XDR encoding trait

use crate::XdrWriter;

/// Trait for types that can be encoded to XDR format
pub trait XdrEncode {
    /// Append the encoded value, including trailing padding.
    fn xdr_encode(&self, writer: &mut XdrWriter);

    /// Encoded size in bytes, always a multiple of 4.
    fn xdr_size(&self) -> usize;
}
