//! XDR arrays and optional data
//!
//! Variable-length arrays carry a 32-bit element count; optional data
//! (`*T` in XDR) is a boolean discriminant followed by the value.

use crate::{Result, XdrDecode, XdrEncode, XdrError, XdrReader, XdrWriter};

/// Decode a counted array of at most `max` elements.
///
/// Every XDR item is at least 4 bytes long, so a count that could not
/// possibly fit in the remaining input is rejected before allocating.
pub fn decode_array<T: XdrDecode>(reader: &mut XdrReader, max: usize) -> Result<Vec<T>> {
    let count = reader.get_length(max)?;
    if count > reader.remaining() / 4 {
        return Err(XdrError::BufferUnderflow {
            needed: count * 4,
            have: reader.remaining(),
        });
    }
    let mut items = Vec::with_capacity(count);
    for _ in 0..count {
        items.push(T::xdr_decode(reader)?);
    }
    Ok(items)
}

/// Encode a counted array
pub fn encode_array<T: XdrEncode>(writer: &mut XdrWriter, items: &[T]) {
    writer.put_u32(items.len() as u32);
    for item in items {
        item.xdr_encode(writer);
    }
}

impl<T: XdrEncode> XdrEncode for Vec<T> {
    fn xdr_encode(&self, writer: &mut XdrWriter) {
        encode_array(writer, self);
    }

    fn xdr_size(&self) -> usize {
        4 + self.iter().map(XdrEncode::xdr_size).sum::<usize>()
    }
}

impl<T: XdrDecode> XdrDecode for Vec<T> {
    fn xdr_decode(reader: &mut XdrReader) -> Result<Self> {
        decode_array(reader, usize::MAX)
    }
}

impl<T: XdrEncode> XdrEncode for Option<T> {
    fn xdr_encode(&self, writer: &mut XdrWriter) {
        match self {
            Some(value) => {
                writer.put_bool(true);
                value.xdr_encode(writer);
            }
            None => writer.put_bool(false),
        }
    }

    fn xdr_size(&self) -> usize {
        4 + self.as_ref().map_or(0, XdrEncode::xdr_size)
    }
}

impl<T: XdrDecode> XdrDecode for Option<T> {
    fn xdr_decode(reader: &mut XdrReader) -> Result<Self> {
        if reader.get_bool()? {
            Ok(Some(T::xdr_decode(reader)?))
        } else {
            Ok(None)
        }
    }
}
