//! XDR primitive type implementations
//!
//! | XDR Type         | Rust Type | Size |
//! |------------------|-----------|------|
//! | int              | i32       | 4    |
//! | unsigned int     | u32       | 4    |
//! | hyper            | i64       | 8    |
//! | unsigned hyper   | u64       | 8    |
//! | bool             | bool      | 4    |
//! | void             | ()        | 0    |

use crate::{Result, XdrDecode, XdrEncode, XdrReader, XdrWriter};

macro_rules! impl_xdr_primitive {
    ($ty:ty, $size:expr, $put:ident, $get:ident) => {
        impl XdrEncode for $ty {
            fn xdr_encode(&self, writer: &mut XdrWriter) {
                writer.$put(*self);
            }

            fn xdr_size(&self) -> usize {
                $size
            }
        }

        impl XdrDecode for $ty {
            fn xdr_decode(reader: &mut XdrReader) -> Result<Self> {
                reader.$get()
            }
        }
    };
}

impl_xdr_primitive!(u32, 4, put_u32, get_u32);
impl_xdr_primitive!(i32, 4, put_i32, get_i32);
impl_xdr_primitive!(u64, 8, put_u64, get_u64);
impl_xdr_primitive!(i64, 8, put_i64, get_i64);
impl_xdr_primitive!(bool, 4, put_bool, get_bool);

impl XdrEncode for () {
    fn xdr_encode(&self, _writer: &mut XdrWriter) {}

    fn xdr_size(&self) -> usize {
        0
    }
}

impl XdrDecode for () {
    fn xdr_decode(_reader: &mut XdrReader) -> Result<Self> {
        Ok(())
    }
}
