//! XDR error types

use thiserror::Error;

/// Largest count accepted for a single variable-length item.
///
/// Counts above this are rejected before any allocation happens.
pub const MAX_XDR_ALLOCATION_SIZE: usize = 16 * 1024 * 1024;

/// XDR encoding/decoding errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum XdrError {
    /// Buffer underflow - not enough data
    #[error("buffer underflow: needed {needed} bytes, have {have}")]
    BufferUnderflow { needed: usize, have: usize },

    /// A length or count prefix exceeds the permitted maximum
    #[error("length {len} exceeds maximum {max}")]
    LengthTooLarge { len: usize, max: usize },

    /// Boolean encoded as something other than 0 or 1
    #[error("invalid boolean value: {0}")]
    InvalidBool(u32),

    /// String is not valid UTF-8
    #[error("invalid string: {0}")]
    InvalidString(String),
}

/// Result type for XDR operations
pub type Result<T> = std::result::Result<T, XdrError>;
