//! Error types for ONC RPC framing and dissection

use thiserror::Error;
use xdr::XdrError;

/// Why a buffer was judged not to be ONC RPC
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NotRpcReason {
    #[error("unknown message type {0}")]
    UnknownMessageType(u32),

    #[error("unsupported RPC version {0}")]
    UnsupportedRpcVersion(u32),

    #[error("program {0} is not registered")]
    UnknownProgram(u32),

    #[error("reply does not match any call")]
    UnmatchedReply,

    #[error("reply_stat {0} is neither accepted nor denied")]
    InvalidReplyState(u32),
}

/// RPC error types
///
/// None of these are fatal to a capture session: each one describes a
/// single message that could not be framed or classified.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RpcError {
    #[error("not an ONC RPC message: {0}")]
    NotRpc(NotRpcReason),

    #[error("truncated header: needed {needed} bytes, have {have}")]
    TruncatedHeader { needed: usize, have: usize },

    #[error("fragment too large: {size} bytes exceeds maximum {max}")]
    OversizedFragment { size: usize, max: usize },

    #[error("malformed message: {0}")]
    Malformed(#[from] XdrError),
}

impl RpcError {
    /// True when the bytes are simply some other protocol
    pub fn is_not_rpc(&self) -> bool {
        matches!(self, RpcError::NotRpc(_) | RpcError::OversizedFragment { .. })
    }
}

impl From<NotRpcReason> for RpcError {
    fn from(reason: NotRpcReason) -> Self {
        RpcError::NotRpc(reason)
    }
}

/// Result type for ONC RPC operations
pub type Result<T> = std::result::Result<T, RpcError>;
