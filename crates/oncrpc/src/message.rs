//! ONC RPC message headers (RFC 1831 section 8)
//!
//! ```text
//! rpc_msg:    xid | msg_type
//! call_body:  rpcvers(=2) | prog | vers | proc | cred | verf
//! reply_body: reply_stat
//!   MSG_ACCEPTED: verf | accept_stat [| low | high for PROG_MISMATCH]
//!   MSG_DENIED:   reject_stat [| low | high for RPC_MISMATCH]
//!                             [| auth_stat for AUTH_ERROR]
//! opaque_auth: flavor | length | body (padded to 4 bytes)
//! ```

use std::fmt;

use bytes::Bytes;
use xdr::{XdrReader, XdrWriter};

use crate::error::{NotRpcReason, Result, RpcError};
use crate::registry::ProcedureKey;

/// The only RPC protocol version in use
pub const RPC_VERSION: u32 = 2;

/// Largest credential or verifier body accepted
pub const MAX_AUTH_BYTES: usize = 4096;

/// Bytes needed to classify a message: xid and msg_type
pub const MESSAGE_HEADER_SIZE: usize = 8;

/// Message type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageType {
    Call = 0,
    Reply = 1,
}

impl MessageType {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Call),
            1 => Some(Self::Reply),
            _ => None,
        }
    }
}

/// Read the XID and message type at the start of `data`
pub fn classify(data: &[u8]) -> Result<(u32, MessageType)> {
    if data.len() < MESSAGE_HEADER_SIZE {
        return Err(RpcError::TruncatedHeader {
            needed: MESSAGE_HEADER_SIZE,
            have: data.len(),
        });
    }
    let xid = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
    let msg_type = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    let msg_type = MessageType::from_u32(msg_type)
        .ok_or(RpcError::NotRpc(NotRpcReason::UnknownMessageType(msg_type)))?;
    Ok((xid, msg_type))
}

/// Bytes [`plausible_message_start`] needs before it can judge a buffer
pub const MESSAGE_START_CHECK_LEN: usize = 12;

/// Cheap check used to tell a message's first fragment from a
/// continuation: a call needs RPC version 2, a reply a valid reply_stat.
pub fn plausible_message_start(data: &[u8]) -> bool {
    check_message_start(data).is_ok()
}

/// Like [`plausible_message_start`], but says why `data` was rejected
pub fn check_message_start(data: &[u8]) -> Result<()> {
    if data.len() < MESSAGE_START_CHECK_LEN {
        return Err(RpcError::TruncatedHeader {
            needed: MESSAGE_START_CHECK_LEN,
            have: data.len(),
        });
    }
    let word = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);
    match classify(data)? {
        (_, MessageType::Call) if word != RPC_VERSION => Err(NotRpcReason::UnsupportedRpcVersion(word).into()),
        (_, MessageType::Reply) if word > 1 => Err(NotRpcReason::InvalidReplyState(word).into()),
        _ => Ok(()),
    }
}

/// Credential or verifier envelope
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OpaqueAuth {
    pub flavor: u32,
    pub body: Bytes,
}

impl OpaqueAuth {
    pub fn new(flavor: u32, body: impl Into<Bytes>) -> Self {
        Self {
            flavor,
            body: body.into(),
        }
    }

    /// AUTH_NULL with an empty body
    pub fn null() -> Self {
        Self::default()
    }

    pub fn decode(reader: &mut XdrReader) -> Result<Self> {
        let flavor = reader.get_u32()?;
        let body = reader.get_opaque(MAX_AUTH_BYTES)?;
        Ok(Self { flavor, body })
    }

    pub fn encode(&self, writer: &mut XdrWriter) {
        writer.put_u32(self.flavor);
        writer.put_opaque(&self.body);
    }
}

/// Fixed part of a call body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallHeader {
    pub xid: u32,
    pub procedure: ProcedureKey,
    pub credential: OpaqueAuth,
    /// Absent for RPCSEC_GSS destroy calls
    pub verifier: Option<OpaqueAuth>,
}

impl CallHeader {
    pub fn new(xid: u32, procedure: ProcedureKey) -> Self {
        Self {
            xid,
            procedure,
            credential: OpaqueAuth::null(),
            verifier: Some(OpaqueAuth::null()),
        }
    }

    pub fn with_credential(mut self, credential: OpaqueAuth) -> Self {
        self.credential = credential;
        self
    }

    pub fn with_verifier(mut self, verifier: Option<OpaqueAuth>) -> Self {
        self.verifier = verifier;
        self
    }

    /// Read rpcvers, program, version and procedure.
    ///
    /// The reader must be positioned just after msg_type.
    pub fn decode_procedure(reader: &mut XdrReader) -> Result<ProcedureKey> {
        let rpcvers = reader.get_u32()?;
        if rpcvers != RPC_VERSION {
            return Err(RpcError::NotRpc(NotRpcReason::UnsupportedRpcVersion(rpcvers)));
        }
        let program = reader.get_u32()?;
        let version = reader.get_u32()?;
        let procedure = reader.get_u32()?;
        Ok(ProcedureKey::new(program, version, procedure))
    }

    /// Encode the complete header, starting with the XID
    pub fn encode(&self, writer: &mut XdrWriter) {
        writer.put_u32(self.xid);
        writer.put_u32(MessageType::Call as u32);
        writer.put_u32(RPC_VERSION);
        writer.put_u32(self.procedure.program);
        writer.put_u32(self.procedure.version);
        writer.put_u32(self.procedure.procedure);
        self.credential.encode(writer);
        if let Some(verifier) = &self.verifier {
            verifier.encode(writer);
        }
    }
}

/// Status of an accepted call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptStatus {
    Success,
    ProgramUnavailable,
    ProgramMismatch { low: u32, high: u32 },
    ProcedureUnavailable,
    GarbageArgs,
    SystemError,
    Other(u32),
}

impl AcceptStatus {
    pub fn code(self) -> u32 {
        match self {
            Self::Success => 0,
            Self::ProgramUnavailable => 1,
            Self::ProgramMismatch { .. } => 2,
            Self::ProcedureUnavailable => 3,
            Self::GarbageArgs => 4,
            Self::SystemError => 5,
            Self::Other(code) => code,
        }
    }

    fn decode(reader: &mut XdrReader) -> Result<Self> {
        Ok(match reader.get_u32()? {
            0 => Self::Success,
            1 => Self::ProgramUnavailable,
            2 => Self::ProgramMismatch {
                low: reader.get_u32()?,
                high: reader.get_u32()?,
            },
            3 => Self::ProcedureUnavailable,
            4 => Self::GarbageArgs,
            5 => Self::SystemError,
            other => Self::Other(other),
        })
    }
}

impl fmt::Display for AcceptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "RPC executed successfully"),
            Self::ProgramUnavailable => write!(f, "remote hasn't exported program"),
            Self::ProgramMismatch { low, high } => {
                write!(f, "remote can't support version # (supports {}..{})", low, high)
            }
            Self::ProcedureUnavailable => write!(f, "program can't support procedure"),
            Self::GarbageArgs => write!(f, "procedure can't decode params"),
            Self::SystemError => write!(f, "system error"),
            Self::Other(code) => write!(f, "unknown accept status {}", code),
        }
    }
}

/// Authentication failure reasons
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStat {
    Ok,
    BadCredential,
    RejectedCredential,
    BadVerifier,
    RejectedVerifier,
    TooWeak,
    InvalidResponse,
    Failed,
    GssCredentialProblem,
    GssContextProblem,
    Other(u32),
}

impl AuthStat {
    pub fn from_u32(value: u32) -> Self {
        match value {
            0 => Self::Ok,
            1 => Self::BadCredential,
            2 => Self::RejectedCredential,
            3 => Self::BadVerifier,
            4 => Self::RejectedVerifier,
            5 => Self::TooWeak,
            6 => Self::InvalidResponse,
            7 => Self::Failed,
            13 => Self::GssCredentialProblem,
            14 => Self::GssContextProblem,
            other => Self::Other(other),
        }
    }

    pub fn code(self) -> u32 {
        match self {
            Self::Ok => 0,
            Self::BadCredential => 1,
            Self::RejectedCredential => 2,
            Self::BadVerifier => 3,
            Self::RejectedVerifier => 4,
            Self::TooWeak => 5,
            Self::InvalidResponse => 6,
            Self::Failed => 7,
            Self::GssCredentialProblem => 13,
            Self::GssContextProblem => 14,
            Self::Other(code) => code,
        }
    }
}

/// Reason a call was denied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectStatus {
    RpcMismatch { low: u32, high: u32 },
    AuthError(AuthStat),
    Other(u32),
}

impl RejectStatus {
    fn decode(reader: &mut XdrReader) -> Result<Self> {
        Ok(match reader.get_u32()? {
            0 => Self::RpcMismatch {
                low: reader.get_u32()?,
                high: reader.get_u32()?,
            },
            1 => Self::AuthError(AuthStat::from_u32(reader.get_u32()?)),
            other => Self::Other(other),
        })
    }
}

/// Reply body up to, not including, the procedure results
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyBody {
    Accepted {
        verifier: OpaqueAuth,
        status: AcceptStatus,
    },
    Denied(RejectStatus),
    /// reply_stat other than accepted or denied
    Unknown(u32),
}

impl ReplyBody {
    /// Decode the reply body; the reader must be positioned after msg_type
    pub fn decode(reader: &mut XdrReader) -> Result<Self> {
        Ok(match reader.get_u32()? {
            0 => {
                let verifier = OpaqueAuth::decode(reader)?;
                let status = AcceptStatus::decode(reader)?;
                Self::Accepted { verifier, status }
            }
            1 => Self::Denied(RejectStatus::decode(reader)?),
            other => Self::Unknown(other),
        })
    }

    pub fn is_success(&self) -> bool {
        matches!(
            self,
            Self::Accepted {
                status: AcceptStatus::Success,
                ..
            }
        )
    }

    /// Encode the complete reply header, starting with the XID
    pub fn encode(&self, xid: u32, writer: &mut XdrWriter) {
        writer.put_u32(xid);
        writer.put_u32(MessageType::Reply as u32);
        match self {
            Self::Accepted { verifier, status } => {
                writer.put_u32(0);
                verifier.encode(writer);
                writer.put_u32(status.code());
                if let AcceptStatus::ProgramMismatch { low, high } = status {
                    writer.put_u32(*low);
                    writer.put_u32(*high);
                }
            }
            Self::Denied(reject) => {
                writer.put_u32(1);
                match reject {
                    RejectStatus::RpcMismatch { low, high } => {
                        writer.put_u32(0);
                        writer.put_u32(*low);
                        writer.put_u32(*high);
                    }
                    RejectStatus::AuthError(stat) => {
                        writer.put_u32(1);
                        writer.put_u32(stat.code());
                    }
                    RejectStatus::Other(code) => writer.put_u32(*code),
                }
            }
            Self::Unknown(code) => writer.put_u32(*code),
        }
    }
}

/// Build a complete call message
pub fn encode_call(header: &CallHeader, args: &[u8]) -> Bytes {
    let mut writer = XdrWriter::with_capacity(64 + args.len());
    header.encode(&mut writer);
    writer.put_raw(args);
    writer.into_bytes()
}

/// Build a complete reply message
pub fn encode_reply(xid: u32, body: &ReplyBody, results: &[u8]) -> Bytes {
    let mut writer = XdrWriter::with_capacity(32 + results.len());
    body.encode(xid, &mut writer);
    writer.put_raw(results);
    writer.into_bytes()
}
