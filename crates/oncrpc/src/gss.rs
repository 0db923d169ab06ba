//! GSS-API security context tracking and RPCSEC_GSS wire structures
//!
//! RPCSEC_GSS (RFC 2203) and the older AUTH_GSSAPI flavor both establish
//! a context through control procedures before any application data
//! flows. The [`GssContextStore`] remembers, per context handle, the
//! frame that created it and the frame that destroyed it, so data calls
//! far away in the capture can point back to both.
//!
//! Only handles of up to [`MAX_TRACKED_CONTEXT_LEN`] bytes are tracked.
//! Longer handles still decode, they are simply never stored.

use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;
use tracing::debug;
use xdr::XdrReader;

use crate::conversation::FrameNumber;
use crate::error::Result;

/// Widest context handle kept in the store
pub const MAX_TRACKED_CONTEXT_LEN: usize = 16;

/// Largest GSS token accepted while decoding
pub const MAX_GSS_TOKEN_LEN: usize = 64 * 1024;

/// RPCSEC_GSS control procedure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GssProcedure {
    Data,
    Init,
    ContinueInit,
    Destroy,
    Other(u32),
}

impl GssProcedure {
    pub fn from_u32(value: u32) -> Self {
        match value {
            0 => Self::Data,
            1 => Self::Init,
            2 => Self::ContinueInit,
            3 => Self::Destroy,
            other => Self::Other(other),
        }
    }

    pub fn code(self) -> u32 {
        match self {
            Self::Data => 0,
            Self::Init => 1,
            Self::ContinueInit => 2,
            Self::Destroy => 3,
            Self::Other(code) => code,
        }
    }
}

/// RPCSEC_GSS protection service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GssService {
    None,
    Integrity,
    Privacy,
    Other(u32),
}

impl GssService {
    pub fn from_u32(value: u32) -> Self {
        match value {
            1 => Self::None,
            2 => Self::Integrity,
            3 => Self::Privacy,
            other => Self::Other(other),
        }
    }

    pub fn code(self) -> u32 {
        match self {
            Self::None => 1,
            Self::Integrity => 2,
            Self::Privacy => 3,
            Self::Other(code) => code,
        }
    }
}

/// RPCSEC_GSS credential body
///
/// ```text
/// version | gss_proc | seq_num | service | handle<>
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GssCredential {
    pub version: u32,
    pub procedure: GssProcedure,
    pub sequence: u32,
    pub service: GssService,
    pub context: Bytes,
}

impl GssCredential {
    pub fn decode(reader: &mut XdrReader) -> Result<Self> {
        Ok(Self {
            version: reader.get_u32()?,
            procedure: GssProcedure::from_u32(reader.get_u32()?),
            sequence: reader.get_u32()?,
            service: GssService::from_u32(reader.get_u32()?),
            context: reader.get_opaque(MAX_GSS_TOKEN_LEN)?,
        })
    }
}

/// Result of an RPCSEC_GSS init or continue-init call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GssInitResult {
    pub context: Bytes,
    pub major: u32,
    pub minor: u32,
    pub window: u32,
    pub token: Bytes,
}

impl GssInitResult {
    pub fn decode(reader: &mut XdrReader) -> Result<Self> {
        Ok(Self {
            context: reader.get_opaque(MAX_GSS_TOKEN_LEN)?,
            major: reader.get_u32()?,
            minor: reader.get_u32()?,
            window: reader.get_u32()?,
            token: reader.get_opaque(MAX_GSS_TOKEN_LEN)?,
        })
    }
}

/// Integrity-protected body
///
/// ```text
/// length | seq_num | procedure data (length - 4 bytes) | checksum<>
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrityEnvelope {
    pub sequence: u32,
    /// Procedure arguments or results, without the sequence number
    pub body: Bytes,
    pub checksum: Bytes,
}

impl IntegrityEnvelope {
    pub fn decode(reader: &mut XdrReader) -> Result<Self> {
        let length = reader.get_length(usize::MAX)?;
        let sequence = reader.get_u32()?;
        let body = reader.get_fixed_opaque(length.saturating_sub(4))?;
        let checksum = reader.get_opaque(MAX_GSS_TOKEN_LEN)?;
        Ok(Self {
            sequence,
            body,
            checksum,
        })
    }
}

/// AUTH_GSSAPI procedures, carried in the RPC procedure number of
/// control messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthGssApiProcedure {
    Exit,
    Init,
    ContinueInit,
    Message,
    Destroy,
    Other(u32),
}

impl AuthGssApiProcedure {
    pub fn from_u32(value: u32) -> Self {
        match value {
            0 => Self::Exit,
            1 => Self::Init,
            2 => Self::ContinueInit,
            3 => Self::Message,
            4 => Self::Destroy,
            other => Self::Other(other),
        }
    }
}

/// AUTH_GSSAPI credential body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthGssApiCredential {
    pub version: u32,
    /// Set on authentication control messages
    pub auth_message: bool,
    pub handle: Bytes,
}

impl AuthGssApiCredential {
    pub fn decode(reader: &mut XdrReader) -> Result<Self> {
        Ok(Self {
            version: reader.get_u32()?,
            auth_message: reader.get_u32()? != 0,
            handle: reader.get_opaque(MAX_GSS_TOKEN_LEN)?,
        })
    }
}

/// AUTH_GSSAPI init/continue-init arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthGssApiInitArg {
    pub version: u32,
    pub token: Bytes,
}

impl AuthGssApiInitArg {
    pub fn decode(reader: &mut XdrReader) -> Result<Self> {
        Ok(Self {
            version: reader.get_u32()?,
            token: reader.get_opaque(MAX_GSS_TOKEN_LEN)?,
        })
    }
}

/// AUTH_GSSAPI init/continue-init results
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthGssApiInitResult {
    pub version: u32,
    pub handle: Bytes,
    pub major: u32,
    pub minor: u32,
    pub token: Bytes,
    pub initial_sequence: Bytes,
}

impl AuthGssApiInitResult {
    pub fn decode(reader: &mut XdrReader) -> Result<Self> {
        Ok(Self {
            version: reader.get_u32()?,
            handle: reader.get_opaque(MAX_GSS_TOKEN_LEN)?,
            major: reader.get_u32()?,
            minor: reader.get_u32()?,
            token: reader.get_opaque(MAX_GSS_TOKEN_LEN)?,
            initial_sequence: reader.get_opaque(MAX_GSS_TOKEN_LEN)?,
        })
    }
}

/// Fixed-width context handle used as the store key
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct GssContextKey {
    len: u8,
    bytes: [u8; MAX_TRACKED_CONTEXT_LEN],
}

impl GssContextKey {
    /// `None` when the handle is too wide to track
    pub fn new(handle: &[u8]) -> Option<Self> {
        if handle.len() > MAX_TRACKED_CONTEXT_LEN {
            return None;
        }
        let mut bytes = [0u8; MAX_TRACKED_CONTEXT_LEN];
        bytes[..handle.len()].copy_from_slice(handle);
        Some(Self {
            len: handle.len() as u8,
            bytes,
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }
}

impl fmt::Debug for GssContextKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GssContextKey(")?;
        for byte in self.as_bytes() {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, ")")
    }
}

/// Where a context was created and destroyed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GssContextRecord {
    pub created_frame: Option<FrameNumber>,
    pub destroyed_frame: Option<FrameNumber>,
}

/// Capture-wide map of GSS context handles
#[derive(Debug, Default)]
pub struct GssContextStore {
    contexts: HashMap<GssContextKey, GssContextRecord>,
}

impl GssContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Note a context handle seen in `frame`.
    ///
    /// The first creation and the first destruction seen win. Handles
    /// wider than [`MAX_TRACKED_CONTEXT_LEN`] are ignored.
    pub fn on_context_seen(
        &mut self,
        token: &[u8],
        frame: FrameNumber,
        is_create: bool,
        is_destroy: bool,
    ) -> Option<GssContextRecord> {
        let key = GssContextKey::new(token)?;
        let record = self.contexts.entry(key).or_default();
        if is_create && record.created_frame.is_none() {
            debug!("GSS context {:?} created at frame {}", key, frame);
            record.created_frame = Some(frame);
        }
        if is_destroy && record.destroyed_frame.is_none() {
            debug!("GSS context {:?} destroyed at frame {}", key, frame);
            record.destroyed_frame = Some(frame);
        }
        Some(*record)
    }

    pub fn lookup(&self, token: &[u8]) -> Option<GssContextRecord> {
        let key = GssContextKey::new(token)?;
        self.contexts.get(&key).copied()
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }
}
