//! ONC RPC authentication flavors
//!
//! Every call carries a credential and a verifier, every accepted reply a
//! verifier. Each is an [`OpaqueAuth`]: a flavor number and a
//! length-prefixed body whose layout depends on the flavor. The
//! [`AuthDispatcher`] turns those bodies into [`Credential`] and
//! [`Verifier`] values. A flavor it does not understand, or a body that
//! does not parse, is kept as opaque bytes and never stops the rest of
//! the message from being dissected.
//!
//! Cryptography is out of scope: a [`SecurityLayer`] supplied by the
//! caller decrypts RPCSEC_GSS privacy payloads when it can.

use bytes::Bytes;
use tracing::{debug, trace};
use xdr::XdrReader;

use crate::conversation::FrameNumber;
use crate::error::Result;
use crate::gss::{
    AuthGssApiCredential, AuthGssApiProcedure, GssContextRecord, GssContextStore, GssCredential,
    GssProcedure, GssService,
};
use crate::message::{MessageType, OpaqueAuth};
use crate::session::PassMode;

/// Flavor numbers (RFC 1831, RFC 2203, RFC 2623 pseudo-flavors)
pub mod flavor {
    pub const AUTH_NULL: u32 = 0;
    pub const AUTH_UNIX: u32 = 1;
    pub const AUTH_SHORT: u32 = 2;
    pub const AUTH_DES: u32 = 3;
    pub const AUTH_RSA: u32 = 5;
    pub const RPCSEC_GSS: u32 = 6;
    pub const AUTH_GSSAPI: u32 = 300001;
    pub const RPCSEC_GSS_KRB5: u32 = 390003;
    pub const RPCSEC_GSS_KRB5I: u32 = 390004;
    pub const RPCSEC_GSS_KRB5P: u32 = 390005;
    pub const RPCSEC_GSS_LIPKEY: u32 = 390006;
    pub const RPCSEC_GSS_LIPKEY_I: u32 = 390007;
    pub const RPCSEC_GSS_LIPKEY_P: u32 = 390008;
    pub const RPCSEC_GSS_SPKM3: u32 = 390009;
    pub const RPCSEC_GSS_SPKM3I: u32 = 390010;
    pub const RPCSEC_GSS_SPKM3P: u32 = 390011;
    pub const AUTH_GLUSTERFS: u32 = 390039;
}

/// Display name of a flavor number
pub fn flavor_name(code: u32) -> String {
    let name = match code {
        flavor::AUTH_NULL => "AUTH_NULL",
        flavor::AUTH_UNIX => "AUTH_UNIX",
        flavor::AUTH_SHORT => "AUTH_SHORT",
        flavor::AUTH_DES => "AUTH_DES",
        flavor::AUTH_RSA => "AUTH_RSA/Gluster",
        flavor::RPCSEC_GSS => "RPCSEC_GSS",
        flavor::AUTH_GSSAPI => "AUTH_GSSAPI",
        flavor::RPCSEC_GSS_KRB5 => "RPCSEC_GSS_KRB5",
        flavor::RPCSEC_GSS_KRB5I => "RPCSEC_GSS_KRB5I",
        flavor::RPCSEC_GSS_KRB5P => "RPCSEC_GSS_KRB5P",
        flavor::RPCSEC_GSS_LIPKEY => "RPCSEC_GSS_LIPKEY",
        flavor::RPCSEC_GSS_LIPKEY_I => "RPCSEC_GSS_LIPKEY_I",
        flavor::RPCSEC_GSS_LIPKEY_P => "RPCSEC_GSS_LIPKEY_P",
        flavor::RPCSEC_GSS_SPKM3 => "RPCSEC_GSS_SPKM3",
        flavor::RPCSEC_GSS_SPKM3I => "RPCSEC_GSS_SPKM3I",
        flavor::RPCSEC_GSS_SPKM3P => "RPCSEC_GSS_SPKM3P",
        flavor::AUTH_GLUSTERFS => "AUTH_GLUSTERFS",
        other => return format!("Unknown ({})", other),
    };
    name.to_string()
}

/// How the payload of a call (and its reply) must be handled, decided
/// from the call's credential and stored on the call record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlavorClass {
    /// No call seen, or the credential could not be read
    #[default]
    Unknown,
    /// Plain payload
    NotGss,
    /// RPCSEC_GSS with known procedure and service
    Gss {
        procedure: GssProcedure,
        service: GssService,
    },
    /// RPCSEC_GSS whose credential was too short to say more
    GssNoInfo,
    /// AUTH_GSSAPI application call; the payload is always sealed
    AuthGssApi,
    /// AUTH_GSSAPI control message
    AuthGssApiMsg { procedure: AuthGssApiProcedure },
}

impl FlavorClass {
    /// Classify a call from its credential envelope and RPC procedure
    /// number.
    pub fn classify(credential: &OpaqueAuth, rpc_procedure: u32) -> Self {
        let body = &credential.body;
        let word = |at: usize| u32::from_be_bytes([body[at], body[at + 1], body[at + 2], body[at + 3]]);
        match credential.flavor {
            flavor::RPCSEC_GSS if body.len() >= 16 => FlavorClass::Gss {
                procedure: GssProcedure::from_u32(word(4)),
                service: GssService::from_u32(word(12)),
            },
            flavor::RPCSEC_GSS => FlavorClass::GssNoInfo,
            flavor::AUTH_GSSAPI if body.len() >= 8 => {
                if word(4) != 0 {
                    FlavorClass::AuthGssApiMsg {
                        procedure: AuthGssApiProcedure::from_u32(rpc_procedure),
                    }
                } else {
                    FlavorClass::AuthGssApi
                }
            }
            flavor::AUTH_GSSAPI => FlavorClass::Unknown,
            _ => FlavorClass::NotGss,
        }
    }

    /// RPCSEC_GSS destroy calls carry no verifier
    pub fn omits_call_verifier(self) -> bool {
        matches!(
            self,
            FlavorClass::Gss {
                procedure: GssProcedure::Destroy,
                ..
            }
        )
    }
}

/// AUTH_UNIX (AUTH_SYS) credential
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnixCredential {
    pub stamp: u32,
    pub machine_name: String,
    pub uid: u32,
    pub gid: u32,
    pub gids: Vec<u32>,
}

impl UnixCredential {
    /// Machine names are at most 255 bytes, group lists at most 16 long
    pub fn decode(reader: &mut XdrReader) -> Result<Self> {
        Ok(Self {
            stamp: reader.get_u32()?,
            machine_name: reader.get_string(255)?,
            uid: reader.get_u32()?,
            gid: reader.get_u32()?,
            gids: xdr::decode_array(reader, 16)?,
        })
    }
}

/// AUTH_DES credential
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DesCredential {
    FullName {
        netname: String,
        /// Encrypted conversation key
        conversation_key: u64,
        window: u32,
    },
    Nickname(u32),
}

impl DesCredential {
    pub fn decode(reader: &mut XdrReader) -> Result<Option<Self>> {
        Ok(match reader.get_u32()? {
            0 => Some(DesCredential::FullName {
                netname: reader.get_string(255)?,
                conversation_key: reader.get_u64()?,
                window: reader.get_u32()?,
            }),
            1 => Some(DesCredential::Nickname(reader.get_u32()?)),
            _ => None,
        })
    }
}

/// Decoded credential
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    Null,
    Unix(UnixCredential),
    /// Server-issued shorthand for an earlier credential
    Short(Bytes),
    Des(DesCredential),
    Gss(GssCredential),
    GssApi(AuthGssApiCredential),
    /// Unknown flavor or unparseable body, preserved as is
    Opaque { flavor: u32, body: Bytes },
}

/// Decoded verifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verifier {
    Null,
    Unix(UnixCredential),
    /// Call side: encrypted timestamp and window verifier
    DesCall { timestamp: u64, window: u32 },
    /// Reply side: encrypted timestamp verifier and nickname
    DesReply { timestamp: u64, nickname: u32 },
    /// RPCSEC_GSS MIC over the header
    GssToken(Bytes),
    Opaque { flavor: u32, body: Bytes },
}

/// Credential plus what the GSS context store knows about it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedCredential {
    pub credential: Credential,
    pub context: Option<GssContextRecord>,
}

/// External component that owns GSS-API key material
pub trait SecurityLayer: Send + Sync {
    /// Unwrap an RPCSEC_GSS privacy token. `None` when the context or
    /// keys are not available.
    fn decrypt(&self, token: &[u8]) -> Option<Bytes>;

    /// Check an integrity checksum over `data`. `None` means unknown.
    fn verify_mic(&self, _data: &[u8], _checksum: &[u8]) -> Option<bool> {
        None
    }
}

/// Decodes credential and verifier bodies by flavor
#[derive(Debug, Default, Clone, Copy)]
pub struct AuthDispatcher;

impl AuthDispatcher {
    pub fn new() -> Self {
        Self
    }

    /// Interpret a credential body. Never fails: anything that does not
    /// parse comes back as [`Credential::Opaque`].
    pub fn parse_credential(&self, auth: &OpaqueAuth) -> Credential {
        let mut reader = XdrReader::new(auth.body.clone());
        let parsed = match auth.flavor {
            flavor::AUTH_NULL => Ok(Some(Credential::Null)),
            flavor::AUTH_UNIX => UnixCredential::decode(&mut reader).map(|c| Some(Credential::Unix(c))),
            flavor::AUTH_SHORT => Ok(Some(Credential::Short(auth.body.clone()))),
            flavor::AUTH_DES => DesCredential::decode(&mut reader).map(|c| c.map(Credential::Des)),
            flavor::RPCSEC_GSS => GssCredential::decode(&mut reader).map(|c| Some(Credential::Gss(c))),
            flavor::AUTH_GSSAPI => {
                AuthGssApiCredential::decode(&mut reader).map(|c| Some(Credential::GssApi(c)))
            }
            _ => Ok(None),
        };
        match parsed {
            Ok(Some(credential)) => credential,
            Ok(None) => {
                trace!("Keeping {} credential opaque", flavor_name(auth.flavor));
                opaque_credential(auth)
            }
            Err(e) => {
                debug!("Malformed {} credential: {}", flavor_name(auth.flavor), e);
                opaque_credential(auth)
            }
        }
    }

    /// Interpret a credential and, for RPCSEC_GSS, record its context
    /// handle. Only the first pass writes to `contexts`.
    pub fn decode_credential(
        &self,
        auth: &OpaqueAuth,
        frame: FrameNumber,
        mode: PassMode,
        contexts: &mut GssContextStore,
    ) -> DecodedCredential {
        let credential = self.parse_credential(auth);
        let context = match &credential {
            Credential::Gss(gss) if !gss.context.is_empty() => match mode {
                PassMode::FirstPass => {
                    let is_create =
                        matches!(gss.procedure, GssProcedure::Init | GssProcedure::ContinueInit);
                    let is_destroy = gss.procedure == GssProcedure::Destroy;
                    contexts.on_context_seen(&gss.context, frame, is_create, is_destroy)
                }
                PassMode::Replay => contexts.lookup(&gss.context),
            },
            _ => None,
        };
        DecodedCredential {
            credential,
            context,
        }
    }

    /// Interpret a verifier. AUTH_DES verifiers differ between calls and
    /// replies, hence `msg_type`.
    pub fn decode_verifier(&self, auth: &OpaqueAuth, msg_type: MessageType) -> Verifier {
        let mut reader = XdrReader::new(auth.body.clone());
        let parsed: Result<Option<Verifier>> = match auth.flavor {
            flavor::AUTH_NULL => Ok(Some(Verifier::Null)),
            flavor::AUTH_UNIX => UnixCredential::decode(&mut reader).map(|c| Some(Verifier::Unix(c))),
            flavor::AUTH_DES => decode_des_verifier(&mut reader, msg_type).map(Some),
            flavor::RPCSEC_GSS => Ok(Some(Verifier::GssToken(auth.body.clone()))),
            _ => Ok(None),
        };
        match parsed {
            Ok(Some(verifier)) => verifier,
            Ok(None) => opaque_verifier(auth),
            Err(e) => {
                debug!("Malformed {} verifier: {}", flavor_name(auth.flavor), e);
                opaque_verifier(auth)
            }
        }
    }
}

fn decode_des_verifier(reader: &mut XdrReader, msg_type: MessageType) -> Result<Verifier> {
    let timestamp = reader.get_u64()?;
    let word = reader.get_u32()?;
    Ok(match msg_type {
        MessageType::Call => Verifier::DesCall {
            timestamp,
            window: word,
        },
        MessageType::Reply => Verifier::DesReply {
            timestamp,
            nickname: word,
        },
    })
}

fn opaque_credential(auth: &OpaqueAuth) -> Credential {
    Credential::Opaque {
        flavor: auth.flavor,
        body: auth.body.clone(),
    }
}

fn opaque_verifier(auth: &OpaqueAuth) -> Verifier {
    Verifier::Opaque {
        flavor: auth.flavor,
        body: auth.body.clone(),
    }
}
