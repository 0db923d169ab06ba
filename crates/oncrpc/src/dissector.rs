//! Message dissection
//!
//! A framed message moves through four steps:
//!
//! ```text
//! classify (xid, msg_type)
//!   -> header + auth (call: rpcvers/prog/vers/proc, cred, verf;
//!                     reply: correlate by XID, reply_stat, verf, accept_stat)
//!   -> resolve (program, version, procedure) in the registry
//!   -> payload (plain, integrity, privacy, or auth control message)
//! ```
//!
//! A buffer that is not RPC fails in the first step. Everything after the
//! headers degrades instead of failing: an unknown flavor or procedure, a
//! rejected call, a routine that cannot decode its input or a privacy
//! payload nobody can decrypt all end as [`Outcome::DissectedAsOpaque`]
//! with the payload bytes untouched.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, trace};
use xdr::{Opaque, XdrReader};

use crate::call_table::{Annotation, CallRecord, CallTable, Correlation};
use crate::conversation::{ConversationId, FrameNumber, PacketInfo};
use crate::error::Result;
use crate::gss::{
    AuthGssApiInitArg, AuthGssApiInitResult, AuthGssApiProcedure, GssContextRecord,
    GssContextStore, GssInitResult, GssProcedure, GssService, IntegrityEnvelope, MAX_GSS_TOKEN_LEN,
};
use crate::message::{
    classify, AcceptStatus, CallHeader, MessageType, OpaqueAuth, ReplyBody, MESSAGE_HEADER_SIZE,
};
use crate::registry::{CodecContext, ProcedureKey, ProcedureRegistry, Value};
use crate::security::{AuthDispatcher, DecodedCredential, FlavorClass, SecurityLayer, Verifier};
use crate::session::PassMode;

/// Why a payload was left undecoded
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpaqueReason {
    /// No routine registered for the procedure, or no call to tell which
    UnknownProcedure,
    /// Flavor of the originating call is not known
    UnknownFlavor,
    /// RPCSEC_GSS credential too short to carry procedure and service
    GssNoInfo,
    /// AUTH_GSSAPI application data is always sealed
    Sealed,
    /// Privacy payload that the security layer could not decrypt
    Undecryptable,
    /// Accepted reply with a status other than success
    NotSuccessful,
    /// Denied reply
    Denied,
    /// reply_stat other than accepted or denied
    InvalidReplyState,
    /// The registered routine rejected its input
    DecodeFailed(String),
}

/// Authentication-level control message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    GssInitArg { token: Bytes },
    GssInitResult {
        result: GssInitResult,
        context: Option<GssContextRecord>,
    },
    GssDestroy,
    AuthGssApiInitArg(AuthGssApiInitArg),
    AuthGssApiInitResult(AuthGssApiInitResult),
    AuthGssApiDestroy { data: Bytes },
    AuthGssApiExit,
}

/// Decoded payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Output of the registered routine
    Value(Value),
    /// Routine output wrapped in an RPCSEC_GSS integrity envelope
    Integrity {
        sequence: u32,
        value: Value,
        checksum: Bytes,
        verified: Option<bool>,
    },
    /// Routine output recovered from an RPCSEC_GSS privacy envelope
    Privacy { sequence: u32, value: Value },
    Control(ControlMessage),
}

/// Terminal state of a dissection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Dissected {
        payload: Payload,
        /// Bytes left over after the payload
        trailing: Bytes,
    },
    DissectedAsOpaque { reason: OpaqueReason, bytes: Bytes },
}

impl Outcome {
    pub fn is_opaque(&self) -> bool {
        matches!(self, Outcome::DissectedAsOpaque { .. })
    }

    fn opaque(reason: OpaqueReason, bytes: Bytes) -> Self {
        Outcome::DissectedAsOpaque { reason, bytes }
    }
}

/// Header fields specific to the message type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Header {
    Call {
        credential: DecodedCredential,
        /// Absent for RPCSEC_GSS destroy calls
        verifier: Option<Verifier>,
    },
    Reply {
        body: ReplyBody,
        verifier: Option<Verifier>,
    },
}

/// Everything learned from one message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dissection {
    pub frame: FrameNumber,
    pub conversation: ConversationId,
    pub xid: u32,
    pub msg_type: MessageType,
    /// For replies, inherited from the call
    pub procedure: Option<ProcedureKey>,
    pub program_name: Option<String>,
    pub procedure_name: Option<String>,
    pub flavor: FlavorClass,
    pub header: Header,
    pub request_frame: Option<FrameNumber>,
    pub reply_frame: Option<FrameNumber>,
    /// Reply time minus call time
    pub response_time: Option<Duration>,
    pub annotations: Vec<Annotation>,
    pub outcome: Outcome,
}

impl Dissection {
    pub fn is_call(&self) -> bool {
        self.msg_type == MessageType::Call
    }

    pub fn is_duplicate(&self) -> bool {
        !self.annotations.is_empty()
    }
}

/// Mutable state a dissection may touch
pub struct DissectionState<'a> {
    pub conversation: ConversationId,
    pub calls: &'a mut CallTable,
    pub contexts: &'a mut GssContextStore,
    pub mode: PassMode,
}

/// Top-level message orchestrator
pub struct MessageDissector {
    registry: Arc<ProcedureRegistry>,
    auth: AuthDispatcher,
    security: Option<Arc<dyn SecurityLayer>>,
}

impl MessageDissector {
    pub fn new(registry: Arc<ProcedureRegistry>) -> Self {
        Self {
            registry,
            auth: AuthDispatcher::new(),
            security: None,
        }
    }

    pub fn with_security_layer(mut self, layer: Arc<dyn SecurityLayer>) -> Self {
        self.security = Some(layer);
        self
    }

    pub fn registry(&self) -> &ProcedureRegistry {
        &self.registry
    }

    /// Dissect one complete message.
    ///
    /// Only `NotRpc`, `TruncatedHeader` and `Malformed` header errors are
    /// returned; payload problems end up in the [`Outcome`].
    pub fn dissect(
        &self,
        message: Bytes,
        info: &PacketInfo,
        state: DissectionState<'_>,
    ) -> Result<Dissection> {
        let (xid, msg_type) = classify(&message)?;
        let mut reader = XdrReader::new(message);
        reader.skip(MESSAGE_HEADER_SIZE)?;

        match msg_type {
            MessageType::Call => self.dissect_call(xid, reader, info, state),
            MessageType::Reply => self.dissect_reply(xid, reader, info, state),
        }
    }

    fn dissect_call(
        &self,
        xid: u32,
        mut reader: XdrReader,
        info: &PacketInfo,
        state: DissectionState<'_>,
    ) -> Result<Dissection> {
        let key = CallHeader::decode_procedure(&mut reader)?;
        let credential_auth = OpaqueAuth::decode(&mut reader)?;
        let flavor = FlavorClass::classify(&credential_auth, key.procedure);

        let correlation = match state.mode {
            PassMode::FirstPass => {
                state
                    .calls
                    .register_call(xid, key, flavor, info.frame, info.timestamp)
            }
            PassMode::Replay => state
                .calls
                .observe_call(xid, info.frame)
                .unwrap_or_else(|| Correlation {
                    record: CallRecord::call(xid, key, flavor, info.frame, info.timestamp),
                    annotation: None,
                }),
        };

        let credential =
            self.auth
                .decode_credential(&credential_auth, info.frame, state.mode, state.contexts);
        let verifier = if flavor.omits_call_verifier() {
            None
        } else {
            let auth = OpaqueAuth::decode(&mut reader)?;
            Some(self.auth.decode_verifier(&auth, MessageType::Call))
        };

        trace!(
            "Call xid={:#x} {} flavor {:?} at frame {}",
            xid,
            key,
            flavor,
            info.frame
        );

        let mut ctx = CodecContext::new(&self.registry, &correlation.record, info.frame);
        let outcome = self.dissect_payload(
            MessageType::Call,
            flavor,
            Some(key),
            &mut reader,
            &mut ctx,
            info.frame,
            state.mode,
            state.contexts,
        );
        let stash = ctx.take_stash();
        let indirect = ctx.take_indirect();
        if let (PassMode::FirstPass, None) = (state.mode, correlation.annotation) {
            if let Some(value) = stash {
                state.calls.set_carry(xid, value);
            }
            if let Some(target) = indirect {
                state.calls.set_indirect(xid, target);
            }
        }

        Ok(Dissection {
            frame: info.frame,
            conversation: state.conversation,
            xid,
            msg_type: MessageType::Call,
            procedure: Some(key),
            program_name: Some(self.registry.program_name(key.program)),
            procedure_name: Some(self.procedure_name(key, flavor)),
            flavor,
            header: Header::Call {
                credential,
                verifier,
            },
            request_frame: correlation.record.request_frame,
            reply_frame: correlation.record.reply_frame,
            response_time: None,
            annotations: correlation.annotation.into_iter().collect(),
            outcome,
        })
    }

    fn dissect_reply(
        &self,
        xid: u32,
        mut reader: XdrReader,
        info: &PacketInfo,
        state: DissectionState<'_>,
    ) -> Result<Dissection> {
        let correlation = match state.mode {
            PassMode::FirstPass => state.calls.resolve_reply(xid, info.frame),
            PassMode::Replay => state.calls.observe_reply(xid, info.frame),
        };
        let record = &correlation.record;

        let body = ReplyBody::decode(&mut reader)?;
        let verifier = match &body {
            ReplyBody::Accepted { verifier, .. } => {
                Some(self.auth.decode_verifier(verifier, MessageType::Reply))
            }
            _ => None,
        };
        let response_time = record
            .request_time
            .filter(|_| !record.is_placeholder())
            .map(|sent| info.timestamp.saturating_sub(sent));

        trace!(
            "Reply xid={:#x} at frame {} answers frame {:?}",
            xid,
            info.frame,
            record.request_frame
        );

        let outcome = match &body {
            ReplyBody::Accepted {
                status: AcceptStatus::Success,
                ..
            } => {
                let mut ctx = CodecContext::new(&self.registry, record, info.frame);
                self.dissect_payload(
                    MessageType::Reply,
                    record.flavor,
                    record.procedure,
                    &mut reader,
                    &mut ctx,
                    info.frame,
                    state.mode,
                    state.contexts,
                )
            }
            ReplyBody::Accepted { status, .. } => {
                debug!("Reply xid={:#x}: {}", xid, status);
                Outcome::opaque(OpaqueReason::NotSuccessful, reader.take_rest())
            }
            ReplyBody::Denied(reject) => {
                debug!("Reply xid={:#x} denied: {:?}", xid, reject);
                Outcome::opaque(OpaqueReason::Denied, reader.take_rest())
            }
            ReplyBody::Unknown(_) => {
                Outcome::opaque(OpaqueReason::InvalidReplyState, reader.take_rest())
            }
        };

        Ok(Dissection {
            frame: info.frame,
            conversation: state.conversation,
            xid,
            msg_type: MessageType::Reply,
            procedure: record.procedure,
            program_name: record
                .procedure
                .map(|key| self.registry.program_name(key.program)),
            procedure_name: record
                .procedure
                .map(|key| self.procedure_name(key, record.flavor)),
            flavor: record.flavor,
            header: Header::Reply { body, verifier },
            request_frame: record.request_frame,
            reply_frame: record.reply_frame,
            response_time,
            annotations: correlation.annotation.into_iter().collect(),
            outcome,
        })
    }

    fn procedure_name(&self, key: ProcedureKey, flavor: FlavorClass) -> String {
        match flavor {
            FlavorClass::AuthGssApiMsg { procedure } => format!("AUTH_GSSAPI {:?}", procedure),
            _ => self.registry.procedure_name(key),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn dissect_payload(
        &self,
        msg_type: MessageType,
        flavor: FlavorClass,
        key: Option<ProcedureKey>,
        reader: &mut XdrReader,
        ctx: &mut CodecContext<'_>,
        frame: FrameNumber,
        mode: PassMode,
        contexts: &mut GssContextStore,
    ) -> Outcome {
        let original = reader.rest().clone();
        let result = match flavor {
            FlavorClass::Unknown => return Outcome::opaque(OpaqueReason::UnknownFlavor, original),
            FlavorClass::GssNoInfo => return Outcome::opaque(OpaqueReason::GssNoInfo, original),
            FlavorClass::AuthGssApi => return Outcome::opaque(OpaqueReason::Sealed, original),
            FlavorClass::AuthGssApiMsg { procedure } => {
                self.auth_gssapi_control(msg_type, procedure, reader)
            }
            FlavorClass::Gss {
                procedure: GssProcedure::Init | GssProcedure::ContinueInit,
                ..
            } => self.gss_init_control(msg_type, reader, frame, mode, contexts),
            FlavorClass::Gss {
                procedure: GssProcedure::Destroy,
                ..
            } => Ok(Payload::Control(ControlMessage::GssDestroy)),
            FlavorClass::Gss {
                procedure: GssProcedure::Data,
                service,
            } => {
                let Some(key) = key.filter(|k| self.registry.lookup(*k).is_some()) else {
                    return Outcome::opaque(OpaqueReason::UnknownProcedure, original);
                };
                match service {
                    GssService::None => self.decode_plain(msg_type, key, reader, ctx),
                    GssService::Integrity => self.decode_integrity(msg_type, key, reader, ctx),
                    GssService::Privacy => match self.decode_privacy(msg_type, key, reader, ctx) {
                        Ok(Some(payload)) => Ok(payload),
                        Ok(None) => {
                            return Outcome::opaque(OpaqueReason::Undecryptable, reader.take_rest())
                        }
                        Err(e) => Err(e),
                    },
                    GssService::Other(_) => {
                        return Outcome::opaque(OpaqueReason::UnknownFlavor, original)
                    }
                }
            }
            FlavorClass::Gss {
                procedure: GssProcedure::Other(_),
                ..
            } => return Outcome::opaque(OpaqueReason::UnknownFlavor, original),
            FlavorClass::NotGss => {
                let Some(key) = key.filter(|k| self.registry.lookup(*k).is_some()) else {
                    return Outcome::opaque(OpaqueReason::UnknownProcedure, original);
                };
                self.decode_plain(msg_type, key, reader, ctx)
            }
        };

        match result {
            Ok(payload) => Outcome::Dissected {
                payload,
                trailing: reader.take_rest(),
            },
            Err(e) => {
                debug!("Payload of frame {} did not decode: {}", frame, e);
                Outcome::opaque(OpaqueReason::DecodeFailed(e.to_string()), original)
            }
        }
    }

    fn run_codec(
        &self,
        msg_type: MessageType,
        key: ProcedureKey,
        reader: &mut XdrReader,
        ctx: &mut CodecContext<'_>,
    ) -> xdr::Result<Value> {
        let codec = self.registry.codec_for(key);
        match msg_type {
            MessageType::Call => codec.decode_call(reader, ctx),
            MessageType::Reply => codec.decode_reply(reader, ctx),
        }
    }

    fn decode_plain(
        &self,
        msg_type: MessageType,
        key: ProcedureKey,
        reader: &mut XdrReader,
        ctx: &mut CodecContext<'_>,
    ) -> Result<Payload> {
        Ok(Payload::Value(self.run_codec(msg_type, key, reader, ctx)?))
    }

    fn decode_integrity(
        &self,
        msg_type: MessageType,
        key: ProcedureKey,
        reader: &mut XdrReader,
        ctx: &mut CodecContext<'_>,
    ) -> Result<Payload> {
        let envelope = IntegrityEnvelope::decode(reader)?;
        let mut body = XdrReader::new(envelope.body.clone());
        let value = self.run_codec(msg_type, key, &mut body, ctx)?;

        let mut signed = Vec::with_capacity(4 + envelope.body.len());
        signed.extend_from_slice(&envelope.sequence.to_be_bytes());
        signed.extend_from_slice(&envelope.body);
        let verified = self
            .security
            .as_ref()
            .and_then(|layer| layer.verify_mic(&signed, &envelope.checksum));

        Ok(Payload::Integrity {
            sequence: envelope.sequence,
            value,
            checksum: envelope.checksum,
            verified,
        })
    }

    /// `Ok(None)` when nothing could decrypt the payload; the reader is
    /// then left positioned at the ciphertext.
    fn decode_privacy(
        &self,
        msg_type: MessageType,
        key: ProcedureKey,
        reader: &mut XdrReader,
        ctx: &mut CodecContext<'_>,
    ) -> Result<Option<Payload>> {
        let mut probe = reader.clone();
        let ciphertext = probe.get::<Opaque>()?.into_bytes();
        let Some(plain) = self
            .security
            .as_ref()
            .and_then(|layer| layer.decrypt(&ciphertext))
        else {
            debug!("No key for {} byte privacy payload", ciphertext.len());
            return Ok(None);
        };
        *reader = probe;

        let mut plain = XdrReader::new(plain);
        let sequence = plain.get_u32()?;
        let value = self.run_codec(msg_type, key, &mut plain, ctx)?;
        Ok(Some(Payload::Privacy { sequence, value }))
    }

    fn gss_init_control(
        &self,
        msg_type: MessageType,
        reader: &mut XdrReader,
        frame: FrameNumber,
        mode: PassMode,
        contexts: &mut GssContextStore,
    ) -> Result<Payload> {
        let message = match msg_type {
            MessageType::Call => ControlMessage::GssInitArg {
                token: reader.get_opaque(MAX_GSS_TOKEN_LEN)?,
            },
            MessageType::Reply => {
                let result = GssInitResult::decode(reader)?;
                let context = match mode {
                    PassMode::FirstPass => {
                        contexts.on_context_seen(&result.context, frame, true, false)
                    }
                    PassMode::Replay => contexts.lookup(&result.context),
                };
                ControlMessage::GssInitResult { result, context }
            }
        };
        Ok(Payload::Control(message))
    }

    fn auth_gssapi_control(
        &self,
        msg_type: MessageType,
        procedure: AuthGssApiProcedure,
        reader: &mut XdrReader,
    ) -> Result<Payload> {
        let message = match (procedure, msg_type) {
            (
                AuthGssApiProcedure::Init
                | AuthGssApiProcedure::ContinueInit
                | AuthGssApiProcedure::Message,
                MessageType::Call,
            ) => ControlMessage::AuthGssApiInitArg(AuthGssApiInitArg::decode(reader)?),
            (
                AuthGssApiProcedure::Init
                | AuthGssApiProcedure::ContinueInit
                | AuthGssApiProcedure::Message,
                MessageType::Reply,
            ) => ControlMessage::AuthGssApiInitResult(AuthGssApiInitResult::decode(reader)?),
            (AuthGssApiProcedure::Destroy, _) => ControlMessage::AuthGssApiDestroy {
                data: reader.get_opaque(MAX_GSS_TOKEN_LEN)?,
            },
            (AuthGssApiProcedure::Exit | AuthGssApiProcedure::Other(_), _) => {
                ControlMessage::AuthGssApiExit
            }
        };
        Ok(Payload::Control(message))
    }
}
