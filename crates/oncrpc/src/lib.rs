//! ONC RPC (RFC 1831) record reassembly and call/reply correlation
//!
//! This crate takes the bytes of captured transport segments and turns
//! them into dissected ONC RPC messages. It does not own sockets or
//! decode any particular program: callers hand it segment bytes plus
//! endpoint metadata and register decoders for the programs they care
//! about.
//!
//! # Features
//!
//! - Record-mark framing and multi-fragment reassembly over streams
//! - XID correlation of calls and replies, duplicate detection and
//!   response times
//! - Credential and verifier decoding for AUTH_NULL, AUTH_UNIX, AUTH_DES,
//!   RPCSEC_GSS and AUTH_GSSAPI, with GSS context lifetime tracking
//! - RPCSEC_GSS integrity and privacy payloads through a caller-supplied
//!   [`SecurityLayer`]
//! - First-pass/replay separation: only the first pass over a capture
//!   changes state
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use bytes::Bytes;
//! use oncrpc::{
//!     encode_call, encode_record, CallHeader, CaptureSession, PacketInfo, ProcedureKey,
//!     ProcedureRegistry, ProgramBuilder, SessionConfig,
//! };
//!
//! let mut registry = ProcedureRegistry::new();
//! registry.register(
//!     ProgramBuilder::new(100005, "MOUNT")
//!         .version(3)
//!         .null_procedure(0)
//!         .build(),
//! );
//!
//! let mut session = CaptureSession::new(SessionConfig::default(), Arc::new(registry));
//! let call = encode_call(&CallHeader::new(7, ProcedureKey::new(100005, 3, 0)), &[]);
//! let info = PacketInfo::tcp(
//!     1,
//!     "10.0.0.1:800".parse().unwrap(),
//!     "10.0.0.2:635".parse().unwrap(),
//!     0,
//! );
//!
//! let report = session.process(&info, encode_record(&call, 1 << 16));
//! let message = report.messages().next().unwrap();
//! assert_eq!(message.xid, 7);
//! assert_eq!(message.procedure_name.as_deref(), Some("NULL"));
//! ```

pub mod call_table;
pub mod config;
pub mod conversation;
pub mod dissector;
pub mod error;
pub mod fragmentation;
pub mod gss;
pub mod message;
pub mod record;
pub mod registry;
pub mod security;
pub mod session;
pub mod stats;

// Framing
pub use fragmentation::{
    find_reply_start, AssemblyProgress, CompleteMessage, ConversationMarker, FeedResult, FragmentKey,
    FragmentReassembler,
};
pub use record::{encode_record, RecordFramer, RecordMark, DEFAULT_MAX_FRAGMENT_LEN, RECORD_MARK_SIZE};

// Messages
pub use message::{
    classify, encode_call, encode_reply, AcceptStatus, AuthStat, CallHeader, MessageType, OpaqueAuth,
    RejectStatus, ReplyBody, RPC_VERSION,
};

// Correlation
pub use call_table::{Annotation, CallRecord, CallTable, Correlation};
pub use conversation::{
    ConversationId, ConversationKey, ConversationState, ConversationStore, Direction, FrameNumber,
    PacketInfo, Transport,
};

// Authentication
pub use gss::{GssContextKey, GssContextRecord, GssContextStore, GssProcedure, GssService};
pub use security::{
    flavor, flavor_name, AuthDispatcher, Credential, DecodedCredential, FlavorClass, SecurityLayer,
    Verifier,
};

// Dissection
pub use dissector::{ControlMessage, Dissection, Header, MessageDissector, OpaqueReason, Outcome, Payload};
pub use registry::{
    CodecContext, FnCodec, NullProcedure, OpaqueCodec, ProcedureCodec, ProcedureKey, ProcedureRegistry,
    Program, ProgramBuilder, Value,
};

// Session
pub use config::SessionConfig;
pub use error::{NotRpcReason, Result, RpcError};
pub use session::{CaptureSession, NeedMore, PassMode, SegmentItem, SegmentReport};
pub use stats::{ProcedureStats, RpcStats};
