//! Procedure registry
//!
//! Maps `(program, version, procedure)` to a [`ProcedureCodec`] that turns
//! call arguments and reply results into [`Value`]s. The engine itself
//! knows no program-specific layouts; anything not registered is shown as
//! opaque bytes by [`OpaqueCodec`].

use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{info, trace};
use xdr::XdrReader;

use crate::call_table::CallRecord;
use crate::conversation::FrameNumber;

/// Program, version and procedure number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcedureKey {
    pub program: u32,
    pub version: u32,
    pub procedure: u32,
}

impl ProcedureKey {
    pub const fn new(program: u32, version: u32, procedure: u32) -> Self {
        Self {
            program,
            version,
            procedure,
        }
    }
}

impl fmt::Display for ProcedureKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{} proc {}", self.program, self.version, self.procedure)
    }
}

/// Structured result of a decode routine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Void,
    Bool(bool),
    UInt(u64),
    Int(i64),
    String(String),
    Bytes(Bytes),
    List(Vec<Value>),
    Struct(Vec<(String, Value)>),
}

impl Value {
    /// Field of a `Struct` value by name
    pub fn field(&self, name: &str) -> Option<&Value> {
        match self {
            Value::Struct(fields) => fields.iter().find(|(n, _)| n == name).map(|(_, v)| v),
            _ => None,
        }
    }
}

/// What a decode routine can see and leave behind
pub struct CodecContext<'a> {
    registry: &'a ProcedureRegistry,
    record: &'a CallRecord,
    frame: FrameNumber,
    stash: Option<Arc<dyn Any + Send + Sync>>,
    indirect: Option<ProcedureKey>,
}

impl<'a> CodecContext<'a> {
    pub(crate) fn new(registry: &'a ProcedureRegistry, record: &'a CallRecord, frame: FrameNumber) -> Self {
        Self {
            registry,
            record,
            frame,
            stash: None,
            indirect: None,
        }
    }

    /// The call this message belongs to
    pub fn record(&self) -> &CallRecord {
        self.record
    }

    pub fn frame(&self) -> FrameNumber {
        self.frame
    }

    /// Leave a value on the call record for the reply decoder.
    ///
    /// Only honoured while the call is first dissected.
    pub fn stash<T: Any + Send + Sync>(&mut self, value: T) {
        self.stash = Some(Arc::new(value));
    }

    /// Value stashed by the call decoder
    pub fn carried<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.record.carried::<T>()
    }

    /// Decode arguments a call forwards to another procedure, as the
    /// portmapper CALLIT and RPCBIND indirect calls do.
    ///
    /// `key` is remembered on the call record so that
    /// [`decode_indirect_reply`](Self::decode_indirect_reply) can find it.
    /// The forwarded codec runs with this context.
    pub fn decode_indirect_call(&mut self, key: ProcedureKey, args: &mut XdrReader) -> xdr::Result<Value> {
        trace!("Indirect call to {} at frame {}", key, self.frame);
        self.indirect = Some(key);
        let registry = self.registry;
        registry.codec_for(key).decode_call(args, self)
    }

    /// Decode results of an indirect call with the codec of the procedure
    /// the call was forwarded to. Opaque when that is not known.
    pub fn decode_indirect_reply(&mut self, results: &mut XdrReader) -> xdr::Result<Value> {
        let registry = self.registry;
        match self.record.indirect {
            Some(key) => registry.codec_for(key).decode_reply(results, self),
            None => Ok(Value::Bytes(results.take_rest())),
        }
    }

    /// Procedure an indirect call was forwarded to, for the reply decoder
    pub fn indirect_target(&self) -> Option<ProcedureKey> {
        self.record.indirect
    }

    pub(crate) fn take_stash(&mut self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.stash.take()
    }

    pub(crate) fn take_indirect(&mut self) -> Option<ProcedureKey> {
        self.indirect.take()
    }
}

/// Decoder pair for one procedure
pub trait ProcedureCodec: Send + Sync {
    /// Decode call arguments
    fn decode_call(&self, args: &mut XdrReader, ctx: &mut CodecContext<'_>) -> xdr::Result<Value>;

    /// Decode reply results
    fn decode_reply(&self, results: &mut XdrReader, ctx: &mut CodecContext<'_>) -> xdr::Result<Value>;
}

/// Procedure with no arguments and no results
#[derive(Debug, Default, Clone, Copy)]
pub struct NullProcedure;

impl ProcedureCodec for NullProcedure {
    fn decode_call(&self, _args: &mut XdrReader, _ctx: &mut CodecContext<'_>) -> xdr::Result<Value> {
        Ok(Value::Void)
    }

    fn decode_reply(&self, _results: &mut XdrReader, _ctx: &mut CodecContext<'_>) -> xdr::Result<Value> {
        Ok(Value::Void)
    }
}

/// Fallback for anything unregistered: the payload, untouched
#[derive(Debug, Default, Clone, Copy)]
pub struct OpaqueCodec;

impl ProcedureCodec for OpaqueCodec {
    fn decode_call(&self, args: &mut XdrReader, _ctx: &mut CodecContext<'_>) -> xdr::Result<Value> {
        Ok(Value::Bytes(args.take_rest()))
    }

    fn decode_reply(&self, results: &mut XdrReader, _ctx: &mut CodecContext<'_>) -> xdr::Result<Value> {
        Ok(Value::Bytes(results.take_rest()))
    }
}

type DecodeFn = dyn Fn(&mut XdrReader, &mut CodecContext<'_>) -> xdr::Result<Value> + Send + Sync;

/// Codec built from a pair of closures
pub struct FnCodec {
    call: Box<DecodeFn>,
    reply: Box<DecodeFn>,
}

impl FnCodec {
    pub fn new<C, R>(call: C, reply: R) -> Self
    where
        C: Fn(&mut XdrReader, &mut CodecContext<'_>) -> xdr::Result<Value> + Send + Sync + 'static,
        R: Fn(&mut XdrReader, &mut CodecContext<'_>) -> xdr::Result<Value> + Send + Sync + 'static,
    {
        Self {
            call: Box::new(call),
            reply: Box::new(reply),
        }
    }
}

impl ProcedureCodec for FnCodec {
    fn decode_call(&self, args: &mut XdrReader, ctx: &mut CodecContext<'_>) -> xdr::Result<Value> {
        (self.call)(args, ctx)
    }

    fn decode_reply(&self, results: &mut XdrReader, ctx: &mut CodecContext<'_>) -> xdr::Result<Value> {
        (self.reply)(results, ctx)
    }
}

/// A registered procedure
#[derive(Clone)]
pub struct ProcedureEntry {
    pub name: String,
    pub codec: Arc<dyn ProcedureCodec>,
}

impl fmt::Debug for ProcedureEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcedureEntry").field("name", &self.name).finish()
    }
}

/// A program definition, ready to register
#[derive(Debug)]
pub struct Program {
    pub number: u32,
    pub name: String,
    procedures: Vec<(ProcedureKey, ProcedureEntry)>,
}

/// Builder for a [`Program`]
pub struct ProgramBuilder {
    program: Program,
    version: u32,
}

impl ProgramBuilder {
    pub fn new(number: u32, name: impl Into<String>) -> Self {
        Self {
            program: Program {
                number,
                name: name.into(),
                procedures: Vec::new(),
            },
            version: 1,
        }
    }

    /// Procedures added after this belong to `version`
    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn procedure(
        mut self,
        procedure: u32,
        name: impl Into<String>,
        codec: impl ProcedureCodec + 'static,
    ) -> Self {
        let key = ProcedureKey::new(self.program.number, self.version, procedure);
        self.program.procedures.push((
            key,
            ProcedureEntry {
                name: name.into(),
                codec: Arc::new(codec),
            },
        ));
        self
    }

    /// Register a void-in, void-out procedure under the name `NULL`
    pub fn null_procedure(self, procedure: u32) -> Self {
        self.procedure(procedure, "NULL", NullProcedure)
    }

    pub fn function<C, R>(self, procedure: u32, name: impl Into<String>, call: C, reply: R) -> Self
    where
        C: Fn(&mut XdrReader, &mut CodecContext<'_>) -> xdr::Result<Value> + Send + Sync + 'static,
        R: Fn(&mut XdrReader, &mut CodecContext<'_>) -> xdr::Result<Value> + Send + Sync + 'static,
    {
        self.procedure(procedure, name, FnCodec::new(call, reply))
    }

    pub fn build(self) -> Program {
        self.program
    }
}

#[derive(Debug)]
struct ProgramInfo {
    name: String,
    versions: BTreeSet<u32>,
}

/// Registry of known programs and their procedures
#[derive(Debug, Default)]
pub struct ProcedureRegistry {
    programs: HashMap<u32, ProgramInfo>,
    procedures: HashMap<ProcedureKey, ProcedureEntry>,
}

static OPAQUE: OpaqueCodec = OpaqueCodec;

impl ProcedureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every procedure of `program`
    pub fn register(&mut self, program: Program) {
        info!(
            "Registering program {} ({}) with {} procedures",
            program.number,
            program.name,
            program.procedures.len()
        );
        let info = self
            .programs
            .entry(program.number)
            .or_insert_with(|| ProgramInfo {
                name: program.name.clone(),
                versions: BTreeSet::new(),
            });
        for (key, entry) in program.procedures {
            info.versions.insert(key.version);
            self.procedures.insert(key, entry);
        }
    }

    /// Register a single procedure of an already named program
    pub fn register_procedure(
        &mut self,
        key: ProcedureKey,
        name: impl Into<String>,
        codec: Arc<dyn ProcedureCodec>,
    ) {
        let info = self
            .programs
            .entry(key.program)
            .or_insert_with(|| ProgramInfo {
                name: format!("program-{}", key.program),
                versions: BTreeSet::new(),
            });
        info.versions.insert(key.version);
        self.procedures.insert(
            key,
            ProcedureEntry {
                name: name.into(),
                codec,
            },
        );
    }

    pub fn lookup(&self, key: ProcedureKey) -> Option<&ProcedureEntry> {
        self.procedures.get(&key)
    }

    /// The registered codec, or [`OpaqueCodec`]
    pub fn codec_for(&self, key: ProcedureKey) -> &dyn ProcedureCodec {
        match self.procedures.get(&key) {
            Some(entry) => entry.codec.as_ref(),
            None => &OPAQUE,
        }
    }

    pub fn knows_program(&self, program: u32) -> bool {
        self.programs.contains_key(&program)
    }

    pub fn knows_version(&self, program: u32, version: u32) -> bool {
        self.programs
            .get(&program)
            .is_some_and(|info| info.versions.contains(&version))
    }

    pub fn program_name(&self, program: u32) -> String {
        match self.programs.get(&program) {
            Some(info) => info.name.clone(),
            None => format!("program-{}", program),
        }
    }

    pub fn procedure_name(&self, key: ProcedureKey) -> String {
        match self.procedures.get(&key) {
            Some(entry) => entry.name.clone(),
            None => format!("proc-{}", key.procedure),
        }
    }

    pub fn len(&self) -> usize {
        self.procedures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.procedures.is_empty()
    }
}
