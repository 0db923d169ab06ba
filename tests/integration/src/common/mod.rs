//! Common test utilities for integration tests

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Once};
use std::time::Duration;

use bytes::Bytes;
use oncrpc::{
    encode_call, encode_reply, flavor, AcceptStatus, CallHeader, OpaqueAuth, PacketInfo,
    ProcedureKey, ProcedureRegistry, ProgramBuilder, ReplyBody, SecurityLayer, Value,
};
use xdr::{Opaque, XdrReader, XdrWriter};

pub const MOUNT_PROGRAM: u32 = 100005;
pub const MOUNT_VERSION: u32 = 3;
pub const NFS_PROGRAM: u32 = 100003;
pub const NFS_VERSION: u32 = 3;
pub const PMAP_PROGRAM: u32 = 100000;
pub const PMAP_VERSION: u32 = 2;

pub const MOUNT_NULL: ProcedureKey = ProcedureKey::new(MOUNT_PROGRAM, MOUNT_VERSION, 0);
pub const MOUNT_MNT: ProcedureKey = ProcedureKey::new(MOUNT_PROGRAM, MOUNT_VERSION, 1);
pub const MOUNT_UMNT: ProcedureKey = ProcedureKey::new(MOUNT_PROGRAM, MOUNT_VERSION, 3);
pub const NFS_NULL: ProcedureKey = ProcedureKey::new(NFS_PROGRAM, NFS_VERSION, 0);
pub const NFS_GETATTR: ProcedureKey = ProcedureKey::new(NFS_PROGRAM, NFS_VERSION, 1);
pub const NFS_WRITE: ProcedureKey = ProcedureKey::new(NFS_PROGRAM, NFS_VERSION, 7);
pub const PMAP_CALLIT: ProcedureKey = ProcedureKey::new(PMAP_PROGRAM, PMAP_VERSION, 5);

const MAX_PATH: usize = 1024;
const FHSIZE3: usize = 64;

static INIT: Once = Once::new();

/// Initialize logging for tests
pub fn init_logging() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Export path a MNT call asked for, carried to its reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountedPath(pub String);

/// MOUNT v3 and a sliver of NFS v3, enough to exercise real decoders
pub fn test_registry() -> Arc<ProcedureRegistry> {
    let mut registry = ProcedureRegistry::new();
    registry.register(
        ProgramBuilder::new(MOUNT_PROGRAM, "MOUNT")
            .version(MOUNT_VERSION)
            .null_procedure(0)
            .function(
                1,
                "MNT",
                |args, ctx| {
                    let path = args.get_string(MAX_PATH)?;
                    ctx.stash(MountedPath(path.clone()));
                    Ok(Value::String(path))
                },
                |results, ctx| {
                    let status = results.get_u32()?;
                    let mut fields = vec![("status".to_string(), Value::UInt(status as u64))];
                    if let Some(MountedPath(path)) = ctx.carried::<MountedPath>() {
                        fields.push(("path".to_string(), Value::String(path.clone())));
                    }
                    if status == 0 {
                        fields.push(("fhandle".to_string(), Value::Bytes(results.get_opaque(FHSIZE3)?)));
                        let flavors: Vec<u32> = xdr::decode_array(results, 16)?;
                        fields.push((
                            "auth_flavors".to_string(),
                            Value::List(flavors.into_iter().map(|f| Value::UInt(f as u64)).collect()),
                        ));
                    }
                    Ok(Value::Struct(fields))
                },
            )
            .function(
                3,
                "UMNT",
                |args, _ctx| Ok(Value::String(args.get_string(MAX_PATH)?)),
                |_results, _ctx| Ok(Value::Void),
            )
            .build(),
    );
    registry.register(
        ProgramBuilder::new(NFS_PROGRAM, "NFS")
            .version(NFS_VERSION)
            .null_procedure(0)
            .function(
                1,
                "GETATTR",
                |args, _ctx| Ok(Value::Bytes(args.get_opaque(FHSIZE3)?)),
                |results, _ctx| Ok(Value::UInt(results.get_u32()? as u64)),
            )
            .function(
                7,
                "WRITE",
                |args, _ctx| {
                    let fhandle = args.get_opaque(FHSIZE3)?;
                    let offset = args.get_u64()?;
                    let count = args.get_u32()?;
                    let stable = args.get_u32()?;
                    let data = args.get_opaque(count as usize)?;
                    Ok(Value::Struct(vec![
                        ("fhandle".to_string(), Value::Bytes(fhandle)),
                        ("offset".to_string(), Value::UInt(offset)),
                        ("stable".to_string(), Value::UInt(stable as u64)),
                        ("data".to_string(), Value::Bytes(data)),
                    ]))
                },
                |results, _ctx| Ok(Value::UInt(results.get_u32()? as u64)),
            )
            .build(),
    );
    registry.register(
        ProgramBuilder::new(PMAP_PROGRAM, "PORTMAP")
            .version(PMAP_VERSION)
            .null_procedure(0)
            .function(
                5,
                "CALLIT",
                |args, ctx| {
                    let program = args.get_u32()?;
                    let version = args.get_u32()?;
                    let procedure = args.get_u32()?;
                    let target = ProcedureKey::new(program, version, procedure);
                    let mut forwarded = XdrReader::new(args.get::<Opaque>()?.into_bytes());
                    let value = ctx.decode_indirect_call(target, &mut forwarded)?;
                    Ok(Value::Struct(vec![
                        ("target".to_string(), Value::String(target.to_string())),
                        ("args".to_string(), value),
                    ]))
                },
                |results, ctx| {
                    let port = results.get_u32()?;
                    let mut forwarded = XdrReader::new(results.get::<Opaque>()?.into_bytes());
                    let value = ctx.decode_indirect_reply(&mut forwarded)?;
                    Ok(Value::Struct(vec![
                        ("port".to_string(), Value::UInt(port as u64)),
                        ("results".to_string(), value),
                    ]))
                },
            )
            .build(),
    );
    Arc::new(registry)
}

pub fn client_addr() -> SocketAddr {
    "10.1.1.5:1021".parse().unwrap()
}

pub fn server_addr() -> SocketAddr {
    "10.1.1.9:2049".parse().unwrap()
}

/// Segment sent by the client, timestamped at `frame` milliseconds
pub fn to_server(frame: u64, seq: u32) -> PacketInfo {
    PacketInfo::tcp(frame, client_addr(), server_addr(), seq).with_timestamp(Duration::from_millis(frame))
}

/// Segment sent by the server, timestamped at `frame` milliseconds
pub fn to_client(frame: u64, seq: u32) -> PacketInfo {
    PacketInfo::tcp(frame, server_addr(), client_addr(), seq).with_timestamp(Duration::from_millis(frame))
}

pub fn null_call(xid: u32, key: ProcedureKey) -> Bytes {
    encode_call(&CallHeader::new(xid, key), &[])
}

pub fn mnt_call(xid: u32, path: &str) -> Bytes {
    let mut args = XdrWriter::new();
    args.put_string(path);
    encode_call(&CallHeader::new(xid, MOUNT_MNT), &args.into_bytes())
}

pub fn mnt_reply_ok(xid: u32, fhandle: &[u8]) -> Bytes {
    let mut results = XdrWriter::new();
    results.put_u32(0);
    results.put_opaque(fhandle);
    results.put_u32(1);
    results.put_u32(flavor::AUTH_UNIX);
    success_reply(xid, &results.into_bytes())
}

/// PMAPPROC_CALLIT forwarding `args` to `target`
pub fn callit_call(xid: u32, target: ProcedureKey, args: &[u8]) -> Bytes {
    let mut w = XdrWriter::new();
    w.put_u32(target.program);
    w.put_u32(target.version);
    w.put_u32(target.procedure);
    w.put(&Opaque::new(args.to_vec()));
    encode_call(&CallHeader::new(xid, PMAP_CALLIT), &w.into_bytes())
}

/// CALLIT reply from `port` carrying the forwarded procedure's results
pub fn callit_reply(xid: u32, port: u32, results: &[u8]) -> Bytes {
    let mut w = XdrWriter::new();
    w.put_u32(port);
    w.put(&Opaque::new(results.to_vec()));
    success_reply(xid, &w.into_bytes())
}

/// NFS WRITE of `size` bytes of pattern data
pub fn write_call(xid: u32, size: usize) -> Bytes {
    let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
    let mut args = XdrWriter::new();
    args.put_opaque(&[0x11; 32]);
    args.put_u64(0);
    args.put_u32(size as u32);
    args.put_u32(2);
    args.put_opaque(&data);
    encode_call(&CallHeader::new(xid, NFS_WRITE), &args.into_bytes())
}

pub fn success_reply(xid: u32, results: &[u8]) -> Bytes {
    encode_reply(
        xid,
        &ReplyBody::Accepted {
            verifier: OpaqueAuth::null(),
            status: AcceptStatus::Success,
        },
        results,
    )
}

pub fn accepted_reply(xid: u32, status: AcceptStatus) -> Bytes {
    encode_reply(
        xid,
        &ReplyBody::Accepted {
            verifier: OpaqueAuth::null(),
            status,
        },
        &[],
    )
}

pub fn unix_credential(machine: &str, uid: u32, gid: u32, gids: &[u32]) -> OpaqueAuth {
    let mut body = XdrWriter::new();
    body.put_u32(0x5f00_0001);
    body.put_string(machine);
    body.put_u32(uid);
    body.put_u32(gid);
    body.put_u32(gids.len() as u32);
    for gid in gids {
        body.put_u32(*gid);
    }
    OpaqueAuth::new(flavor::AUTH_UNIX, body.into_bytes())
}

/// RPCSEC_GSS credential: procedure 0 data, 1 init, 2 continue, 3 destroy;
/// service 1 none, 2 integrity, 3 privacy
pub fn gss_credential(procedure: u32, sequence: u32, service: u32, handle: &[u8]) -> OpaqueAuth {
    let mut body = XdrWriter::new();
    body.put_u32(1);
    body.put_u32(procedure);
    body.put_u32(sequence);
    body.put_u32(service);
    body.put_opaque(handle);
    OpaqueAuth::new(flavor::RPCSEC_GSS, body.into_bytes())
}

pub fn gss_verifier() -> OpaqueAuth {
    OpaqueAuth::new(flavor::RPCSEC_GSS, Bytes::from_static(&[0x60; 12]))
}

pub fn gss_call(xid: u32, key: ProcedureKey, credential: OpaqueAuth, payload: &[u8]) -> Bytes {
    let header = CallHeader::new(xid, key)
        .with_credential(credential)
        .with_verifier(Some(gss_verifier()));
    encode_call(&header, payload)
}

/// Wrap `body` in an RPCSEC_GSS integrity envelope
pub fn integrity_envelope(sequence: u32, body: &[u8], checksum: &[u8]) -> Bytes {
    let mut writer = XdrWriter::new();
    writer.put_u32(body.len() as u32 + 4);
    writer.put_u32(sequence);
    writer.put_raw(body);
    writer.put_opaque(checksum);
    writer.into_bytes()
}

/// Toy security layer: "encryption" is XOR with a one-byte key, the
/// checksum is the byte sum of the signed data.
pub struct XorSecurityLayer {
    pub key: u8,
}

impl XorSecurityLayer {
    pub fn seal(&self, sequence: u32, body: &[u8]) -> Bytes {
        let mut plain = sequence.to_be_bytes().to_vec();
        plain.extend_from_slice(body);
        let cipher: Vec<u8> = plain.iter().map(|b| b ^ self.key).collect();
        let mut writer = XdrWriter::new();
        writer.put_opaque(&cipher);
        writer.into_bytes()
    }

    pub fn checksum(data: &[u8]) -> Vec<u8> {
        let sum: u32 = data.iter().map(|b| *b as u32).sum();
        sum.to_be_bytes().to_vec()
    }
}

impl SecurityLayer for XorSecurityLayer {
    fn decrypt(&self, token: &[u8]) -> Option<Bytes> {
        Some(token.iter().map(|b| b ^ self.key).collect::<Vec<u8>>().into())
    }

    fn verify_mic(&self, data: &[u8], checksum: &[u8]) -> Option<bool> {
        Some(Self::checksum(data) == checksum)
    }
}
