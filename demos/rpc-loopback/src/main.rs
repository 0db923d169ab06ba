//! ONC RPC Loopback Example
//!
//! A MOUNT-style client and server talk ONC RPC over an in-memory stream.
//! Both ends are tapped: every byte written is cut into capture segments
//! and dissected by a `CaptureSession`, which reassembles fragmented
//! records and pairs replies with their calls.
//!
//! ```text
//!  client ──Tap──┐                         ┌──Tap── server
//!                └──► Wiretap ──► CaptureSession ──► log
//! ```
//!
//! Usage:
//!   cargo run -p rpc-loopback -- --calls 3 --fragment-size 16 --segment-size 40

mod tap;
mod transport;

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use clap::Parser;
use oncrpc::{
    encode_call, encode_reply, AcceptStatus, CallHeader, MessageType, OpaqueAuth, ProcedureKey,
    ProcedureRegistry, ProgramBuilder, ReplyBody, SessionConfig, Value,
};
use tokio::io::{duplex, DuplexStream};
use tokio::sync::mpsc;
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use xdr::{Opaque, XdrReader, XdrString, XdrWriter};

use crate::tap::{describe, log_stats, Captured, Flow, Tap, Wiretap};
use crate::transport::{RecordTransport, TransportError};

const MOUNT_PROGRAM: u32 = 100005;
const MOUNT_VERSION: u32 = 3;

/// Procedure numbers
const MOUNTPROC_NULL: u32 = 0;
const MOUNTPROC_MNT: u32 = 1;
const MOUNTPROC_UMNT: u32 = 3;

const MNTPATHLEN: usize = 1024;
const FHSIZE3: usize = 64;
/// Largest call the server accepts
const MAX_CALL_SIZE: usize = 8 * 1024;

type Stream = RecordTransport<Tap<DuplexStream>>;
type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Parser)]
#[command(name = "rpc-loopback", about = "ONC RPC over an in-memory stream, dissected as it goes")]
struct Args {
    /// Number of mount/unmount rounds the client performs
    #[arg(long, default_value_t = 3)]
    calls: u32,

    /// Largest fragment either side writes
    #[arg(long, default_value_t = 64)]
    fragment_size: usize,

    /// Capture segment size used by the wiretap
    #[arg(long, default_value_t = 40)]
    segment_size: usize,

    /// Dissect the capture a second time once it is complete
    #[arg(long)]
    replay: bool,
}

/// MOUNT v3 decoders for the dissector
fn mount_registry() -> Arc<ProcedureRegistry> {
    let mut registry = ProcedureRegistry::new();
    registry.register(
        ProgramBuilder::new(MOUNT_PROGRAM, "MOUNT")
            .version(MOUNT_VERSION)
            .null_procedure(MOUNTPROC_NULL)
            .function(
                MOUNTPROC_MNT,
                "MNT",
                |args, _ctx| Ok(Value::String(args.get_string(MNTPATHLEN)?)),
                |results, _ctx| {
                    let status = results.get_u32()?;
                    if status != 0 {
                        return Ok(Value::Struct(vec![("status".into(), Value::UInt(status as u64))]));
                    }
                    Ok(Value::Struct(vec![
                        ("status".into(), Value::UInt(0)),
                        ("fhandle".into(), Value::Bytes(results.get_opaque(FHSIZE3)?)),
                    ]))
                },
            )
            .function(
                MOUNTPROC_UMNT,
                "UMNT",
                |args, _ctx| Ok(Value::String(args.get_string(MNTPATHLEN)?)),
                |_results, _ctx| Ok(Value::Void),
            )
            .build(),
    );
    Arc::new(registry)
}

/// File handle the server hands out for `path`
fn fhandle_for(path: &str) -> Vec<u8> {
    let mut handle = vec![0u8; 16];
    for (i, byte) in path.bytes().enumerate() {
        handle[i % 16] ^= byte.rotate_left(i as u32 % 8);
    }
    handle
}

/// Handle one call record; returns the reply message
fn handle_call(record: Bytes) -> Result<Bytes, BoxError> {
    let mut reader = XdrReader::new(record);
    let xid = reader.get_u32()?;
    if reader.get_u32()? != MessageType::Call as u32 {
        return Err(format!("xid {:#x}: expected a call", xid).into());
    }
    let key = CallHeader::decode_procedure(&mut reader)?;
    let _credential = OpaqueAuth::decode(&mut reader)?;
    let _verifier = OpaqueAuth::decode(&mut reader)?;

    let accepted = |status| ReplyBody::Accepted {
        verifier: OpaqueAuth::null(),
        status,
    };
    if key.program != MOUNT_PROGRAM {
        return Ok(encode_reply(xid, &accepted(AcceptStatus::ProgramUnavailable), &[]));
    }
    if key.version != MOUNT_VERSION {
        let mismatch = AcceptStatus::ProgramMismatch {
            low: MOUNT_VERSION,
            high: MOUNT_VERSION,
        };
        return Ok(encode_reply(xid, &accepted(mismatch), &[]));
    }

    let mut results = XdrWriter::new();
    match key.procedure {
        MOUNTPROC_NULL => debug!("NULL xid={:#x}", xid),
        MOUNTPROC_MNT => {
            let path = reader.get_string(MNTPATHLEN)?;
            debug!("MNT {} xid={:#x}", path, xid);
            results.put_u32(0);
            results.put(&Opaque::new(fhandle_for(&path)));
        }
        MOUNTPROC_UMNT => {
            let path = reader.get_string(MNTPATHLEN)?;
            debug!("UMNT {} xid={:#x}", path, xid);
        }
        _ => return Ok(encode_reply(xid, &accepted(AcceptStatus::ProcedureUnavailable), &[])),
    }
    Ok(encode_reply(xid, &accepted(AcceptStatus::Success), &results.into_bytes()))
}

async fn run_server(mut transport: Stream) -> Result<u32, BoxError> {
    info!("MOUNT server started");
    let mut served = 0;
    loop {
        let record = match transport.read_record().await {
            Ok(record) => record,
            Err(TransportError::ConnectionClosed) => break,
            Err(e) => return Err(e.into()),
        };
        let reply = handle_call(record)?;
        transport.write_record(&reply).await?;
        served += 1;
    }
    info!("Server shut down after {} calls", served);
    Ok(served)
}

/// Send one call and wait for its reply
async fn call(transport: &mut Stream, xid: u32, procedure: u32, args: &[u8]) -> Result<Bytes, BoxError> {
    let header = CallHeader::new(xid, ProcedureKey::new(MOUNT_PROGRAM, MOUNT_VERSION, procedure));
    transport.write_record(&encode_call(&header, args)).await?;

    let mut reply = XdrReader::new(transport.read_record().await?);
    let reply_xid = reply.get_u32()?;
    if reply_xid != xid {
        return Err(format!("reply xid {:#x} does not match call {:#x}", reply_xid, xid).into());
    }
    if reply.get_u32()? != MessageType::Reply as u32 {
        return Err(format!("xid {:#x}: expected a reply", xid).into());
    }
    let body = ReplyBody::decode(&mut reply)?;
    if !body.is_success() {
        return Err(format!("xid {:#x} failed: {:?}", xid, body).into());
    }
    Ok(reply.take_rest())
}

async fn run_client(mut transport: Stream, rounds: u32) -> Result<(), BoxError> {
    let mut xid = 0x1000;
    call(&mut transport, xid, MOUNTPROC_NULL, &[]).await?;

    for round in 0..rounds {
        let path = format!("/export/volume{}", round);
        let mut args = XdrWriter::new();
        args.put(&XdrString::new(path.as_str()));
        let args = args.into_bytes();

        xid += 1;
        let mut results = XdrReader::new(call(&mut transport, xid, MOUNTPROC_MNT, &args).await?);
        let status = results.get_u32()?;
        let fhandle = results.get_opaque(FHSIZE3)?;
        if status != 0 || fhandle.as_ref() != fhandle_for(&path).as_slice() {
            return Err(format!("bad MNT result for {}", path).into());
        }

        xid += 1;
        call(&mut transport, xid, MOUNTPROC_UMNT, &args).await?;
    }
    info!("Client finished {} rounds", rounds);
    Ok(())
}

/// Run client and server to completion; returns the wiretap
async fn run(args: &Args) -> Result<Wiretap, BoxError> {
    let client_addr: SocketAddr = "192.0.2.10:1010".parse()?;
    let server_addr: SocketAddr = "192.0.2.20:635".parse()?;

    let (tx, mut rx) = mpsc::unbounded_channel::<Captured>();
    let (client_end, server_end) = duplex(64 * 1024);
    let client = RecordTransport::new(Tap::new(client_end, Flow::ToServer, tx.clone()))
        .with_max_fragment_len(args.fragment_size);
    let server = RecordTransport::new(Tap::new(server_end, Flow::ToClient, tx))
        .with_max_fragment_len(args.fragment_size)
        .with_max_record_size(MAX_CALL_SIZE);

    let mut wiretap = Wiretap::new(
        mount_registry(),
        SessionConfig::default(),
        client_addr,
        server_addr,
        args.segment_size,
    );
    let analyzer = tokio::spawn(async move {
        while let Some(captured) = rx.recv().await {
            for message in wiretap.feed(captured) {
                info!("{}", describe(&message));
            }
        }
        wiretap
    });

    let server = tokio::spawn(run_server(server));
    let client_result = run_client(client, args.calls).await;
    let served = server.await??;
    client_result?;
    debug!("Server answered {} calls", served);

    Ok(analyzer.await?)
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args = Args::parse();
    info!(
        "Running {} rounds, {} byte fragments, {} byte capture segments",
        args.calls, args.fragment_size, args.segment_size
    );

    let mut wiretap = run(&args).await?;
    log_stats(&wiretap);

    if args.replay {
        info!("Second pass");
        for message in wiretap.replay() {
            info!("{}", describe(&message));
        }
    }
    Ok(())
}
