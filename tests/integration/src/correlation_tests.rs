//! Correlation Tests - XID Matching Across Calls and Replies
//!
//! These tests drive a capture session with call/reply traffic and check:
//! - Replies inherit program, version and procedure from their call
//! - Retransmitted calls and replies are flagged, never overwrite state
//! - Replies with no call get a placeholder and still dissect
//! - XID spaces are per conversation
//! - Call decoders can hand values to reply decoders
//! - Portmapper CALLIT replies decode with the forwarded procedure

mod common;

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use common::*;
use oncrpc::{
    encode_record, Annotation, CaptureSession, Dissection, OpaqueReason, Outcome, PacketInfo, Payload,
    ProcedureKey, SessionConfig, Value,
};
use xdr::XdrWriter;

fn new_session() -> CaptureSession {
    init_logging();
    CaptureSession::new(SessionConfig::default(), test_registry())
}

fn record(message: &Bytes) -> Bytes {
    encode_record(message, 1 << 16)
}

#[test]
fn test_reply_resolves_to_call() {
    let mut session = new_session();

    session.process(&to_server(10, 0), record(&mnt_call(0x1234, "/export/home")));
    let report = session.process(&to_client(11, 0), record(&mnt_reply_ok(0x1234, &[0xfe; 32])));

    let reply = report.messages().next().unwrap();
    assert_eq!(reply.xid, 0x1234);
    assert_eq!(reply.procedure, Some(MOUNT_MNT));
    assert_eq!(reply.request_frame, Some(10));
    assert_eq!(reply.reply_frame, Some(11));
    assert_eq!(reply.response_time, Some(Duration::from_millis(1)));

    let conversation = session.conversation(report.conversation.unwrap()).unwrap();
    let call = conversation.calls.get(0x1234).unwrap();
    assert_eq!(call.procedure, Some(MOUNT_MNT));
    assert_eq!(call.reply_frame, Some(11));
}

#[test]
fn test_duplicate_call_and_reply() {
    let mut session = new_session();
    let call = record(&mnt_call(0x1234, "/export"));
    let reply = record(&mnt_reply_ok(0x1234, &[1; 8]));

    session.process(&to_server(10, 0), call.clone());
    session.process(&to_client(11, 0), reply.clone());
    let retransmit = session.process(&to_server(12, call.len() as u32), call);
    let second_reply = session.process(&to_client(13, reply.len() as u32), reply);

    let dup_call = retransmit.messages().next().unwrap();
    assert_eq!(dup_call.annotations, vec![Annotation::DuplicateCall { original_frame: 10 }]);
    assert_eq!(dup_call.request_frame, Some(10));

    let dup_reply = second_reply.messages().next().unwrap();
    assert_eq!(dup_reply.annotations, vec![Annotation::DuplicateReply { original_frame: 11 }]);
    assert_eq!(dup_reply.reply_frame, Some(11));

    // Duplicates are not counted twice
    let stats = session.stats().get(MOUNT_MNT).unwrap();
    assert_eq!((stats.calls, stats.replies), (1, 1));
}

#[test]
fn test_reply_without_call_gets_placeholder() {
    let mut session = new_session();
    let report = session.process(&to_client(1, 0), record(&mnt_reply_ok(0x99, &[2; 8])));

    let reply = report.messages().next().unwrap();
    assert_eq!(reply.procedure, None);
    assert_eq!(reply.request_frame, None);
    assert_eq!(reply.response_time, None);
    assert!(matches!(
        reply.outcome,
        Outcome::DissectedAsOpaque {
            reason: OpaqueReason::UnknownFlavor,
            ..
        }
    ));
    assert!(session.stats().is_empty());
}

#[test]
fn test_late_call_completes_placeholder() {
    let mut session = new_session();
    session.process(&to_client(1, 0), record(&success_reply(0x55, &[])));
    let report = session.process(&to_server(2, 0), record(&null_call(0x55, MOUNT_NULL)));

    let call = report.messages().next().unwrap();
    assert!(call.annotations.is_empty());
    assert_eq!(call.request_frame, Some(2));
    assert_eq!(call.reply_frame, Some(1));
}

#[test]
fn test_interleaved_calls() {
    let mut session = new_session();
    session.process(&to_server(1, 0), record(&mnt_call(1, "/a")));
    session.process(&to_server(2, 0), record(&mnt_call(2, "/b")));

    let second = session.process(&to_client(3, 0), record(&mnt_reply_ok(2, &[0; 4])));
    let first = session.process(&to_client(4, 0), record(&mnt_reply_ok(1, &[0; 4])));

    assert_eq!(second.messages().next().unwrap().request_frame, Some(2));
    assert_eq!(first.messages().next().unwrap().request_frame, Some(1));
}

#[test]
fn test_xid_scoped_to_conversation() {
    let mut session = new_session();
    let other_client: SocketAddr = "10.1.1.6:1022".parse().unwrap();

    session.process(&to_server(1, 0), record(&mnt_call(7, "/one")));
    session.process(
        &PacketInfo::tcp(2, other_client, server_addr(), 0),
        record(&null_call(7, MOUNT_NULL)),
    );

    let reply = session.process(&to_client(3, 0), record(&mnt_reply_ok(7, &[0; 4])));
    let reply = reply.messages().next().unwrap();
    assert_eq!(reply.procedure, Some(MOUNT_MNT));
    assert!(reply.annotations.is_empty());
    assert_eq!(session.conversations().len(), 2);
}

#[test]
fn test_call_value_carried_to_reply() {
    let mut session = new_session();
    session.process(&to_server(1, 0), record(&mnt_call(3, "/srv/data")));
    let report = session.process(&to_client(2, 0), record(&mnt_reply_ok(3, &[0xab; 16])));

    let reply = report.messages().next().unwrap();
    let Outcome::Dissected {
        payload: Payload::Value(value),
        ..
    } = &reply.outcome
    else {
        panic!("expected decoded reply, got {:?}", reply.outcome);
    };
    assert_eq!(value.field("status"), Some(&Value::UInt(0)));
    assert_eq!(value.field("path"), Some(&Value::String("/srv/data".into())));
    assert_eq!(
        value.field("auth_flavors"),
        Some(&Value::List(vec![Value::UInt(1)]))
    );
}

#[test]
fn test_replay_leaves_tables_untouched() {
    let mut session = new_session();
    let call = record(&mnt_call(0x1234, "/export"));
    let reply = record(&mnt_reply_ok(0x1234, &[1; 8]));

    session.process(&to_server(10, 0), call.clone());
    session.process(&to_client(11, 0), reply.clone());
    session.finish_first_pass();

    // Re-render out of order, and show a frame the first pass never saw
    let again = session.process(&to_client(11, 0), reply.clone());
    session.process(&to_server(10, 0), call.clone());
    let unseen = session.process(&to_client(20, 500), reply);

    let replayed = again.messages().next().unwrap();
    assert!(replayed.annotations.is_empty());
    assert_eq!(replayed.request_frame, Some(10));

    let unseen = unseen.messages().next().unwrap();
    assert_eq!(unseen.annotations, vec![Annotation::DuplicateReply { original_frame: 11 }]);

    let conversation = session.conversation(again.conversation.unwrap()).unwrap();
    assert_eq!(conversation.calls.get(0x1234).unwrap().reply_frame, Some(11));
    assert_eq!(session.stats().get(MOUNT_MNT).unwrap().replies, 1);
}

#[test]
fn test_non_success_reply_shows_status_only() {
    let mut session = new_session();
    session.process(&to_server(1, 0), record(&null_call(9, MOUNT_NULL)));
    let report = session.process(
        &to_client(2, 0),
        record(&accepted_reply(9, oncrpc::AcceptStatus::ProcedureUnavailable)),
    );

    let reply = report.messages().next().unwrap();
    assert_eq!(reply.procedure, Some(MOUNT_NULL));
    assert_eq!(
        reply.outcome,
        Outcome::DissectedAsOpaque {
            reason: OpaqueReason::NotSuccessful,
            bytes: Bytes::new(),
        }
    );
}

fn decoded_value(message: &Dissection) -> &Value {
    match &message.outcome {
        Outcome::Dissected {
            payload: Payload::Value(value),
            ..
        } => value,
        other => panic!("expected a decoded value, got {:?}", other),
    }
}

#[test]
fn test_indirect_call_decodes_forwarded_procedure() {
    let mut session = new_session();
    let mut args = XdrWriter::new();
    args.put_string("/export");
    let call = record(&callit_call(0x700, MOUNT_MNT, &args.into_bytes()));

    let mut results = XdrWriter::new();
    results.put_u32(0);
    results.put_opaque(&[0xcd; 16]);
    xdr::encode_array(&mut results, &[1u32]);
    let reply = record(&callit_reply(0x700, 635, &results.into_bytes()));

    let call_report = session.process(&to_server(1, 0), call);
    let reply_report = session.process(&to_client(2, 0), reply.clone());

    let forwarded = call_report.messages().next().unwrap();
    assert_eq!(forwarded.procedure_name.as_deref(), Some("CALLIT"));
    let value = decoded_value(forwarded);
    assert_eq!(value.field("target"), Some(&Value::String(MOUNT_MNT.to_string())));
    assert_eq!(value.field("args"), Some(&Value::String("/export".into())));

    let conversation = session.conversation(call_report.conversation.unwrap()).unwrap();
    assert_eq!(conversation.calls.get(0x700).unwrap().indirect, Some(MOUNT_MNT));

    let answer = reply_report.messages().next().unwrap();
    assert_eq!(answer.procedure, Some(PMAP_CALLIT));
    let value = decoded_value(answer);
    assert_eq!(value.field("port"), Some(&Value::UInt(635)));
    let mounted = value.field("results").unwrap();
    assert_eq!(mounted.field("status"), Some(&Value::UInt(0)));
    // Stashed by the MNT decoder while it ran inside CALLIT
    assert_eq!(mounted.field("path"), Some(&Value::String("/export".into())));
    assert_eq!(
        mounted.field("fhandle"),
        Some(&Value::Bytes(Bytes::from_static(&[0xcd; 16])))
    );

    // A later pass decodes the same way from the stored target
    session.finish_first_pass();
    let again = session.process(&to_client(2, 0), reply);
    assert_eq!(decoded_value(again.messages().next().unwrap()), value);
}

#[test]
fn test_indirect_call_to_unknown_procedure_is_opaque() {
    let mut session = new_session();
    let target = ProcedureKey::new(100099, 1, 2);
    session.process(&to_server(1, 0), record(&callit_call(0x701, target, &[1, 2, 3, 4])));
    let report = session.process(&to_client(2, 0), record(&callit_reply(0x701, 2000, &[5, 6, 7, 8])));

    let conversation = session.conversation(report.conversation.unwrap()).unwrap();
    assert_eq!(conversation.calls.get(0x701).unwrap().indirect, Some(target));

    let value = decoded_value(report.messages().next().unwrap());
    assert_eq!(
        value.field("results"),
        Some(&Value::Bytes(Bytes::from_static(&[5, 6, 7, 8])))
    );
}
