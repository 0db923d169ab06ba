//! Security Integration Tests
//!
//! These tests exercise the authentication code paths of the engine:
//!
//! 1. **Credential decoding**
//!    - AUTH_UNIX identity and group list
//!    - Unknown flavors kept opaque without stopping dissection
//!
//! 2. **RPCSEC_GSS**
//!    - Context creation on init replies, destruction on destroy calls
//!    - Integrity envelopes with checksum verification
//!    - Privacy payloads, with and without a security layer
//!    - Handles wider than the tracked width
//!
//! 3. **Legacy AUTH_GSSAPI**
//!    - Control messages and sealed application data

mod common;

use std::sync::Arc;

use bytes::Bytes;
use common::*;
use oncrpc::{
    encode_call, encode_record, flavor, CallHeader, CaptureSession, ControlMessage, Credential,
    Dissection, FlavorClass, GssProcedure, GssService, Header, OpaqueAuth, OpaqueReason, Outcome,
    Payload, ProcedureKey, SegmentReport, SessionConfig, Value,
};
use xdr::XdrWriter;

const HANDLE: &[u8] = &[0xc0, 0xff, 0xee, 0x00, 0x00, 0x00, 0x00, 0x07];
const KEY: u8 = 0x5a;

fn new_session() -> CaptureSession {
    init_logging();
    CaptureSession::new(SessionConfig::default(), test_registry())
}

fn secured_session() -> CaptureSession {
    new_session().with_security_layer(Arc::new(XorSecurityLayer { key: KEY }))
}

fn only_message(report: &SegmentReport) -> &Dissection {
    let mut messages = report.messages();
    let message = messages.next().expect("no message in report");
    assert!(messages.next().is_none());
    message
}

fn send(session: &mut CaptureSession, frame: u64, message: &Bytes) -> SegmentReport {
    session.process(&to_server(frame, 0), encode_record(message, 1 << 16))
}

fn answer(session: &mut CaptureSession, frame: u64, message: &Bytes) -> SegmentReport {
    session.process(&to_client(frame, 0), encode_record(message, 1 << 16))
}

fn call_credential(dissection: &Dissection) -> &Credential {
    match &dissection.header {
        Header::Call { credential, .. } => &credential.credential,
        other => panic!("expected call header, got {:?}", other),
    }
}

fn string_arg(path: &str) -> Bytes {
    let mut args = XdrWriter::new();
    args.put_string(path);
    args.into_bytes()
}

/// Run the RPCSEC_GSS init exchange; returns the init reply
fn establish_context(session: &mut CaptureSession) -> Dissection {
    let init = gss_call(1, MOUNT_NULL, gss_credential(1, 0, 1, &[]), &{
        let mut token = XdrWriter::new();
        token.put_opaque(b"krb5-ap-req");
        token.into_bytes()
    });
    let report = send(session, 1, &init);
    let call = only_message(&report);
    assert_eq!(
        call.outcome,
        Outcome::Dissected {
            payload: Payload::Control(ControlMessage::GssInitArg {
                token: Bytes::from_static(b"krb5-ap-req"),
            }),
            trailing: Bytes::new(),
        }
    );

    let mut result = XdrWriter::new();
    result.put_opaque(HANDLE);
    result.put_u32(0);
    result.put_u32(0);
    result.put_u32(128);
    result.put_opaque(b"krb5-ap-rep");
    let report = answer(session, 2, &success_reply(1, &result.into_bytes()));
    only_message(&report).clone()
}

#[test]
fn test_auth_unix_credential() {
    let mut session = new_session();
    let header = CallHeader::new(10, MOUNT_UMNT).with_credential(unix_credential("client01", 1000, 100, &[4, 24, 27]));
    let report = send(&mut session, 1, &encode_call(&header, &string_arg("/export")));

    let call = only_message(&report);
    let Credential::Unix(unix) = call_credential(call) else {
        panic!("expected AUTH_UNIX, got {:?}", call_credential(call));
    };
    assert_eq!(unix.machine_name, "client01");
    assert_eq!((unix.uid, unix.gid), (1000, 100));
    assert_eq!(unix.gids, vec![4, 24, 27]);
    assert_eq!(call.flavor, FlavorClass::NotGss);
    assert!(!call.outcome.is_opaque());
}

#[test]
fn test_unknown_flavor_does_not_stop_dissection() {
    let mut session = new_session();
    let body = Bytes::from_static(&[1, 2, 3, 4, 5]);
    let header = CallHeader::new(11, MOUNT_UMNT).with_credential(OpaqueAuth::new(424242, body.clone()));
    let report = send(&mut session, 1, &encode_call(&header, &string_arg("/tmp")));

    let call = only_message(&report);
    assert_eq!(
        call_credential(call),
        &Credential::Opaque {
            flavor: 424242,
            body
        }
    );
    assert_eq!(
        call.outcome,
        Outcome::Dissected {
            payload: Payload::Value(Value::String("/tmp".into())),
            trailing: Bytes::new(),
        }
    );
}

#[test]
fn test_gss_context_lifecycle() {
    let mut session = new_session();
    let reply = establish_context(&mut session);

    let Outcome::Dissected {
        payload: Payload::Control(ControlMessage::GssInitResult { result, context }),
        ..
    } = &reply.outcome
    else {
        panic!("expected init result, got {:?}", reply.outcome);
    };
    assert_eq!(&result.context[..], HANDLE);
    assert_eq!(result.window, 128);
    assert_eq!(context.unwrap().created_frame, Some(2));

    // Data call under the new context
    let data = gss_call(2, MOUNT_UMNT, gss_credential(0, 1, 1, HANDLE), &string_arg("/x"));
    let report = send(&mut session, 3, &data);
    let call = only_message(&report);
    assert_eq!(
        call.flavor,
        FlavorClass::Gss {
            procedure: GssProcedure::Data,
            service: GssService::None
        }
    );
    let Header::Call { credential, .. } = &call.header else {
        unreachable!()
    };
    assert_eq!(credential.context.unwrap().created_frame, Some(2));
    assert_eq!(credential.context.unwrap().destroyed_frame, None);

    // Destroy carries no verifier
    let destroy = encode_call(
        &CallHeader::new(3, MOUNT_NULL)
            .with_credential(gss_credential(3, 2, 1, HANDLE))
            .with_verifier(None),
        &[],
    );
    let report = send(&mut session, 4, &destroy);
    let call = only_message(&report);
    let Header::Call { credential, verifier } = &call.header else {
        unreachable!()
    };
    assert!(verifier.is_none());
    assert_eq!(credential.context.unwrap().destroyed_frame, Some(4));
    assert_eq!(
        session.contexts().lookup(HANDLE).unwrap().created_frame,
        Some(2)
    );
    assert_eq!(session.contexts().len(), 1);
}

#[test]
fn test_gss_integrity_verified() {
    let mut session = secured_session();
    establish_context(&mut session);

    let body = string_arg("/secure");
    let mut signed = 5u32.to_be_bytes().to_vec();
    signed.extend_from_slice(&body);
    let good = integrity_envelope(5, &body, &XorSecurityLayer::checksum(&signed));
    let bad = integrity_envelope(5, &body, &[0, 0, 0, 0]);

    for (xid, envelope, expected) in [(20, good, Some(true)), (21, bad, Some(false))] {
        let call = gss_call(xid, MOUNT_UMNT, gss_credential(0, 5, 2, HANDLE), &envelope);
        let report = send(&mut session, xid as u64, &call);
        let Outcome::Dissected {
            payload: Payload::Integrity { sequence, value, verified, .. },
            ..
        } = &only_message(&report).outcome
        else {
            panic!("expected integrity payload");
        };
        assert_eq!(*sequence, 5);
        assert_eq!(value, &Value::String("/secure".into()));
        assert_eq!(*verified, expected);
    }
}

#[test]
fn test_gss_integrity_without_layer_is_unverified() {
    let mut session = new_session();
    establish_context(&mut session);

    let body = string_arg("/plain");
    let call = gss_call(30, MOUNT_UMNT, gss_credential(0, 9, 2, HANDLE), &integrity_envelope(9, &body, &[1, 2]));
    let report = send(&mut session, 30, &call);
    assert!(matches!(
        only_message(&report).outcome,
        Outcome::Dissected {
            payload: Payload::Integrity { verified: None, .. },
            ..
        }
    ));
}

#[test]
fn test_gss_privacy_decrypted() {
    let mut session = secured_session();
    establish_context(&mut session);
    let layer = XorSecurityLayer { key: KEY };

    let sealed = layer.seal(6, &string_arg("/private"));
    let call = gss_call(40, MOUNT_UMNT, gss_credential(0, 6, 3, HANDLE), &sealed);
    let report = send(&mut session, 40, &call);
    assert_eq!(
        only_message(&report).outcome,
        Outcome::Dissected {
            payload: Payload::Privacy {
                sequence: 6,
                value: Value::String("/private".into()),
            },
            trailing: Bytes::new(),
        }
    );

    // The reply inherits the privacy service from its call
    let reply = answer(&mut session, 41, &success_reply(40, &layer.seal(6, &[])));
    assert!(matches!(
        only_message(&reply).outcome,
        Outcome::Dissected {
            payload: Payload::Privacy {
                sequence: 6,
                value: Value::Void
            },
            ..
        }
    ));
}

#[test]
fn test_gss_privacy_without_layer_shows_ciphertext() {
    let mut session = new_session();
    establish_context(&mut session);

    let sealed = XorSecurityLayer { key: KEY }.seal(7, &string_arg("/private"));
    let call = gss_call(50, MOUNT_UMNT, gss_credential(0, 7, 3, HANDLE), &sealed);
    let report = send(&mut session, 50, &call);
    assert_eq!(
        only_message(&report).outcome,
        Outcome::DissectedAsOpaque {
            reason: OpaqueReason::Undecryptable,
            bytes: sealed,
        }
    );
}

#[test]
fn test_wide_gss_handle_not_tracked() {
    let mut session = new_session();
    let wide = [0x42u8; 20];
    let destroy = encode_call(
        &CallHeader::new(60, MOUNT_NULL)
            .with_credential(gss_credential(3, 1, 1, &wide))
            .with_verifier(None),
        &[],
    );
    let report = send(&mut session, 1, &destroy);

    let Header::Call { credential, .. } = &only_message(&report).header else {
        unreachable!()
    };
    let Credential::Gss(gss) = &credential.credential else {
        panic!("expected RPCSEC_GSS credential");
    };
    assert_eq!(&gss.context[..], &wide[..]);
    assert_eq!(credential.context, None);
    assert!(session.contexts().is_empty());
}

#[test]
fn test_short_gss_credential_is_opaque() {
    let mut session = new_session();
    let header = CallHeader::new(70, MOUNT_UMNT)
        .with_credential(OpaqueAuth::new(flavor::RPCSEC_GSS, Bytes::from_static(&[0, 0, 0, 1])));
    let args = string_arg("/z");
    let report = send(&mut session, 1, &encode_call(&header, &args));

    let call = only_message(&report);
    assert_eq!(call.flavor, FlavorClass::GssNoInfo);
    assert_eq!(
        call.outcome,
        Outcome::DissectedAsOpaque {
            reason: OpaqueReason::GssNoInfo,
            bytes: args,
        }
    );
}

fn auth_gssapi_credential(auth_message: bool) -> OpaqueAuth {
    let mut body = XdrWriter::new();
    body.put_u32(2);
    body.put_u32(auth_message as u32);
    body.put_opaque(&[9, 9, 9, 9]);
    OpaqueAuth::new(flavor::AUTH_GSSAPI, body.into_bytes())
}

#[test]
fn test_auth_gssapi_control_exchange() {
    let mut session = new_session();
    // AUTH_GSSAPI INIT rides on RPC procedure 1
    let key = ProcedureKey::new(MOUNT_PROGRAM, MOUNT_VERSION, 1);
    let mut arg = XdrWriter::new();
    arg.put_u32(2);
    arg.put_opaque(b"token");
    let header = CallHeader::new(80, key).with_credential(auth_gssapi_credential(true));
    let report = send(&mut session, 1, &encode_call(&header, &arg.into_bytes()));

    let call = only_message(&report);
    assert!(matches!(call.flavor, FlavorClass::AuthGssApiMsg { .. }));
    assert!(matches!(
        &call.outcome,
        Outcome::Dissected {
            payload: Payload::Control(ControlMessage::AuthGssApiInitArg(arg)),
            ..
        } if &arg.token[..] == b"token"
    ));

    let mut result = XdrWriter::new();
    result.put_u32(2);
    result.put_opaque(&[1, 2, 3, 4]);
    result.put_u32(0);
    result.put_u32(0);
    result.put_opaque(b"reply-token");
    result.put_opaque(&[0, 0, 0, 1]);
    let report = answer(&mut session, 2, &success_reply(80, &result.into_bytes()));
    let Outcome::Dissected {
        payload: Payload::Control(ControlMessage::AuthGssApiInitResult(init)),
        ..
    } = &only_message(&report).outcome
    else {
        panic!("expected AUTH_GSSAPI init result");
    };
    assert_eq!(&init.handle[..], &[1, 2, 3, 4]);
    assert_eq!(&init.initial_sequence[..], &[0, 0, 0, 1]);
}

#[test]
fn test_auth_gssapi_data_is_sealed() {
    let mut session = new_session();
    let header = CallHeader::new(90, MOUNT_UMNT).with_credential(auth_gssapi_credential(false));
    let sealed = Bytes::from_static(&[0xaa; 24]);
    let report = send(&mut session, 1, &encode_call(&header, &sealed));

    assert_eq!(
        only_message(&report).outcome,
        Outcome::DissectedAsOpaque {
            reason: OpaqueReason::Sealed,
            bytes: sealed,
        }
    );
}
