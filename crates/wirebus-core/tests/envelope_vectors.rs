//! Envelope codec vector tests.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use wirebus_core::error::BusError;
use wirebus_core::protocol::{
    decode, encode, Envelope, EnvelopeKind, MessageDim, MessageSegment, Payload,
};

fn sample_payload() -> Payload {
    Payload {
        message_segment: MessageSegment {
            seg_type: "text".into(),
            data: serde_json::json!({"text": "hello"}),
        },
        message_dim: MessageDim {
            api_key: "bot-1".into(),
            platform: "qq".into(),
        },
        ..Payload::default()
    }
}

#[test]
fn round_trip_standard() {
    let env = Envelope::standard(sample_payload());
    let wire = encode(&env).unwrap();
    let back = decode(&wire).unwrap();
    assert_eq!(env, back);
}

#[test]
fn round_trip_ack() {
    let std_env = Envelope::standard(sample_payload());
    let ack = Envelope::ack_for(&std_env).unwrap();
    assert_eq!(ack.kind, EnvelopeKind::Ack);
    assert_eq!(ack.meta.acked_msg_id.as_deref(), Some(std_env.msg_id.as_str()));

    let wire = encode(&ack).unwrap();
    assert_eq!(ack, decode(&wire).unwrap());
}

#[test]
fn ack_is_never_re_acked() {
    let std_env = Envelope::standard(sample_payload());
    let ack = Envelope::ack_for(&std_env).unwrap();
    assert!(Envelope::ack_for(&ack).is_none());
}

#[test]
fn empty_msg_id_gets_no_ack() {
    let mut env = Envelope::standard(sample_payload());
    env.msg_id.clear();
    assert!(Envelope::ack_for(&env).is_none());
}

#[test]
fn decode_rejects_invalid_json() {
    assert!(matches!(
        decode("{not json"),
        Err(BusError::MalformedEnvelope(_))
    ));
}

#[test]
fn decode_rejects_missing_kind() {
    let s = r#"{"version":1,"msg_id":"m1"}"#;
    assert!(matches!(decode(s), Err(BusError::MalformedEnvelope(_))));
}

#[test]
fn decode_rejects_standard_without_payload() {
    let s = r#"{"version":1,"msg_id":"m1","kind":"sys_std"}"#;
    assert!(matches!(decode(s), Err(BusError::MalformedEnvelope(_))));
}

#[test]
fn decode_rejects_wrong_version() {
    let s = r#"{"version":9,"msg_id":"m1","kind":"sys_ack"}"#;
    assert!(matches!(decode(s), Err(BusError::UnsupportedVersion(9))));
}

#[test]
fn decode_ignores_unknown_fields() {
    let s = r#"{
        "version": 1,
        "msg_id": "m1",
        "kind": "sys_ack",
        "meta": {"acked_msg_id": "m0", "future_field": true},
        "extra_top_level": [1, 2, 3]
    }"#;
    let env = decode(s).unwrap();
    assert_eq!(env.kind, EnvelopeKind::Ack);
    assert_eq!(env.meta.acked_msg_id.as_deref(), Some("m0"));
}

#[test]
fn ack_without_payload_decodes() {
    let s = r#"{"version":1,"msg_id":"m2","kind":"sys_ack","meta":{"acked_msg_id":"m1"}}"#;
    let env = decode(s).unwrap();
    assert!(env.payload.is_none());
}

#[test]
fn wire_kind_values_are_stable() {
    let env = Envelope::standard(sample_payload());
    let wire = encode(&env).unwrap();
    assert!(wire.contains(r#""kind":"sys_std""#));
    let ack = Envelope::ack_for(&env).unwrap();
    assert!(encode(&ack).unwrap().contains(r#""kind":"sys_ack""#));
}
