//! Envelope codec (outer wire wrapper).
//!
//! The codec validates envelope shape only; payload business semantics are
//! checked by the routing layer (`payload::Payload::check_routable`).

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{BusError, Result};
use crate::protocol::payload::Payload;

/// Current wire protocol version.
pub const PROTOCOL_VERSION: u32 = 1;

/// Envelope kind discriminator. Wire values: `sys_std`, `sys_ack`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvelopeKind {
    #[serde(rename = "sys_std")]
    Standard,
    #[serde(rename = "sys_ack")]
    Ack,
}

/// Sender metadata. For acks, `acked_msg_id` names the message being
/// acknowledged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Meta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    /// Unix epoch milliseconds at send time.
    #[serde(default)]
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acked_msg_id: Option<String>,
}

/// Outer wire unit. `payload` is required for `Standard` envelopes and
/// absent for acks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub version: u32,
    /// Sender-generated, unique per logical message. May be empty, in
    /// which case the receiver will not acknowledge.
    #[serde(default)]
    pub msg_id: String,
    pub kind: EnvelopeKind,
    #[serde(default)]
    pub meta: Meta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Payload>,
}

impl Envelope {
    /// Build a `Standard` envelope with a fresh uuid-v4 `msg_id`.
    pub fn standard(payload: Payload) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            msg_id: Uuid::new_v4().to_string(),
            kind: EnvelopeKind::Standard,
            meta: Meta {
                timestamp: now_ms(),
                ..Meta::default()
            },
            payload: Some(payload),
        }
    }

    /// Build the acknowledgement reply for a received envelope.
    ///
    /// Returns `None` when the input is itself an ack (acks are never
    /// re-acked) or carries an empty `msg_id`.
    pub fn ack_for(received: &Envelope) -> Option<Envelope> {
        if received.kind == EnvelopeKind::Ack || received.msg_id.is_empty() {
            return None;
        }
        Some(Envelope {
            version: PROTOCOL_VERSION,
            msg_id: Uuid::new_v4().to_string(),
            kind: EnvelopeKind::Ack,
            meta: Meta {
                timestamp: now_ms(),
                acked_msg_id: Some(received.msg_id.clone()),
                ..Meta::default()
            },
            payload: None,
        })
    }
}

/// Serialize an envelope to its wire form. Never fails on well-formed
/// input; `version` and `msg_id` are always emitted.
pub fn encode(env: &Envelope) -> Result<String> {
    serde_json::to_string(env).map_err(|e| BusError::Internal(format!("encode failed: {e}")))
}

/// Parse an envelope from its wire form.
///
/// Fails with `MalformedEnvelope` on invalid JSON, a missing `kind`, or a
/// `Standard` envelope without a payload. Unknown extra fields are ignored
/// for forward compatibility.
pub fn decode(s: &str) -> Result<Envelope> {
    let env: Envelope = serde_json::from_str(s)
        .map_err(|e| BusError::MalformedEnvelope(format!("invalid envelope json: {e}")))?;
    if env.version != PROTOCOL_VERSION {
        return Err(BusError::UnsupportedVersion(env.version));
    }
    if env.kind == EnvelopeKind::Standard && env.payload.is_none() {
        return Err(BusError::MalformedEnvelope(
            "standard envelope without payload".into(),
        ));
    }
    Ok(env)
}

/// Unix epoch milliseconds.
pub fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
