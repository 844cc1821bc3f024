//! Wire protocol (JSON over WebSocket text frames).
//!
//! Two layers:
//! - `envelope`: the outer wrapper carrying protocol version, message id,
//!   kind (`sys_std` / `sys_ack`), and sender metadata.
//! - `payload`: the inner business message (info + content segment +
//!   routing target).
//!
//! All parsers are panic-free: malformed input is reported as `BusError`
//! instead of panicking, keeping both endpoints resilient to hostile
//! traffic. Unknown fields are ignored for forward compatibility.

pub mod envelope;
pub mod payload;

pub use envelope::{decode, encode, Envelope, EnvelopeKind, Meta, PROTOCOL_VERSION};
pub use payload::{GroupInfo, MessageDim, MessageInfo, MessageSegment, Payload, SenderInfo};
