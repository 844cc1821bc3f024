//! Shared error type across wirebus crates.

use thiserror::Error;

/// Shared result type.
pub type Result<T> = std::result::Result<T, BusError>;

/// Unified error type used by core, server, and client.
///
/// Expected, frequent outcomes (auth rejection, unresolvable route) are
/// still modeled as values where they occur; these variants exist so the
/// outcome can be reported and logged uniformly, not so it can be thrown
/// across connections. An error scoped to one message or one connection
/// must never abort processing for the others.
#[derive(Debug, Error)]
pub enum BusError {
    /// Connect-time authentication failed; the socket is closed before any
    /// registry entry is created.
    #[error("auth rejected: {0}")]
    AuthRejected(String),
    /// Frame could not be decoded into an envelope; the frame is dropped
    /// and the connection continues.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),
    /// Recipient could not be resolved to any live connection.
    #[error("route unresolved: {0}")]
    RouteUnresolved(String),
    /// A business handler failed; caught per task.
    #[error("handler failure: {0}")]
    HandlerFailure(String),
    /// The client gave up after exhausting its reconnect attempts.
    #[error("reconnect exhausted after {0} attempts")]
    ReconnectExhausted(u32),
    /// A teardown stage exceeded its bound; teardown proceeds regardless.
    #[error("shutdown stage timed out: {0}")]
    ShutdownTimeout(&'static str),
    /// `start()` called on an already-running instance.
    #[error("already running")]
    AlreadyRunning,
    /// Operation requires a live connection.
    #[error("not connected")]
    NotConnected,
    /// Socket-level failure (connect, read, write).
    #[error("transport: {0}")]
    Transport(String),
    /// Invalid input outside the envelope codec.
    #[error("bad request: {0}")]
    BadRequest(String),
    /// Unsupported protocol version on the wire.
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u32),
    /// Internal invariant violation.
    #[error("internal: {0}")]
    Internal(String),
}
