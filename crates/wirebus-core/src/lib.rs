//! wirebus core: wire protocol primitives, error types, and the shared
//! runtime pieces (task supervision, ACK correlation) used by both the
//! server and the client crates.
//!
//! This crate defines the envelope/payload contracts and the error surface
//! shared across the bus. It carries no transport dependency so the same
//! types serve the axum server and the tungstenite client.
//!
//! # Defensive guarantees
//! Panics, `unwrap`, and `expect` are compile-denied here
//! (`#![deny(clippy::panic, clippy::unwrap_used, clippy::expect_used)]`).
//! All fallible paths must surface as `BusError`/`Result` so production
//! processes do not crash on malformed input or bad traffic.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod ack;
pub mod error;
pub mod protocol;
pub mod task;

/// Shared result type.
pub use error::{BusError, Result};
