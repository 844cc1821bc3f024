//! wirebus server library entry.
//!
//! This crate wires the transport, authentication gate, connection
//! registry, per-connection dispatcher, routing engine, and staged
//! shutdown into a cohesive WebSocket message bus. It is intended to be
//! consumed by the binary (`main.rs`) and by integration tests.

pub mod auth;
pub mod config;
pub mod dispatch;
pub mod ops;
pub mod registry;
pub mod router;
pub mod routing;
pub mod server;
pub mod services;
pub mod stats;
pub mod transport;

pub use server::{AppState, BusServer};
