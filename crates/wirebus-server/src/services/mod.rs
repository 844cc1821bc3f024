//! Built-in handlers.

pub mod relay;

pub use relay::RelayHandler;
