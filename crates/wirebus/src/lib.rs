//! Umbrella crate: one dependency for applications that embed both ends
//! of the bus, and the home of the end-to-end tests.

pub use wirebus_core::{ack, error, protocol, task};

pub use wirebus_server::{auth, config, dispatch, registry, routing, server, services, stats};
pub use wirebus_server::{AppState, BusServer};

pub use wirebus_client::{
    Client, ClientConfig, ClientConnectionEntry, ClientCtx, ClientHandlerRegistry, InboundHandler,
    MultiClient, ReconnectPolicy, TlsOptions,
};
