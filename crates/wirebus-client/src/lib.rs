//! wirebus client library entry.
//!
//! Two connection managers over the same primitives:
//! - `single::Client` — one cached `(url, api_key, platform)` tuple.
//! - `multi::MultiClient` — a named connection table with tiered inbound
//!   matching.
//!
//! Both auto-acknowledge inbound standard envelopes, track their own
//! outbound acks, and reconnect with capped exponential backoff on
//! unexpected disconnects.

pub mod dispatch;
pub mod multi;
pub mod reconnect;
pub mod single;
pub mod transport;

pub use dispatch::{ClientCtx, ClientHandlerRegistry, InboundHandler};
pub use multi::{ClientConnectionEntry, MultiClient};
pub use reconnect::{ReconnectPolicy, ReconnectSchedule};
pub use single::{Client, ClientConfig};
pub use transport::TlsOptions;
