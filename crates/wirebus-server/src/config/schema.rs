use serde::Deserialize;
use wirebus_core::error::{BusError, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    pub version: u32,

    #[serde(default)]
    pub server: ServerSection,
}

impl ServerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.version != 1 {
            return Err(BusError::UnsupportedVersion(self.version));
        }
        self.server.validate()?;
        Ok(())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            version: 1,
            server: ServerSection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerSection {
    #[serde(default = "default_listen")]
    pub listen: String,

    /// WebSocket upgrade path.
    #[serde(default = "default_path")]
    pub path: String,

    /// Bound on a single receive wait. A timeout is not an error; it is
    /// how an idle dispatcher loop observes the stopping flag.
    #[serde(default = "default_recv_timeout_ms")]
    pub recv_timeout_ms: u64,

    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,

    /// Grace given to in-flight handler tasks before forced abort.
    #[serde(default = "default_handler_grace_ms")]
    pub handler_grace_ms: u64,

    /// Window for dispatcher loops to notice the stopping flag on their own.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,

    /// Bound on waiting for the listener task during teardown.
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,

    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            path: default_path(),
            recv_timeout_ms: default_recv_timeout_ms(),
            ping_interval_ms: default_ping_interval_ms(),
            handler_grace_ms: default_handler_grace_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

impl ServerSection {
    pub fn validate(&self) -> Result<()> {
        if !self.path.starts_with('/') {
            return Err(BusError::BadRequest(
                "server.path must start with '/'".into(),
            ));
        }
        if !(50..=10_000).contains(&self.recv_timeout_ms) {
            return Err(BusError::BadRequest(
                "server.recv_timeout_ms must be between 50 and 10000".into(),
            ));
        }
        if !(1000..=120_000).contains(&self.ping_interval_ms) {
            return Err(BusError::BadRequest(
                "server.ping_interval_ms must be between 1000 and 120000".into(),
            ));
        }
        if !(50..=30_000).contains(&self.handler_grace_ms) {
            return Err(BusError::BadRequest(
                "server.handler_grace_ms must be between 50 and 30000".into(),
            ));
        }
        if !(10..=5_000).contains(&self.shutdown_grace_ms) {
            return Err(BusError::BadRequest(
                "server.shutdown_grace_ms must be between 10 and 5000".into(),
            ));
        }
        if self.shutdown_timeout_ms < self.shutdown_grace_ms {
            return Err(BusError::BadRequest(
                "server.shutdown_timeout_ms must not be below shutdown_grace_ms".into(),
            ));
        }
        if self.max_frame_bytes == 0 {
            return Err(BusError::BadRequest(
                "server.max_frame_bytes must be positive".into(),
            ));
        }
        Ok(())
    }
}

fn default_listen() -> String {
    "0.0.0.0:8080".into()
}
fn default_path() -> String {
    "/v1/bus".into()
}
fn default_recv_timeout_ms() -> u64 {
    1000
}
fn default_ping_interval_ms() -> u64 {
    20000
}
fn default_handler_grace_ms() -> u64 {
    1500
}
fn default_shutdown_grace_ms() -> u64 {
    100
}
fn default_shutdown_timeout_ms() -> u64 {
    5000
}
fn default_max_frame_bytes() -> usize {
    1_048_576
}
