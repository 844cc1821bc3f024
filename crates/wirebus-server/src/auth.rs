//! Authentication gate.
//!
//! The gate is consulted at two distinct times with different inputs:
//! 1. Connect time: the full `ConnectMeta` snapshot decides accept/reject
//!    and the resolver picks the registry bucket (`user_id`).
//! 2. Send time: the resolver alone maps a `message_dim` to the recipient
//!    `user_id`; nothing is gated. A resolver failure at send time is
//!    terminal for that attempt (no retry) and is reported as an
//!    unresolvable route, never a crash.

use std::collections::HashMap;

use async_trait::async_trait;

use wirebus_core::error::{BusError, Result};

/// Sanitized snapshot of a connection's identity material: query
/// parameters and headers, minus credentials we never want to retain.
#[derive(Debug, Clone, Default)]
pub struct ConnectMeta {
    pub api_key: String,
    pub platform: String,
    /// Optional caller-supplied instance id (`x-uuid`).
    pub client_uuid: Option<String>,
    /// Lowercased header snapshot, sensitive entries removed.
    pub headers: HashMap<String, String>,
}

/// Connect-time accept/reject decision.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, meta: &ConnectMeta) -> bool;
}

/// Maps an `(api_key, platform)` pair to the routing identity.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn resolve_user(&self, api_key: &str, platform: &str) -> Result<String>;
}

/// Default gate: any connection presenting a non-empty api_key and
/// platform is accepted, and the api_key doubles as the user id.
#[derive(Debug, Default)]
pub struct KeyIdentity;

#[async_trait]
impl Authenticator for KeyIdentity {
    async fn authenticate(&self, meta: &ConnectMeta) -> bool {
        !meta.api_key.is_empty() && !meta.platform.is_empty()
    }
}

#[async_trait]
impl IdentityResolver for KeyIdentity {
    async fn resolve_user(&self, api_key: &str, _platform: &str) -> Result<String> {
        if api_key.is_empty() {
            return Err(BusError::RouteUnresolved("empty api_key".into()));
        }
        Ok(api_key.to_string())
    }
}
