//! Multi-connection manager.
//!
//! Keeps a named table of connection entries, each backed by its own
//! single-connection client, and routes inbound messages to handlers via
//! tiered identity matching on `message_dim`:
//!
//! 1. exact `(api_key, platform)` match
//! 2. `api_key` only
//! 3. `platform` only
//! 4. the default handler, with no connection context
//!
//! Messages matching none of the tiers and with no default handler are
//! dropped with a warning.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::DashMap;

use wirebus_core::error::{BusError, Result};
use wirebus_core::protocol::envelope::Envelope;
use wirebus_core::protocol::payload::{MessageDim, Payload};
use wirebus_core::task::TaskSupervisor;

use crate::dispatch::{ClientCtx, ClientHandlerRegistry, InboundDispatch, InboundHandler};
use crate::reconnect::ReconnectPolicy;
use crate::single::{Client, ClientConfig};
use crate::transport::TlsOptions;

/// One named endpoint identity managed by [`MultiClient`].
#[derive(Debug, Clone)]
pub struct ClientConnectionEntry {
    /// Unique handle used by all per-connection operations.
    pub name: String,
    pub url: String,
    pub api_key: String,
    pub platform: String,
    pub tls: TlsOptions,
    pub reconnect: ReconnectPolicy,
}

impl ClientConnectionEntry {
    fn to_config(&self) -> ClientConfig {
        ClientConfig {
            url: self.url.clone(),
            api_key: self.api_key.clone(),
            platform: self.platform.clone(),
            tls: self.tls.clone(),
            reconnect: self.reconnect.clone(),
            ..ClientConfig::default()
        }
    }
}

struct ManagedConn {
    entry: ClientConnectionEntry,
    client: Client,
}

struct MultiInner {
    conns: DashMap<String, ManagedConn>,
    handlers: Arc<ClientHandlerRegistry>,
    supervisor: Arc<TaskSupervisor>,
}

/// Manager for several concurrent connections sharing one handler table.
///
/// Cloning shares the connection table and handlers.
#[derive(Clone)]
pub struct MultiClient {
    inner: Arc<MultiInner>,
}

impl Default for MultiClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MultiClient {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MultiInner {
                conns: DashMap::new(),
                handlers: Arc::new(ClientHandlerRegistry::new()),
                supervisor: Arc::new(TaskSupervisor::new()),
            }),
        }
    }

    pub fn handlers(&self) -> &Arc<ClientHandlerRegistry> {
        &self.inner.handlers
    }

    pub fn register(&self, seg_type: &str, handler: Arc<dyn InboundHandler>) {
        self.inner.handlers.register(seg_type, handler);
    }

    pub fn register_default(&self, handler: Arc<dyn InboundHandler>) {
        self.inner.handlers.register_default(handler);
    }

    /// Add a connection entry without connecting it. Fails with
    /// `BadRequest` when the name is already taken.
    pub fn register_connection(&self, entry: ClientConnectionEntry) -> Result<()> {
        if entry.name.is_empty() {
            return Err(BusError::BadRequest("connection name is empty".into()));
        }
        if self.inner.conns.contains_key(&entry.name) {
            return Err(BusError::BadRequest(format!(
                "connection '{}' already registered",
                entry.name
            )));
        }
        let client = self.build_client(&entry);
        self.inner.conns.insert(
            entry.name.clone(),
            ManagedConn { entry, client },
        );
        Ok(())
    }

    /// Replace an existing entry. A live connection is torn down first and
    /// re-established with the new settings.
    pub async fn update_connection(&self, entry: ClientConnectionEntry) -> Result<()> {
        let (old_client, was_connected) = {
            let conn = self
                .inner
                .conns
                .get(&entry.name)
                .ok_or_else(|| BusError::BadRequest(format!("unknown connection '{}'", entry.name)))?;
            (conn.client.clone(), conn.client.is_connected())
        };
        if was_connected {
            old_client.disconnect().await?;
        }
        let client = self.build_client(&entry);
        self.inner.conns.insert(
            entry.name.clone(),
            ManagedConn {
                entry: entry.clone(),
                client: client.clone(),
            },
        );
        if was_connected {
            client.connect().await?;
        }
        Ok(())
    }

    /// Remove an entry, force-disconnecting it if live.
    pub async fn unregister_connection(&self, name: &str) -> Result<()> {
        let (_, conn) = self
            .inner
            .conns
            .remove(name)
            .ok_or_else(|| BusError::BadRequest(format!("unknown connection '{name}'")))?;
        if conn.client.is_connected() {
            conn.client.disconnect().await?;
        }
        Ok(())
    }

    pub async fn connect(&self, name: &str) -> Result<()> {
        self.client(name)?.connect().await
    }

    pub async fn disconnect(&self, name: &str) -> Result<()> {
        self.client(name)?.disconnect().await
    }

    /// Connect every registered entry. Failures are logged per connection;
    /// returns how many are live afterwards.
    pub async fn connect_all(&self) -> usize {
        let clients: Vec<(String, Client)> = self
            .inner
            .conns
            .iter()
            .map(|c| (c.key().clone(), c.client.clone()))
            .collect();
        let mut live = 0;
        for (name, client) in clients {
            match client.connect().await {
                Ok(()) => live += 1,
                Err(e) => tracing::warn!(connection = %name, error = %e, "connect failed"),
            }
        }
        live
    }

    pub async fn disconnect_all(&self) {
        let clients: Vec<Client> = self.inner.conns.iter().map(|c| c.client.clone()).collect();
        for client in clients {
            if let Err(e) = client.disconnect().await {
                tracing::warn!(error = %e, "disconnect failed");
            }
        }
    }

    /// Send through the named connection. See [`Client::send`] for
    /// `message_dim` defaulting.
    pub async fn send(&self, name: &str, payload: Payload) -> Result<String> {
        self.client(name)?.send(payload).await
    }

    pub async fn send_custom(
        &self,
        name: &str,
        seg_type: &str,
        data: serde_json::Value,
        target: Option<MessageDim>,
    ) -> Result<String> {
        self.client(name)?.send_custom(seg_type, data, target).await
    }

    pub fn is_connected(&self, name: &str) -> bool {
        self.inner
            .conns
            .get(name)
            .map(|c| c.client.is_connected())
            .unwrap_or(false)
    }

    pub fn get_last_error(&self, name: &str) -> Option<String> {
        self.inner
            .conns
            .get(name)
            .and_then(|c| c.client.get_last_error())
    }

    pub fn connection_names(&self) -> Vec<String> {
        self.inner.conns.iter().map(|c| c.key().clone()).collect()
    }

    fn client(&self, name: &str) -> Result<Client> {
        self.inner
            .conns
            .get(name)
            .map(|c| c.client.clone())
            .ok_or_else(|| BusError::BadRequest(format!("unknown connection '{name}'")))
    }

    fn build_client(&self, entry: &ClientConnectionEntry) -> Client {
        let dispatch = Arc::new(TieredDispatch {
            inner: Arc::downgrade(&self.inner),
        });
        Client::with_dispatch(
            entry.to_config(),
            Arc::clone(&self.inner.handlers),
            dispatch,
            Arc::clone(&self.inner.supervisor),
        )
    }
}

/// Pick the connection an inbound message belongs to. `identities` holds
/// `(name, api_key, platform)` tuples.
fn tiered_match(identities: &[(String, String, String)], dim: &MessageDim) -> Option<String> {
    if let Some((name, _, _)) = identities
        .iter()
        .find(|(_, key, plat)| *key == dim.api_key && *plat == dim.platform)
    {
        return Some(name.clone());
    }
    if !dim.api_key.is_empty() {
        if let Some((name, _, _)) = identities.iter().find(|(_, key, _)| *key == dim.api_key) {
            return Some(name.clone());
        }
    }
    if !dim.platform.is_empty() {
        if let Some((name, _, _)) = identities.iter().find(|(_, _, plat)| *plat == dim.platform) {
            return Some(name.clone());
        }
    }
    None
}

/// Dispatch seam installed into every managed client. Holds a weak
/// reference so dropped managers tear down cleanly despite live receive
/// loops.
struct TieredDispatch {
    inner: Weak<MultiInner>,
}

#[async_trait]
impl InboundDispatch for TieredDispatch {
    async fn dispatch(&self, env: Envelope) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let dim = env
            .payload
            .as_ref()
            .map(|p| p.message_dim.clone())
            .unwrap_or_default();
        let seg_type = env
            .payload
            .as_ref()
            .map(|p| p.message_segment.seg_type.clone())
            .unwrap_or_default();

        let identities: Vec<(String, String, String)> = inner
            .conns
            .iter()
            .map(|c| {
                (
                    c.key().clone(),
                    c.entry.api_key.clone(),
                    c.entry.platform.clone(),
                )
            })
            .collect();

        let (handler, ctx) = match tiered_match(&identities, &dim) {
            Some(name) => match inner.handlers.resolve(&seg_type) {
                Some(h) => (
                    h,
                    ClientCtx {
                        connection: Some(name),
                    },
                ),
                None => {
                    tracing::warn!(connection = %name, seg_type = %seg_type, "no handler registered, dropping inbound message");
                    return;
                }
            },
            None => match inner.handlers.default_handler() {
                Some(h) => (h, ClientCtx::default()),
                None => {
                    tracing::warn!(
                        api_key = %dim.api_key,
                        platform = %dim.platform,
                        "no connection or default handler matches, dropping inbound message"
                    );
                    return;
                }
            },
        };

        inner.supervisor.spawn(async move {
            if let Err(e) = handler.handle(ctx, env).await {
                tracing::warn!(error = %e, "inbound handler failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use super::*;
    use wirebus_core::protocol::payload::MessageSegment;

    fn entry(name: &str, api_key: &str, platform: &str) -> ClientConnectionEntry {
        ClientConnectionEntry {
            name: name.to_string(),
            url: "ws://127.0.0.1:1/v1/bus".to_string(),
            api_key: api_key.to_string(),
            platform: platform.to_string(),
            tls: TlsOptions::default(),
            reconnect: ReconnectPolicy::default(),
        }
    }

    fn identities() -> Vec<(String, String, String)> {
        vec![
            ("a".into(), "k1".into(), "qq".into()),
            ("b".into(), "k1".into(), "wx".into()),
            ("c".into(), "k2".into(), "tg".into()),
        ]
    }

    fn dim(api_key: &str, platform: &str) -> MessageDim {
        MessageDim {
            api_key: api_key.into(),
            platform: platform.into(),
        }
    }

    #[test]
    fn exact_identity_wins() {
        assert_eq!(tiered_match(&identities(), &dim("k1", "wx")), Some("b".into()));
    }

    #[test]
    fn api_key_tier_beats_platform_tier() {
        // k2 exists only on "c"; platform qq exists only on "a".
        assert_eq!(tiered_match(&identities(), &dim("k2", "qq")), Some("c".into()));
    }

    #[test]
    fn platform_tier_is_the_last_resort() {
        assert_eq!(tiered_match(&identities(), &dim("k9", "tg")), Some("c".into()));
    }

    #[test]
    fn no_tier_matches_yields_none() {
        assert_eq!(tiered_match(&identities(), &dim("k9", "irc")), None);
        assert_eq!(tiered_match(&identities(), &dim("", "")), None);
    }

    #[test]
    fn duplicate_connection_names_are_rejected() {
        let multi = MultiClient::new();
        multi.register_connection(entry("a", "k1", "qq")).unwrap();
        let err = multi.register_connection(entry("a", "k2", "wx")).unwrap_err();
        assert!(matches!(err, BusError::BadRequest(_)));
        assert_eq!(multi.connection_names(), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn operations_on_unknown_names_fail() {
        let multi = MultiClient::new();
        assert!(matches!(
            multi.connect("nope").await,
            Err(BusError::BadRequest(_))
        ));
        assert!(matches!(
            multi.unregister_connection("nope").await,
            Err(BusError::BadRequest(_))
        ));
        assert!(matches!(
            multi.update_connection(entry("nope", "k", "p")).await,
            Err(BusError::BadRequest(_))
        ));
        assert!(!multi.is_connected("nope"));
    }

    struct Capture {
        seen: StdMutex<Vec<Option<String>>>,
    }

    #[async_trait]
    impl InboundHandler for Capture {
        async fn handle(&self, ctx: ClientCtx, _env: Envelope) -> wirebus_core::error::Result<()> {
            if let Ok(mut seen) = self.seen.lock() {
                seen.push(ctx.connection);
            }
            Ok(())
        }
    }

    fn standard(seg_type: &str, target: MessageDim) -> Envelope {
        Envelope::standard(Payload {
            message_segment: MessageSegment {
                seg_type: seg_type.to_string(),
                data: serde_json::json!({}),
            },
            message_dim: target,
            ..Payload::default()
        })
    }

    #[tokio::test]
    async fn inbound_messages_carry_the_matched_connection() {
        let multi = MultiClient::new();
        multi.register_connection(entry("a", "k1", "qq")).unwrap();
        multi.register_connection(entry("b", "k2", "wx")).unwrap();
        let capture = Arc::new(Capture {
            seen: StdMutex::new(Vec::new()),
        });
        multi.register("text", capture.clone());

        let dispatch = TieredDispatch {
            inner: Arc::downgrade(&multi.inner),
        };
        dispatch.dispatch(standard("text", dim("k2", "wx"))).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let seen = capture.seen.lock().unwrap().clone();
        assert_eq!(seen, vec![Some("b".to_string())]);
    }

    #[tokio::test]
    async fn unmatched_dim_falls_back_to_the_default_handler() {
        let multi = MultiClient::new();
        multi.register_connection(entry("a", "k1", "qq")).unwrap();
        let capture = Arc::new(Capture {
            seen: StdMutex::new(Vec::new()),
        });
        multi.register_default(capture.clone());

        let dispatch = TieredDispatch {
            inner: Arc::downgrade(&multi.inner),
        };
        dispatch.dispatch(standard("text", dim("k9", "irc"))).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let seen = capture.seen.lock().unwrap().clone();
        assert_eq!(seen, vec![None]);
    }
}
