//! Routing engine (server outbound).
//!
//! Resolves a message's declared recipient (`message_dim`) to live
//! connections and fans out delivery. Per-connection outcomes are
//! independent: one failing socket never aborts delivery to others.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::Message;

use wirebus_core::ack::AckTracker;
use wirebus_core::protocol::{
    encode, Envelope, MessageDim, MessageSegment, Payload,
};

use crate::auth::IdentityResolver;
use crate::registry::{ConnectionId, ConnectionRegistry};
use crate::stats::BusStats;

/// Destination override for `send_custom`. A direct `connection` handle
/// bypasses the registry lookup.
#[derive(Debug, Clone, Default)]
pub struct CustomTarget {
    pub user: Option<String>,
    pub platform: Option<String>,
    pub connection: Option<ConnectionId>,
}

pub struct RoutingEngine {
    registry: Arc<ConnectionRegistry>,
    resolver: Arc<dyn IdentityResolver>,
    stats: Arc<BusStats>,
    acks: Arc<AckTracker>,
}

impl RoutingEngine {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        resolver: Arc<dyn IdentityResolver>,
        stats: Arc<BusStats>,
        acks: Arc<AckTracker>,
    ) -> Self {
        Self {
            registry,
            resolver,
            stats,
            acks,
        }
    }

    /// Deliver an envelope to every connection of its declared recipient.
    ///
    /// An unresolvable recipient (invalid `message_dim`, resolver failure)
    /// yields an empty result map; it is terminal for this attempt and is
    /// never retried internally. Messages that reach at least one
    /// connection are recorded in the ack tracker so receipts coming back
    /// resolve to a round-trip age.
    pub async fn send(&self, env: &Envelope) -> HashMap<ConnectionId, bool> {
        let mut results = HashMap::new();

        let Some(payload) = env.payload.as_ref() else {
            tracing::warn!(msg_id = %env.msg_id, "send called without payload");
            self.stats.inc_errors();
            return results;
        };
        if let Err(e) = payload.check_routable() {
            tracing::warn!(msg_id = %env.msg_id, error = %e, "unroutable message");
            self.stats.inc_errors();
            return results;
        }

        let dim = &payload.message_dim;
        let user = match self.resolver.resolve_user(&dim.api_key, &dim.platform).await {
            Ok(u) => u,
            Err(e) => {
                tracing::warn!(msg_id = %env.msg_id, error = %e, "recipient unresolvable");
                self.stats.inc_errors();
                return results;
            }
        };

        let Ok(wire) = encode(env) else {
            self.stats.inc_errors();
            return results;
        };

        for id in self.registry.lookup(&user, &dim.platform) {
            let ok = self.deliver(id, wire.clone()).await;
            results.insert(id, ok);
        }
        if results.values().any(|ok| *ok) {
            self.acks.track(&env.msg_id);
        } else if results.is_empty() {
            tracing::debug!(user = %user, platform = %dim.platform, "no live connections for recipient");
        }
        results
    }

    /// Deliver to every registered connection, optionally filtered by
    /// platform.
    pub async fn broadcast(
        &self,
        env: &Envelope,
        platform: Option<&str>,
    ) -> HashMap<ConnectionId, bool> {
        let mut results = HashMap::new();
        let Ok(wire) = encode(env) else {
            self.stats.inc_errors();
            return results;
        };
        for id in self.registry.ids(platform) {
            let ok = self.deliver(id, wire.clone()).await;
            results.insert(id, ok);
        }
        if results.values().any(|ok| *ok) {
            self.acks.track(&env.msg_id);
        }
        results
    }

    /// Build and deliver a message of the given segment type. With a
    /// direct `connection` handle the registry lookup is skipped; otherwise
    /// the target user/platform go through normal resolution.
    pub async fn send_custom(
        &self,
        seg_type: &str,
        data: serde_json::Value,
        target: CustomTarget,
    ) -> HashMap<ConnectionId, bool> {
        let dim = match (&target.connection, &target.user, &target.platform) {
            (Some(id), _, _) => self
                .registry
                .connection_info(*id)
                .map(|info| MessageDim {
                    api_key: info.user_id,
                    platform: info.platform,
                })
                .unwrap_or_default(),
            _ => MessageDim {
                api_key: target.user.clone().unwrap_or_default(),
                platform: target.platform.clone().unwrap_or_default(),
            },
        };

        let env = Envelope::standard(Payload {
            message_segment: MessageSegment {
                seg_type: seg_type.to_string(),
                data,
            },
            message_dim: dim,
            ..Payload::default()
        });

        if let Some(id) = target.connection {
            let mut results = HashMap::new();
            let ok = match encode(&env) {
                Ok(wire) => self.deliver(id, wire).await,
                Err(_) => {
                    self.stats.inc_errors();
                    false
                }
            };
            if ok {
                self.acks.track(&env.msg_id);
            }
            results.insert(id, ok);
            return results;
        }

        self.send(&env).await
    }

    async fn deliver(&self, id: ConnectionId, wire: String) -> bool {
        let Some(conn) = self.registry.get(id) else {
            return false;
        };
        let ok = conn.tx.send(Message::Text(wire)).await.is_ok();
        if ok {
            self.stats.inc_messages_out();
        } else {
            tracing::debug!(conn = %id, "delivery failed: outbound queue closed");
            self.stats.inc_errors();
        }
        ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{ConnectMeta, KeyIdentity};
    use crate::registry::Connection;
    use tokio::sync::mpsc;

    fn engine() -> (Arc<ConnectionRegistry>, Arc<AckTracker>, RoutingEngine) {
        let registry = Arc::new(ConnectionRegistry::new());
        let acks = Arc::new(AckTracker::new());
        let engine = RoutingEngine::new(
            Arc::clone(&registry),
            Arc::new(KeyIdentity),
            Arc::new(BusStats::new()),
            Arc::clone(&acks),
        );
        (registry, acks, engine)
    }

    fn attach(
        registry: &ConnectionRegistry,
        user: &str,
        platform: &str,
    ) -> (ConnectionId, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(8);
        let id = registry.next_id();
        registry.register(
            id,
            user.into(),
            platform.into(),
            ConnectMeta::default(),
            Connection { tx },
        );
        (id, rx)
    }

    fn addressed(api_key: &str, platform: &str) -> Envelope {
        Envelope::standard(Payload {
            message_segment: MessageSegment {
                seg_type: "text".into(),
                data: serde_json::json!({"text": "hi"}),
            },
            message_dim: MessageDim {
                api_key: api_key.into(),
                platform: platform.into(),
            },
            ..Payload::default()
        })
    }

    #[tokio::test]
    async fn send_hits_only_the_exact_platform_bucket() {
        let (registry, _acks, engine) = engine();
        let (p1, mut rx1) = attach(&registry, "A", "p1");
        let (_p2, mut rx2) = attach(&registry, "A", "p2");

        let results = engine.send(&addressed("A", "p1")).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results.get(&p1), Some(&true));

        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn one_dead_socket_does_not_abort_the_rest() {
        let (registry, _acks, engine) = engine();
        let (alive, mut rx_alive) = attach(&registry, "A", "p1");
        let (dead, rx_dead) = attach(&registry, "A", "p1");
        drop(rx_dead);

        let results = engine.send(&addressed("A", "p1")).await;
        assert_eq!(results.get(&alive), Some(&true));
        assert_eq!(results.get(&dead), Some(&false));
        assert!(rx_alive.try_recv().is_ok());
    }

    #[tokio::test]
    async fn delivered_sends_are_ack_tracked() {
        let (registry, acks, engine) = engine();
        let (_id, mut rx) = attach(&registry, "A", "p1");

        let env = addressed("A", "p1");
        engine.send(&env).await;
        assert!(rx.try_recv().is_ok());
        assert_eq!(acks.pending(), 1);

        // A receipt for the delivered message resolves to a round-trip age.
        assert!(acks.resolve(&env.msg_id).is_some());
        assert_eq!(acks.pending(), 0);

        // Failed deliveries are not tracked.
        let env = addressed("nobody", "p1");
        engine.send(&env).await;
        assert!(acks.resolve(&env.msg_id).is_none());
    }

    #[tokio::test]
    async fn unroutable_dim_yields_empty_result() {
        let (_registry, _acks, engine) = engine();
        let results = engine.send(&addressed("", "p1")).await;
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn broadcast_filters_by_platform() {
        let (registry, _acks, engine) = engine();
        let (p1, mut rx1) = attach(&registry, "A", "p1");
        let (_p2, mut rx2) = attach(&registry, "B", "p2");

        let env = addressed("A", "p1");
        let results = engine.broadcast(&env, Some("p1")).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results.get(&p1), Some(&true));
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_err());

        let all = engine.broadcast(&env, None).await;
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn send_custom_direct_connection_bypasses_lookup() {
        let (registry, _acks, engine) = engine();
        let (id, mut rx) = attach(&registry, "A", "p1");

        let results = engine
            .send_custom(
                "notice",
                serde_json::json!({"note": "direct"}),
                CustomTarget {
                    connection: Some(id),
                    ..CustomTarget::default()
                },
            )
            .await;
        assert_eq!(results.get(&id), Some(&true));

        let Some(Message::Text(wire)) = rx.try_recv().ok() else {
            panic!("expected a text frame");
        };
        let env = wirebus_core::protocol::decode(&wire).unwrap();
        let payload = env.payload.unwrap();
        assert_eq!(payload.message_segment.seg_type, "notice");
        assert_eq!(payload.message_dim.api_key, "A");
    }

    #[tokio::test]
    async fn send_custom_by_user_goes_through_resolution() {
        let (registry, _acks, engine) = engine();
        let (id, mut rx) = attach(&registry, "A", "p1");

        let results = engine
            .send_custom(
                "notice",
                serde_json::json!({}),
                CustomTarget {
                    user: Some("A".into()),
                    platform: Some("p1".into()),
                    connection: None,
                },
            )
            .await;
        assert_eq!(results.get(&id), Some(&true));
        assert!(rx.try_recv().is_ok());
    }
}
