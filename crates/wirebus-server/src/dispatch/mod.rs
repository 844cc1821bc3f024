//! Per-connection event dispatch.
//!
//! The receive loop itself lives in `transport::ws`; this module holds the
//! frame classification (standard message vs. ack), the inline auto-ack,
//! and the handler registry. Business handlers run as tracked, concurrent
//! tasks so one slow handler cannot stall delivery of subsequent frames on
//! the same socket; acks are sent synchronously through the outbound queue
//! so they preserve arrival order relative to each other.

use std::sync::Arc;
use std::sync::RwLock;

use async_trait::async_trait;
use axum::extract::ws::Message;
use tokio::sync::mpsc;

use wirebus_core::ack::AckTracker;
use wirebus_core::error::Result;
use wirebus_core::protocol::{decode, encode, Envelope, EnvelopeKind};
use wirebus_core::task::TaskSupervisor;

use crate::registry::ConnectionId;
use crate::routing::{CustomTarget, RoutingEngine};
use crate::stats::BusStats;

use dashmap::DashMap;

/// Business handler for one segment type. Failures are caught per task and
/// never affect other tasks or the dispatch loop.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, ctx: ServerCtx, env: Envelope) -> Result<()>;
}

/// Explicit, constructed handler table keyed by `message_segment.type`,
/// with an optional default slot. Shared between server instances by
/// cloning the `Arc`, never through implicit global state.
#[derive(Default)]
pub struct HandlerRegistry {
    by_type: DashMap<String, Arc<dyn MessageHandler>>,
    default: RwLock<Option<Arc<dyn MessageHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, seg_type: &str, handler: Arc<dyn MessageHandler>) {
        self.by_type.insert(seg_type.to_string(), handler);
    }

    pub fn register_default(&self, handler: Arc<dyn MessageHandler>) {
        if let Ok(mut slot) = self.default.write() {
            *slot = Some(handler);
        }
    }

    pub fn resolve(&self, seg_type: &str) -> Option<Arc<dyn MessageHandler>> {
        if let Some(h) = self.by_type.get(seg_type) {
            return Some(h.value().clone());
        }
        self.default.read().ok().and_then(|slot| slot.clone())
    }

    pub fn registered_types(&self) -> Vec<String> {
        self.by_type.iter().map(|e| e.key().clone()).collect()
    }
}

/// Per-message context handed to handlers (identity of the source
/// connection plus a routing handle for replies).
#[derive(Clone)]
pub struct ServerCtx {
    pub connection_id: ConnectionId,
    pub user_id: Arc<str>,
    pub platform: Arc<str>,
    routing: Arc<RoutingEngine>,
}

impl ServerCtx {
    pub fn new(
        connection_id: ConnectionId,
        user_id: impl Into<Arc<str>>,
        platform: impl Into<Arc<str>>,
        routing: Arc<RoutingEngine>,
    ) -> Self {
        Self {
            connection_id,
            user_id: user_id.into(),
            platform: platform.into(),
            routing,
        }
    }

    pub fn routing(&self) -> &RoutingEngine {
        &self.routing
    }

    /// Send a message back to the connection this context belongs to.
    pub async fn reply(&self, seg_type: &str, data: serde_json::Value) -> bool {
        self.routing
            .send_custom(
                seg_type,
                data,
                CustomTarget {
                    connection: Some(self.connection_id),
                    ..CustomTarget::default()
                },
            )
            .await
            .get(&self.connection_id)
            .copied()
            .unwrap_or(false)
    }
}

/// Machinery a session loop needs per inbound frame. The supervisor is
/// scoped to the owning session so its tasks can be drained when that
/// connection closes; the other handles are server-wide.
pub struct SessionHooks {
    pub handlers: Arc<HandlerRegistry>,
    pub supervisor: Arc<TaskSupervisor>,
    pub acks: Arc<AckTracker>,
    pub stats: Arc<BusStats>,
}

/// Classify and dispatch one inbound text frame.
///
/// - `sys_std`: ack synchronously through `out_tx`, then spawn the
///   registered handler (tracked, not awaited inline).
/// - `sys_ack`: resolve against the tracker; never re-acked.
/// - malformed: drop the frame with a warning, connection continues.
pub async fn process_text(
    hooks: &SessionHooks,
    ctx: &ServerCtx,
    raw: &str,
    out_tx: &mpsc::Sender<Message>,
) {
    let env = match decode(raw) {
        Ok(env) => env,
        Err(e) => {
            tracing::warn!(conn = %ctx.connection_id, error = %e, "dropping malformed frame");
            hooks.stats.inc_errors();
            return;
        }
    };

    if env.kind == EnvelopeKind::Ack {
        hooks.stats.inc_acks_received();
        if let Some(acked) = env.meta.acked_msg_id.as_deref() {
            match hooks.acks.resolve(acked) {
                Some(age_ms) => {
                    tracing::debug!(conn = %ctx.connection_id, acked, age_ms, "ack resolved")
                }
                None => tracing::debug!(conn = %ctx.connection_id, acked, "ack for unknown msg_id"),
            }
        }
        return;
    }

    hooks.stats.inc_messages_in();

    // Inline ack before handler scheduling; cheap and arrival-ordered.
    if let Some(ack) = Envelope::ack_for(&env) {
        match encode(&ack) {
            Ok(wire) => {
                if out_tx.send(Message::Text(wire)).await.is_ok() {
                    hooks.stats.inc_acks_sent();
                }
            }
            Err(e) => {
                tracing::warn!(conn = %ctx.connection_id, error = %e, "ack encode failed");
                hooks.stats.inc_errors();
            }
        }
    }

    let seg_type = env
        .payload
        .as_ref()
        .map(|p| p.message_segment.seg_type.clone())
        .unwrap_or_default();
    let Some(handler) = hooks.handlers.resolve(&seg_type) else {
        tracing::warn!(conn = %ctx.connection_id, seg_type = %seg_type, "no handler registered, dropping");
        return;
    };

    let ctx = ctx.clone();
    let stats = Arc::clone(&hooks.stats);
    hooks.supervisor.spawn(async move {
        let conn = ctx.connection_id;
        if let Err(e) = handler.handle(ctx, env).await {
            tracing::warn!(conn = %conn, error = %e, "handler failed");
            stats.inc_errors();
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::KeyIdentity;
    use crate::registry::ConnectionRegistry;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use wirebus_core::protocol::{MessageDim, MessageSegment, Payload};

    fn hooks() -> SessionHooks {
        SessionHooks {
            handlers: Arc::new(HandlerRegistry::new()),
            supervisor: Arc::new(TaskSupervisor::new()),
            acks: Arc::new(AckTracker::new()),
            stats: Arc::new(BusStats::new()),
        }
    }

    fn ctx() -> ServerCtx {
        let registry = Arc::new(ConnectionRegistry::new());
        let stats = Arc::new(BusStats::new());
        let routing = Arc::new(RoutingEngine::new(
            registry,
            Arc::new(KeyIdentity),
            stats,
            Arc::new(AckTracker::new()),
        ));
        ServerCtx::new(ConnectionId(1), "A", "p1", routing)
    }

    fn std_wire(seg_type: &str) -> (String, String) {
        let env = Envelope::standard(Payload {
            message_segment: MessageSegment {
                seg_type: seg_type.into(),
                data: serde_json::json!({}),
            },
            message_dim: MessageDim {
                api_key: "A".into(),
                platform: "p1".into(),
            },
            ..Payload::default()
        });
        (env.msg_id.clone(), encode(&env).unwrap())
    }

    async fn recv_ack(out_rx: &mut mpsc::Receiver<Message>) -> Envelope {
        let Some(Message::Text(wire)) = out_rx.recv().await else {
            panic!("expected ack frame");
        };
        decode(&wire).unwrap()
    }

    struct Recorder(AtomicUsize);
    #[async_trait]
    impl MessageHandler for Recorder {
        async fn handle(&self, _ctx: ServerCtx, _env: Envelope) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Hang;
    #[async_trait]
    impl MessageHandler for Hang {
        async fn handle(&self, _ctx: ServerCtx, _env: Envelope) -> Result<()> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn standard_frame_gets_exactly_one_ack() {
        let hooks = hooks();
        let recorder = Arc::new(Recorder(AtomicUsize::new(0)));
        hooks.handlers.register("text", recorder.clone());
        let (out_tx, mut out_rx) = mpsc::channel(8);

        let (msg_id, wire) = std_wire("text");
        process_text(&hooks, &ctx(), &wire, &out_tx).await;

        let ack = recv_ack(&mut out_rx).await;
        assert_eq!(ack.kind, EnvelopeKind::Ack);
        assert_eq!(ack.meta.acked_msg_id.as_deref(), Some(msg_id.as_str()));
        assert!(out_rx.try_recv().is_err());

        hooks.supervisor.shutdown(Duration::from_millis(500)).await;
        assert_eq!(recorder.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn acks_are_never_re_acked() {
        let hooks = hooks();
        let (out_tx, mut out_rx) = mpsc::channel(8);

        hooks.acks.track("m-0");
        let ack_wire =
            r#"{"version":1,"msg_id":"m-1","kind":"sys_ack","meta":{"acked_msg_id":"m-0"}}"#;
        process_text(&hooks, &ctx(), ack_wire, &out_tx).await;

        assert!(out_rx.try_recv().is_err());
        assert_eq!(hooks.acks.pending(), 0);
    }

    #[tokio::test]
    async fn malformed_frame_is_dropped_not_fatal() {
        let hooks = hooks();
        let (out_tx, mut out_rx) = mpsc::channel(8);

        process_text(&hooks, &ctx(), "{broken", &out_tx).await;
        assert!(out_rx.try_recv().is_err());

        // The connection keeps dispatching afterwards.
        let recorder = Arc::new(Recorder(AtomicUsize::new(0)));
        hooks.handlers.register_default(recorder.clone());
        let (_, wire) = std_wire("text");
        process_text(&hooks, &ctx(), &wire, &out_tx).await;
        assert!(out_rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn hung_handler_does_not_block_the_next_frame() {
        let hooks = hooks();
        hooks.handlers.register("slow", Arc::new(Hang));
        let recorder = Arc::new(Recorder(AtomicUsize::new(0)));
        hooks.handlers.register("fast", recorder.clone());
        let (out_tx, mut out_rx) = mpsc::channel(8);

        let c = ctx();
        let (m1, wire1) = std_wire("slow");
        let (m2, wire2) = std_wire("fast");
        process_text(&hooks, &c, &wire1, &out_tx).await;
        process_text(&hooks, &c, &wire2, &out_tx).await;

        // Both acks arrive, in arrival order, while M1's handler hangs.
        let ack1 = recv_ack(&mut out_rx).await;
        let ack2 = recv_ack(&mut out_rx).await;
        assert_eq!(ack1.meta.acked_msg_id.as_deref(), Some(m1.as_str()));
        assert_eq!(ack2.meta.acked_msg_id.as_deref(), Some(m2.as_str()));

        hooks.supervisor.shutdown(Duration::from_millis(100)).await;
        assert_eq!(recorder.0.load(Ordering::SeqCst), 1);
        assert_eq!(hooks.supervisor.active(), 0);
    }

    #[tokio::test]
    async fn typed_handler_wins_over_default() {
        let registry = HandlerRegistry::new();
        let typed = Arc::new(Recorder(AtomicUsize::new(0)));
        let fallback = Arc::new(Recorder(AtomicUsize::new(0)));
        registry.register("text", typed.clone());
        registry.register_default(fallback.clone());

        let handler = registry.resolve("text").unwrap();
        handler.handle(ctx(), Envelope::standard(Payload::default())).await.unwrap();
        assert_eq!(typed.0.load(Ordering::SeqCst), 1);
        assert_eq!(fallback.0.load(Ordering::SeqCst), 0);

        // Unknown types fall back to the default slot.
        let handler = registry.resolve("unknown").unwrap();
        handler.handle(ctx(), Envelope::standard(Payload::default())).await.unwrap();
        assert_eq!(fallback.0.load(Ordering::SeqCst), 1);
    }
}
