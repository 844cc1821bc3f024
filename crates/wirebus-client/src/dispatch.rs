//! Client-side inbound dispatch.
//!
//! The receive loop hands decoded standard envelopes to an
//! `InboundDispatch` implementation: the single-connection client
//! dispatches straight from its handler registry, the multi-connection
//! client first resolves a connection context by tiered matching.

use std::sync::Arc;
use std::sync::RwLock;

use async_trait::async_trait;
use dashmap::DashMap;

use wirebus_core::error::Result;
use wirebus_core::protocol::Envelope;
use wirebus_core::task::TaskSupervisor;

/// Per-message context: the resolved connection name, when one exists.
#[derive(Debug, Clone, Default)]
pub struct ClientCtx {
    pub connection: Option<String>,
}

/// Business handler for inbound messages of one segment type.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn handle(&self, ctx: ClientCtx, env: Envelope) -> Result<()>;
}

/// Explicit handler table keyed by `message_segment.type` with a default
/// slot; shared between clients by cloning the `Arc`.
#[derive(Default)]
pub struct ClientHandlerRegistry {
    by_type: DashMap<String, Arc<dyn InboundHandler>>,
    default: RwLock<Option<Arc<dyn InboundHandler>>>,
}

impl ClientHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, seg_type: &str, handler: Arc<dyn InboundHandler>) {
        self.by_type.insert(seg_type.to_string(), handler);
    }

    pub fn register_default(&self, handler: Arc<dyn InboundHandler>) {
        if let Ok(mut slot) = self.default.write() {
            *slot = Some(handler);
        }
    }

    pub fn resolve(&self, seg_type: &str) -> Option<Arc<dyn InboundHandler>> {
        if let Some(h) = self.by_type.get(seg_type) {
            return Some(h.value().clone());
        }
        self.default_handler()
    }

    pub fn default_handler(&self) -> Option<Arc<dyn InboundHandler>> {
        self.default.read().ok().and_then(|slot| slot.clone())
    }
}

/// Seam between the receive loop and handler execution.
#[async_trait]
pub trait InboundDispatch: Send + Sync {
    /// Schedule handling of one decoded standard envelope. Must not block
    /// the receive loop on the handler body.
    async fn dispatch(&self, env: Envelope);
}

/// Registry-backed dispatch used by the single-connection client.
pub struct RegistryDispatch {
    pub handlers: Arc<ClientHandlerRegistry>,
    pub supervisor: Arc<TaskSupervisor>,
}

#[async_trait]
impl InboundDispatch for RegistryDispatch {
    async fn dispatch(&self, env: Envelope) {
        let seg_type = env
            .payload
            .as_ref()
            .map(|p| p.message_segment.seg_type.clone())
            .unwrap_or_default();
        let Some(handler) = self.handlers.resolve(&seg_type) else {
            tracing::warn!(seg_type = %seg_type, "no handler registered, dropping inbound message");
            return;
        };
        self.supervisor.spawn(async move {
            if let Err(e) = handler.handle(ClientCtx::default(), env).await {
                tracing::warn!(error = %e, "inbound handler failed");
            }
        });
    }
}
