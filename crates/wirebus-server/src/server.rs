//! Server assembly and lifecycle.
//!
//! `BusServer` owns every core component (registry, routing, supervisor,
//! ack tracker, stats, handler registry) and drives the staged shutdown
//! sequence. `AppState` is the cheaply-cloned view handed to the axum
//! router and session loops.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::ws::Message;
use dashmap::DashMap;
use futures_util::future::join_all;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};

use wirebus_core::ack::AckTracker;
use wirebus_core::error::{BusError, Result};
use wirebus_core::task::TaskSupervisor;

use crate::auth::{Authenticator, IdentityResolver, KeyIdentity};
use crate::config::ServerConfig;
use crate::dispatch::{HandlerRegistry, SessionHooks};
use crate::registry::{ConnectionId, ConnectionInfo, ConnectionRegistry};
use crate::router;
use crate::routing::RoutingEngine;
use crate::stats::{BusStats, StatsSnapshot};

struct ServerShared {
    cfg: ServerConfig,
    registry: Arc<ConnectionRegistry>,
    /// One task supervisor per live session, keyed by connection id, so a
    /// closing session can drain its own handler tasks.
    sessions: DashMap<ConnectionId, Arc<TaskSupervisor>>,
    acks: Arc<AckTracker>,
    stats: Arc<BusStats>,
    handlers: Arc<HandlerRegistry>,
    authenticator: Arc<dyn Authenticator>,
    resolver: Arc<dyn IdentityResolver>,
    routing: Arc<RoutingEngine>,
    stopping: AtomicBool,
}

/// Shared application state for router and session loops.
#[derive(Clone)]
pub struct AppState {
    shared: Arc<ServerShared>,
}

impl AppState {
    pub fn cfg(&self) -> &ServerConfig {
        &self.shared.cfg
    }
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.shared.registry
    }
    pub fn routing(&self) -> Arc<RoutingEngine> {
        Arc::clone(&self.shared.routing)
    }
    pub fn handlers(&self) -> Arc<HandlerRegistry> {
        Arc::clone(&self.shared.handlers)
    }
    pub fn authenticator(&self) -> &dyn Authenticator {
        self.shared.authenticator.as_ref()
    }
    pub fn resolver(&self) -> &dyn IdentityResolver {
        self.shared.resolver.as_ref()
    }
    pub fn is_stopping(&self) -> bool {
        self.shared.stopping.load(Ordering::SeqCst)
    }

    /// Create the task supervisor for a new session and register it for
    /// shutdown-time accounting.
    pub fn begin_session(&self, id: ConnectionId) -> Arc<TaskSupervisor> {
        let supervisor = Arc::new(TaskSupervisor::new());
        self.shared.sessions.insert(id, Arc::clone(&supervisor));
        supervisor
    }

    pub fn end_session(&self, id: ConnectionId) {
        self.shared.sessions.remove(&id);
    }

    pub fn session_hooks(&self, supervisor: Arc<TaskSupervisor>) -> SessionHooks {
        SessionHooks {
            handlers: Arc::clone(&self.shared.handlers),
            supervisor,
            acks: Arc::clone(&self.shared.acks),
            stats: Arc::clone(&self.shared.stats),
        }
    }

    /// In-flight handler tasks across all live sessions.
    pub fn active_handler_tasks(&self) -> usize {
        self.shared.sessions.iter().map(|s| s.active()).sum()
    }

    pub fn stats_snapshot(&self) -> StatsSnapshot {
        self.shared.stats.snapshot(
            self.shared.registry.count_connections(),
            self.shared.registry.count_users(),
            self.active_handler_tasks(),
        )
    }
}

struct RunningServer {
    addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    serve_task: JoinHandle<()>,
}

/// The WebSocket message bus server.
pub struct BusServer {
    state: AppState,
    running: Mutex<Option<RunningServer>>,
}

impl BusServer {
    /// Build with the default key-as-user gate.
    pub fn new(cfg: ServerConfig) -> Self {
        let gate = Arc::new(KeyIdentity);
        Self::with_gate(cfg, gate.clone(), gate)
    }

    /// Build with externally supplied auth collaborators.
    pub fn with_gate(
        cfg: ServerConfig,
        authenticator: Arc<dyn Authenticator>,
        resolver: Arc<dyn IdentityResolver>,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let stats = Arc::new(BusStats::new());
        let acks = Arc::new(AckTracker::new());
        let routing = Arc::new(RoutingEngine::new(
            Arc::clone(&registry),
            Arc::clone(&resolver),
            Arc::clone(&stats),
            Arc::clone(&acks),
        ));
        let shared = ServerShared {
            cfg,
            registry,
            sessions: DashMap::new(),
            acks,
            stats,
            handlers: Arc::new(HandlerRegistry::new()),
            authenticator,
            resolver,
            routing,
            stopping: AtomicBool::new(false),
        };
        Self {
            state: AppState {
                shared: Arc::new(shared),
            },
            running: Mutex::new(None),
        }
    }

    /// Handler table for this instance; register handlers before or after
    /// `start()`.
    pub fn handlers(&self) -> Arc<HandlerRegistry> {
        self.state.handlers()
    }

    pub fn routing(&self) -> Arc<RoutingEngine> {
        self.state.routing()
    }

    pub fn state(&self) -> AppState {
        self.state.clone()
    }

    /// Bind and serve. Returns the bound address (port 0 is supported for
    /// tests). Fails with `AlreadyRunning` on a running instance.
    pub async fn start(&self) -> Result<SocketAddr> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(BusError::AlreadyRunning);
        }
        self.state.shared.stopping.store(false, Ordering::SeqCst);

        let cfg = &self.state.shared.cfg.server;
        let listener = TcpListener::bind(&cfg.listen)
            .await
            .map_err(|e| BusError::Transport(format!("bind {} failed: {e}", cfg.listen)))?;
        let addr = listener
            .local_addr()
            .map_err(|e| BusError::Transport(format!("local_addr failed: {e}")))?;

        let app = router::build_router(self.state.clone(), &cfg.path);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let serve_task = tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            });
            if let Err(e) = serve.await {
                tracing::error!(error = %e, "listener task failed");
            }
        });

        *running = Some(RunningServer {
            addr,
            shutdown_tx,
            serve_task,
        });
        tracing::info!(%addr, "wirebus server started");
        Ok(addr)
    }

    /// Staged, time-bounded teardown. Safe to call repeatedly and on a
    /// never-started instance (no-op). After completion the instance is
    /// back to a clean slate: zero connections, zero handler tasks, zero
    /// counters.
    pub async fn stop(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        let Some(run) = running.take() else {
            return Ok(());
        };
        let s = &self.state.shared;
        let cfg = &s.cfg.server;

        // Stage 1: flag, observed by every dispatcher loop.
        s.stopping.store(true, Ordering::SeqCst);

        // Stage 2: grace window for loops to notice on their own.
        sleep(Duration::from_millis(cfg.shutdown_grace_ms)).await;

        // Stage 3: force-close remaining sockets and stop the listener.
        for (id, conn) in s.registry.drain() {
            tracing::debug!(conn = %id, "force-closing connection");
            let _ = conn.tx.try_send(Message::Close(None));
        }
        let _ = run.shutdown_tx.send(());
        let mut serve_task = run.serve_task;
        if timeout(
            Duration::from_millis(cfg.shutdown_timeout_ms),
            &mut serve_task,
        )
        .await
        .is_err()
        {
            tracing::warn!(error = %BusError::ShutdownTimeout("listener"), "aborting listener task");
            serve_task.abort();
        }

        // Stage 4: cancel leftover handler tasks with a bounded grace.
        // Sessions normally drain their own supervisors on exit; this picks
        // up any that were force-closed mid-flight.
        let leftovers: Vec<Arc<TaskSupervisor>> = s
            .sessions
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect();
        s.sessions.clear();
        let grace = Duration::from_millis(cfg.handler_grace_ms);
        let aborted: usize = join_all(leftovers.iter().map(|sup| sup.shutdown(grace)))
            .await
            .into_iter()
            .sum();
        if aborted > 0 {
            tracing::warn!(error = %BusError::ShutdownTimeout("handlers"), aborted, "handler grace exceeded");
        }

        // Stage 5: reset so start() after stop() begins clean.
        s.acks.clear();
        s.stats.reset();

        tracing::info!(addr = %run.addr, "wirebus server stopped");
        Ok(())
    }

    // Observability surface.

    pub fn get_stats(&self) -> StatsSnapshot {
        self.state.stats_snapshot()
    }

    pub fn get_connection_info(&self, id: ConnectionId) -> Option<ConnectionInfo> {
        self.state.shared.registry.connection_info(id)
    }

    pub fn get_user_connections(&self, user_id: &str) -> Vec<ConnectionId> {
        self.state.shared.registry.user_connections(user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stop_on_never_started_instance_is_a_noop() {
        let server = BusServer::new(ServerConfig::default());
        assert!(server.stop().await.is_ok());
        assert!(server.stop().await.is_ok());
    }

    #[tokio::test]
    async fn double_start_fails() {
        let mut cfg = ServerConfig::default();
        cfg.server.listen = "127.0.0.1:0".into();
        cfg.server.shutdown_grace_ms = 10;

        let server = BusServer::new(cfg);
        let addr = server.start().await.unwrap();
        assert_ne!(addr.port(), 0);
        assert!(matches!(
            server.start().await,
            Err(BusError::AlreadyRunning)
        ));
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_resets_stats_immediately() {
        let mut cfg = ServerConfig::default();
        cfg.server.listen = "127.0.0.1:0".into();
        cfg.server.shutdown_grace_ms = 10;

        let server = BusServer::new(cfg);
        server.start().await.unwrap();
        server.stop().await.unwrap();

        let stats = server.get_stats();
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.active_handler_tasks, 0);
        assert_eq!(stats.messages_in, 0);

        // start() after stop() begins from a clean slate.
        server.start().await.unwrap();
        server.stop().await.unwrap();
    }
}
