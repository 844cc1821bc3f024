//! Single-connection client.
//!
//! Caches one `(url, api_key, platform)` identity tuple, owns one socket,
//! and runs one receive loop. Outbound frames (sends and auto-acks) go
//! through a bounded mpsc queue so the writer half is driven from exactly
//! one place.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use wirebus_core::ack::AckTracker;
use wirebus_core::error::{BusError, Result};
use wirebus_core::protocol::envelope::{self, Envelope, EnvelopeKind};
use wirebus_core::protocol::payload::{MessageDim, MessageSegment, Payload};
use wirebus_core::task::TaskSupervisor;

use crate::dispatch::{ClientHandlerRegistry, InboundDispatch, RegistryDispatch};
use crate::reconnect::{ReconnectPolicy, ReconnectSchedule};
use crate::transport::{self, endpoint_url, TlsOptions, WsStream};

const OUTBOUND_QUEUE: usize = 256;
const LOOP_JOIN_MS: u64 = 5_000;
const HANDLER_GRACE_MS: u64 = 1_500;

type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Connection settings for one client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub url: String,
    /// Identity the server registers this connection under.
    pub api_key: String,
    pub platform: String,
    pub tls: TlsOptions,
    pub reconnect: ReconnectPolicy,
    /// Upper bound on one blocking wait inside the receive loop; the
    /// stopping flag is re-checked at least this often.
    pub recv_timeout_ms: u64,
    pub connect_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8080/v1/bus".to_string(),
            api_key: String::new(),
            platform: String::new(),
            tls: TlsOptions::default(),
            reconnect: ReconnectPolicy::default(),
            recv_timeout_ms: 1_000,
            connect_timeout_ms: 5_000,
        }
    }
}

enum SessionExit {
    /// `disconnect()` was called; do not reconnect.
    Explicit,
    /// The socket dropped underneath us; the backoff controller takes over.
    Unexpected,
}

pub(crate) struct ClientInner {
    pub(crate) cfg: ClientConfig,
    handlers: Arc<ClientHandlerRegistry>,
    dispatch: Arc<dyn InboundDispatch>,
    supervisor: Arc<TaskSupervisor>,
    acks: Arc<AckTracker>,
    connected: AtomicBool,
    stopping: AtomicBool,
    last_error: StdMutex<Option<String>>,
    out_tx: StdMutex<Option<mpsc::Sender<Message>>>,
    loop_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ClientInner {
    fn set_error(&self, msg: &str) {
        if let Ok(mut slot) = self.last_error.lock() {
            *slot = Some(msg.to_string());
        }
    }

    fn clear_error(&self) {
        if let Ok(mut slot) = self.last_error.lock() {
            *slot = None;
        }
    }

    /// One inbound text frame: decode, resolve or auto-ack, dispatch.
    async fn handle_text(&self, raw: &str, ack_tx: &mpsc::Sender<Message>) {
        let env = match envelope::decode(raw) {
            Ok(env) => env,
            Err(e) => {
                tracing::warn!(error = %e, "dropping undecodable frame");
                return;
            }
        };
        match env.kind {
            EnvelopeKind::Ack => {
                let Some(acked) = env.meta.acked_msg_id.as_deref() else {
                    tracing::warn!("ack without acked_msg_id");
                    return;
                };
                match self.acks.resolve(acked) {
                    Some(age_ms) => tracing::debug!(msg_id = %acked, age_ms, "ack resolved"),
                    None => tracing::debug!(msg_id = %acked, "ack for unknown msg_id"),
                }
            }
            EnvelopeKind::Standard => {
                // Ack goes out before the handler runs; handlers never
                // delay or suppress acknowledgement. The send waits out
                // queue backpressure so the ack is never dropped.
                if let Some(ack) = Envelope::ack_for(&env) {
                    if let Ok(text) = envelope::encode(&ack) {
                        if ack_tx.send(Message::Text(text)).await.is_err() {
                            tracing::warn!(msg_id = %env.msg_id, "outbound queue closed, ack lost");
                        }
                    }
                }
                self.dispatch.dispatch(env).await;
            }
        }
    }
}

/// WebSocket client bound to one endpoint identity.
///
/// Cloning shares the underlying connection and state.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    pub fn new(cfg: ClientConfig) -> Self {
        let handlers = Arc::new(ClientHandlerRegistry::new());
        let supervisor = Arc::new(TaskSupervisor::new());
        let dispatch = Arc::new(RegistryDispatch {
            handlers: Arc::clone(&handlers),
            supervisor: Arc::clone(&supervisor),
        });
        Self::with_dispatch(cfg, handlers, dispatch, supervisor)
    }

    /// Construct with an externally supplied dispatch seam; used by the
    /// multi-connection manager to route inbound messages through tiered
    /// matching instead of the local registry.
    pub(crate) fn with_dispatch(
        cfg: ClientConfig,
        handlers: Arc<ClientHandlerRegistry>,
        dispatch: Arc<dyn InboundDispatch>,
        supervisor: Arc<TaskSupervisor>,
    ) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                cfg,
                handlers,
                dispatch,
                supervisor,
                acks: Arc::new(AckTracker::new()),
                connected: AtomicBool::new(false),
                stopping: AtomicBool::new(false),
                last_error: StdMutex::new(None),
                out_tx: StdMutex::new(None),
                loop_task: tokio::sync::Mutex::new(None),
            }),
        }
    }

    pub fn handlers(&self) -> &Arc<ClientHandlerRegistry> {
        &self.inner.handlers
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Most recent connection or send failure, cleared on the next
    /// successful connect or send.
    pub fn get_last_error(&self) -> Option<String> {
        self.inner.last_error.lock().ok().and_then(|slot| slot.clone())
    }

    /// Outbound messages still awaiting a server ack.
    pub fn pending_acks(&self) -> usize {
        self.inner.acks.pending()
    }

    /// Establish the connection and start the receive loop. Idempotent: a
    /// second call on a live connection is a no-op.
    pub async fn connect(&self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        {
            // A previous loop may still exist after reconnect exhaustion.
            let mut guard = self.inner.loop_task.lock().await;
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
        self.inner.stopping.store(false, Ordering::SeqCst);

        let url = endpoint_url(&self.inner.cfg.url, &self.inner.cfg.api_key, &self.inner.cfg.platform)
            .map_err(|e| {
                self.inner.set_error(&e.to_string());
                e
            })?;
        let stream = transport::connect(&url, &self.inner.cfg.tls, self.inner.cfg.connect_timeout_ms)
            .await
            .map_err(|e| {
                self.inner.set_error(&e.to_string());
                e
            })?;

        let (tx, rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE);
        if let Ok(mut slot) = self.inner.out_tx.lock() {
            *slot = Some(tx.clone());
        }
        self.inner.connected.store(true, Ordering::SeqCst);
        self.inner.clear_error();

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(run_loop(inner, stream, rx, tx));
        *self.inner.loop_task.lock().await = Some(handle);
        tracing::info!(url = %self.inner.cfg.url, platform = %self.inner.cfg.platform, "client connected");
        Ok(())
    }

    /// Close the connection without triggering reconnection. Idempotent;
    /// safe on a client that never connected.
    pub async fn disconnect(&self) -> Result<()> {
        self.inner.stopping.store(true, Ordering::SeqCst);

        let tx = self.inner.out_tx.lock().ok().and_then(|mut slot| slot.take());
        if let Some(tx) = tx {
            let _ = tx.try_send(Message::Close(None));
        }

        let handle = self.inner.loop_task.lock().await.take();
        if let Some(mut handle) = handle {
            let join = tokio::time::timeout(Duration::from_millis(LOOP_JOIN_MS), &mut handle);
            if join.await.is_err() {
                tracing::warn!("receive loop did not stop within bound, aborting");
                handle.abort();
            }
        }

        self.inner
            .supervisor
            .shutdown(Duration::from_millis(HANDLER_GRACE_MS))
            .await;
        self.inner.connected.store(false, Ordering::SeqCst);
        tracing::info!(url = %self.inner.cfg.url, "client disconnected");
        Ok(())
    }

    /// Send a standard envelope. Empty `message_dim` fields default to this
    /// client's own identity (loopback addressing). Returns the `msg_id`
    /// the ack will be correlated against.
    pub async fn send(&self, payload: Payload) -> Result<String> {
        let payload = fill_dim(&self.inner.cfg, payload);
        payload.check_routable()?;
        let env = Envelope::standard(payload);
        let text = envelope::encode(&env)?;

        let tx = self
            .inner
            .out_tx
            .lock()
            .ok()
            .and_then(|slot| slot.clone())
            .ok_or(BusError::NotConnected)?;
        if !self.is_connected() {
            return Err(BusError::NotConnected);
        }
        tx.send(Message::Text(text)).await.map_err(|_| {
            self.inner.set_error("outbound queue closed");
            BusError::NotConnected
        })?;
        self.inner.acks.track(&env.msg_id);
        self.inner.clear_error();
        Ok(env.msg_id)
    }

    /// Convenience wrapper: build the payload from a segment type and raw
    /// data, with an optional explicit target.
    pub async fn send_custom(
        &self,
        seg_type: &str,
        data: serde_json::Value,
        target: Option<MessageDim>,
    ) -> Result<String> {
        let payload = Payload {
            message_segment: MessageSegment {
                seg_type: seg_type.to_string(),
                data,
            },
            message_dim: target.unwrap_or_default(),
            ..Payload::default()
        };
        self.send(payload).await
    }
}

/// Default empty `message_dim` fields to the client's own identity.
pub(crate) fn fill_dim(cfg: &ClientConfig, mut payload: Payload) -> Payload {
    if payload.message_dim.api_key.is_empty() {
        payload.message_dim.api_key = cfg.api_key.clone();
    }
    if payload.message_dim.platform.is_empty() {
        payload.message_dim.platform = cfg.platform.clone();
    }
    payload
}

/// Outer loop: one session per live socket, with the backoff controller
/// bridging unexpected disconnects. Runs until explicit disconnect or
/// reconnect exhaustion.
async fn run_loop(
    inner: Arc<ClientInner>,
    mut stream: WsStream,
    mut out_rx: mpsc::Receiver<Message>,
    ack_tx: mpsc::Sender<Message>,
) {
    'outer: loop {
        let (mut write, mut read) = stream.split();
        let exit = session(&inner, &mut write, &mut read, &mut out_rx, &ack_tx).await;
        match exit {
            SessionExit::Explicit => break,
            SessionExit::Unexpected => {
                inner.connected.store(false, Ordering::SeqCst);
                if inner.stopping.load(Ordering::SeqCst) {
                    break;
                }
                tracing::warn!(url = %inner.cfg.url, "connection lost, entering reconnect");
                let mut schedule = ReconnectSchedule::new();
                loop {
                    let Some(delay) = schedule.next_delay(&inner.cfg.reconnect) else {
                        let err = BusError::ReconnectExhausted(schedule.attempts());
                        inner.set_error(&err.to_string());
                        tracing::error!(attempts = schedule.attempts(), "giving up on reconnection");
                        break 'outer;
                    };
                    tokio::time::sleep(delay).await;
                    if inner.stopping.load(Ordering::SeqCst) {
                        break 'outer;
                    }
                    let url = match endpoint_url(&inner.cfg.url, &inner.cfg.api_key, &inner.cfg.platform)
                    {
                        Ok(url) => url,
                        Err(e) => {
                            inner.set_error(&e.to_string());
                            continue;
                        }
                    };
                    match transport::connect(&url, &inner.cfg.tls, inner.cfg.connect_timeout_ms).await
                    {
                        Ok(next) => {
                            stream = next;
                            inner.connected.store(true, Ordering::SeqCst);
                            inner.clear_error();
                            tracing::info!(attempt = schedule.attempts(), "reconnected");
                            continue 'outer;
                        }
                        Err(e) => {
                            inner.set_error(&e.to_string());
                            tracing::warn!(attempt = schedule.attempts(), error = %e, "reconnect attempt failed");
                        }
                    }
                }
            }
        }
    }
    inner.connected.store(false, Ordering::SeqCst);
}

async fn session(
    inner: &ClientInner,
    write: &mut WsSink,
    read: &mut WsSource,
    out_rx: &mut mpsc::Receiver<Message>,
    ack_tx: &mpsc::Sender<Message>,
) -> SessionExit {
    let recv_timeout = Duration::from_millis(inner.cfg.recv_timeout_ms.max(1));
    loop {
        if inner.stopping.load(Ordering::SeqCst) {
            let _ = write.send(Message::Close(None)).await;
            return SessionExit::Explicit;
        }
        tokio::select! {
            queued = out_rx.recv() => match queued {
                Some(msg) => {
                    let closing = matches!(msg, Message::Close(_));
                    if write.send(msg).await.is_err() {
                        return SessionExit::Unexpected;
                    }
                    if closing {
                        return SessionExit::Explicit;
                    }
                }
                None => return SessionExit::Explicit,
            },
            frame = read.next() => match frame {
                Some(Ok(Message::Text(raw))) => inner.handle_text(&raw, ack_tx).await,
                Some(Ok(Message::Ping(body))) => {
                    let _ = write.send(Message::Pong(body)).await;
                }
                Some(Ok(Message::Close(_))) | None => return SessionExit::Unexpected,
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "socket read failed");
                    return SessionExit::Unexpected;
                }
                Some(Ok(_)) => {}
            },
            _ = tokio::time::sleep(recv_timeout) => {}
        }
    }
}
