//! WebSocket session handling.
//!
//! Responsibilities:
//! - Upgrade HTTP -> WS
//! - Extract identity from query string or headers (query wins)
//! - Connect-time authentication before any registry entry exists
//! - Session loop: bounded-timeout receive, inline acks, tracked handler
//!   spawns, heartbeat ping
//! - Total deregistration on exit

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{ws::Message, ws::WebSocket, ws::WebSocketUpgrade, Query, State},
    http::HeaderMap,
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, Duration, MissedTickBehavior};

use wirebus_core::error::{BusError, Result};

use crate::auth::ConnectMeta;
use crate::dispatch::{self, ServerCtx};
use crate::registry::Connection;
use crate::server::AppState;

/// Headers that never go into the sanitized metadata snapshot.
const SENSITIVE_HEADERS: [&str; 4] = ["authorization", "cookie", "x-apikey", "sec-websocket-key"];

/// Build the sanitized connection metadata. Identity comes from query
/// parameters (`api_key`, `platform`) or headers (`x-apikey`,
/// `x-platform`, optional `x-uuid`); query parameters take precedence.
pub fn connect_meta(query: &HashMap<String, String>, headers: &HeaderMap) -> ConnectMeta {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };

    let api_key = query
        .get("api_key")
        .cloned()
        .or_else(|| header("x-apikey"))
        .unwrap_or_default();
    let platform = query
        .get("platform")
        .cloned()
        .or_else(|| header("x-platform"))
        .unwrap_or_default();
    let client_uuid = query.get("uuid").cloned().or_else(|| header("x-uuid"));

    let mut snapshot = HashMap::new();
    for (name, value) in headers {
        let name = name.as_str().to_ascii_lowercase();
        if SENSITIVE_HEADERS.contains(&name.as_str()) {
            continue;
        }
        if let Ok(v) = value.to_str() {
            snapshot.insert(name, v.to_string());
        }
    }

    ConnectMeta {
        api_key,
        platform,
        client_uuid,
        headers: snapshot,
    }
}

pub async fn ws_upgrade(
    State(app): State<AppState>,
    ws: WebSocketUpgrade,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let meta = connect_meta(&query, &headers);
    ws.on_upgrade(move |socket| async move {
        if let Err(e) = run_session(app, meta, socket).await {
            tracing::debug!(error = %e, "session ended");
        }
    })
}

async fn run_session(app: AppState, meta: ConnectMeta, mut socket: WebSocket) -> Result<()> {
    // Connect-time gate: reject before a connection object exists.
    if !app.authenticator().authenticate(&meta).await {
        tracing::info!(platform = %meta.platform, "connection rejected by auth gate");
        let _ = socket.send(Message::Close(None)).await;
        return Err(BusError::AuthRejected(meta.platform.clone()));
    }
    let user_id = match app
        .resolver()
        .resolve_user(&meta.api_key, &meta.platform)
        .await
    {
        Ok(u) => u,
        Err(e) => {
            let _ = socket.send(Message::Close(None)).await;
            return Err(e);
        }
    };

    let (out_tx, mut out_rx) = mpsc::channel::<Message>(1024);
    let id = app.registry().next_id();
    app.registry().register(
        id,
        user_id.clone(),
        meta.platform.clone(),
        meta.clone(),
        Connection {
            tx: out_tx.clone(),
        },
    );
    tracing::info!(conn = %id, user = %user_id, platform = %meta.platform, "connection registered");

    let ctx = ServerCtx::new(id, user_id, meta.platform.clone(), app.routing());
    let supervisor = app.begin_session(id);
    let hooks = app.session_hooks(Arc::clone(&supervisor));
    let cfg = &app.cfg().server;
    let recv_timeout = Duration::from_millis(cfg.recv_timeout_ms);
    let max_frame = cfg.max_frame_bytes;

    let mut ping_tick = interval(Duration::from_millis(cfg.ping_interval_ms));
    ping_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let (mut ws_tx, mut ws_rx) = socket.split();

    // Active until the peer closes or the stopping flag is observed.
    loop {
        if app.is_stopping() {
            let _ = ws_tx.send(Message::Close(None)).await;
            break;
        }
        tokio::select! {
            maybe_out = out_rx.recv() => {
                match maybe_out {
                    Some(m) => {
                        let closing = matches!(m, Message::Close(_));
                        if ws_tx.send(m).await.is_err() || closing {
                            break;
                        }
                    }
                    None => break,
                }
            }

            incoming = ws_rx.next() => {
                let Some(incoming) = incoming else { break; };
                let Ok(msg) = incoming else { break; };
                match msg {
                    Message::Text(s) => {
                        if s.len() > max_frame {
                            tracing::warn!(conn = %id, len = s.len(), "oversized frame dropped");
                            hooks.stats.inc_errors();
                            continue;
                        }
                        dispatch::process_text(&hooks, &ctx, &s, &out_tx).await;
                    }
                    Message::Binary(_) => {
                        tracing::warn!(conn = %id, "binary frames unsupported, dropped");
                        hooks.stats.inc_errors();
                    }
                    Message::Ping(payload) => {
                        let _ = out_tx.send(Message::Pong(payload)).await;
                    }
                    Message::Pong(_) => {}
                    Message::Close(_) => break,
                }
            }

            _ = ping_tick.tick() => {
                let _ = out_tx.send(Message::Ping(Vec::new())).await;
            }

            // Bounded wait so an idle socket still observes the stopping
            // flag within one window.
            _ = sleep(recv_timeout) => {}
        }
    }

    // Draining: this connection's in-flight handlers get a bounded grace
    // to finish, then the rest are cancelled, before the connection drops
    // out of the routing tables.
    let aborted = supervisor
        .shutdown(Duration::from_millis(cfg.handler_grace_ms))
        .await;
    if aborted > 0 {
        tracing::warn!(conn = %id, aborted, "handler tasks aborted at session close");
    }
    app.end_session(id);
    app.registry().unregister(id);
    tracing::info!(conn = %id, "connection closed");
    Ok(())
}
