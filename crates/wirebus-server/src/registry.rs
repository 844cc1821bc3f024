//! Connection registry: the single source of truth for "who is reachable".
//!
//! Three-level index `user_id -> platform -> {connection_id}` plus a flat
//! `connection_id -> entry` table. A connection id lives in at most one
//! `(user, platform)` bucket; removal prunes all three levels so empty
//! buckets never accumulate.

use std::sync::atomic::{AtomicU64, Ordering};

use axum::extract::ws::Message;
use dashmap::{DashMap, DashSet};
use tokio::sync::mpsc;

use crate::auth::ConnectMeta;

/// Opaque connection handle, unique for the life of the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// One session's outbound queue sender.
#[derive(Clone)]
pub struct Connection {
    pub tx: mpsc::Sender<Message>,
}

/// Read-only view of a registered connection.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub user_id: String,
    pub platform: String,
    pub connected_at: u64,
}

struct ConnEntry {
    conn: Connection,
    user_id: String,
    platform: String,
    #[allow(dead_code)]
    meta: ConnectMeta,
    connected_at: u64,
}

#[derive(Default)]
pub struct ConnectionRegistry {
    conns: DashMap<ConnectionId, ConnEntry>,
    index: DashMap<String, DashMap<String, DashSet<ConnectionId>>>,
    seq: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> ConnectionId {
        ConnectionId(self.seq.fetch_add(1, Ordering::Relaxed))
    }

    pub fn register(
        &self,
        id: ConnectionId,
        user_id: String,
        platform: String,
        meta: ConnectMeta,
        conn: Connection,
    ) {
        self.index
            .entry(user_id.clone())
            .or_insert_with(DashMap::new)
            .entry(platform.clone())
            .or_insert_with(DashSet::new)
            .insert(id);

        self.conns.insert(
            id,
            ConnEntry {
                conn,
                user_id,
                platform,
                meta,
                connected_at: wirebus_core::protocol::envelope::now_ms(),
            },
        );
    }

    /// Remove a connection and prune empty buckets at every level.
    ///
    /// Pruning uses `remove_if` so emptiness is re-checked under the shard
    /// lock; a register racing this removal can never be swallowed along
    /// with a stale bucket.
    pub fn unregister(&self, id: ConnectionId) -> Option<Connection> {
        let (_, entry) = self.conns.remove(&id)?;

        if let Some(platforms) = self.index.get(&entry.user_id) {
            if let Some(set) = platforms.get(&entry.platform) {
                set.remove(&id);
            }
            platforms.remove_if(&entry.platform, |_, set| set.is_empty());
        }
        self.index
            .remove_if(&entry.user_id, |_, platforms| platforms.is_empty());

        Some(entry.conn)
    }

    /// Exact-match lookup; no fuzzy matching server-side.
    pub fn lookup(&self, user_id: &str, platform: &str) -> Vec<ConnectionId> {
        let Some(platforms) = self.index.get(user_id) else {
            return vec![];
        };
        let Some(set) = platforms.get(platform) else {
            return vec![];
        };
        set.iter().map(|id| *id.key()).collect()
    }

    pub fn get(&self, id: ConnectionId) -> Option<Connection> {
        self.conns.get(&id).map(|e| e.conn.clone())
    }

    pub fn connection_info(&self, id: ConnectionId) -> Option<ConnectionInfo> {
        self.conns.get(&id).map(|e| ConnectionInfo {
            user_id: e.user_id.clone(),
            platform: e.platform.clone(),
            connected_at: e.connected_at,
        })
    }

    /// All connection ids registered under a user, across platforms.
    pub fn user_connections(&self, user_id: &str) -> Vec<ConnectionId> {
        let Some(platforms) = self.index.get(user_id) else {
            return vec![];
        };
        platforms
            .iter()
            .flat_map(|set| set.value().iter().map(|id| *id.key()).collect::<Vec<_>>())
            .collect()
    }

    /// All live connection ids, optionally filtered by platform.
    pub fn ids(&self, platform: Option<&str>) -> Vec<ConnectionId> {
        self.conns
            .iter()
            .filter(|e| platform.map(|p| e.platform == p).unwrap_or(true))
            .map(|e| *e.key())
            .collect()
    }

    pub fn count_users(&self) -> usize {
        self.index.len()
    }

    pub fn count_connections(&self) -> usize {
        self.conns.len()
    }

    /// Remove everything, returning the connections so shutdown can close
    /// their sockets.
    pub fn drain(&self) -> Vec<(ConnectionId, Connection)> {
        let ids: Vec<ConnectionId> = self.conns.iter().map(|e| *e.key()).collect();
        ids.into_iter()
            .filter_map(|id| self.unregister(id).map(|c| (id, c)))
            .collect()
    }
}
