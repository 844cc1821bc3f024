//! Message/error counters and the operator-facing snapshot.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Monotonic counters, reset only by `stop()`.
#[derive(Default)]
pub struct BusStats {
    messages_in: AtomicU64,
    messages_out: AtomicU64,
    acks_sent: AtomicU64,
    acks_received: AtomicU64,
    errors: AtomicU64,
}

impl BusStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_messages_in(&self) {
        self.messages_in.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_messages_out(&self) {
        self.messages_out.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_acks_sent(&self) {
        self.acks_sent.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_acks_received(&self) {
        self.acks_received.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_errors(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        self.messages_in.store(0, Ordering::Relaxed);
        self.messages_out.store(0, Ordering::Relaxed);
        self.acks_sent.store(0, Ordering::Relaxed);
        self.acks_received.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(
        &self,
        active_connections: usize,
        active_users: usize,
        active_handler_tasks: usize,
    ) -> StatsSnapshot {
        StatsSnapshot {
            active_connections,
            active_users,
            active_handler_tasks,
            messages_in: self.messages_in.load(Ordering::Relaxed),
            messages_out: self.messages_out.load(Ordering::Relaxed),
            acks_sent: self.acks_sent.load(Ordering::Relaxed),
            acks_received: self.acks_received.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Read-only observability surface; not part of the routing contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub active_connections: usize,
    pub active_users: usize,
    pub active_handler_tasks: usize,
    pub messages_in: u64,
    pub messages_out: u64,
    pub acks_sent: u64,
    pub acks_received: u64,
    pub errors: u64,
}
