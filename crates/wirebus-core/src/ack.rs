//! ACK correlation.
//!
//! Acks are fire-and-forget confirmations of receipt, not a retry trigger.
//! The tracker exists for diagnostics: round-trip age on resolution and a
//! sweep for entries whose ack never arrived.

use dashmap::DashMap;

use crate::protocol::envelope::now_ms;

/// Pending `msg_id -> sent-at-ms` correlation entries.
#[derive(Default)]
pub struct AckTracker {
    pending: DashMap<String, u64>,
}

impl AckTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an outbound message awaiting acknowledgement.
    pub fn track(&self, msg_id: &str) {
        if msg_id.is_empty() {
            return;
        }
        self.pending.insert(msg_id.to_string(), now_ms());
    }

    /// Match an incoming ack. Returns the round-trip age in milliseconds,
    /// or `None` for an unknown (or already resolved) `msg_id`.
    pub fn resolve(&self, acked_msg_id: &str) -> Option<u64> {
        self.pending
            .remove(acked_msg_id)
            .map(|(_, sent_at)| now_ms().saturating_sub(sent_at))
    }

    /// Entries still awaiting an ack.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Drop entries older than `max_age_ms`. Returns how many were swept.
    pub fn sweep(&self, max_age_ms: u64) -> usize {
        let cutoff = now_ms().saturating_sub(max_age_ms);
        let stale: Vec<String> = self
            .pending
            .iter()
            .filter(|e| *e.value() < cutoff)
            .map(|e| e.key().clone())
            .collect();
        let swept = stale.len();
        for id in stale {
            self.pending.remove(&id);
        }
        swept
    }

    /// Forget everything (used on stop so restart begins clean).
    pub fn clear(&self) {
        self.pending.clear();
    }
}
