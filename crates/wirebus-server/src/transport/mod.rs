//! WebSocket transport (HTTP upgrade + per-connection session loop).

pub mod ws;
