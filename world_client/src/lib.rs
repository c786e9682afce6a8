//! `world_client`
//!
//! Client-side systems:
//! - Connection lifecycle (cooldown, heartbeat, capped reconnect backoff)
//! - Entity reconciliation against authoritative snapshots and deltas
//! - Interpolation of displayed transforms toward network targets
//! - Local object log with receive-side dedup
//! - Console wiring for diagnostics

pub mod client;
pub mod interp;
pub mod lifecycle;
pub mod reconcile;

pub use client::GameClient;
