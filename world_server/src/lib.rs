//! `world_server`
//!
//! Authoritative server: session table, entity-update relay, presence
//! broadcasting, world object replication, and chat relay.

pub mod presence;
pub mod server;

pub use server::{bind_ephemeral, GameServer};
