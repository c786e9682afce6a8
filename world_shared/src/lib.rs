//! `world_shared`
//!
//! Shared libraries used by both client and server.
//!
//! Design goals:
//! - Deterministic and modular where practical.
//! - Clear separation of concerns (net, store, world log, math, events).
//! - Idempotent, upsert-by-id state so arbitrary interleavings of session
//!   events converge.
//! - No `unsafe`.

pub mod chat;
pub mod config;
pub mod console;
pub mod event;
pub mod math;
pub mod net;
pub mod store;
pub mod world;

pub mod prelude {
    //! Commonly used exports.

    pub use crate::config::*;
    pub use crate::event::*;
    pub use crate::math::*;
    pub use crate::net::*;
    pub use crate::store::*;
    pub use crate::world::*;
}
