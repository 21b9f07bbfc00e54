//! The shared-listener HTTP multiplexer described in §4.6: several HTTP
//! sources can share one listener on the same address, each owning a
//! distinct path, attached in three phases so a route never 404s mid
//! startup.
//!
//! 1. `ServerPool::pre_register(addr, path)` reserves the slot and returns a
//!    [`RouteHandle`]; the path answers `503` until a handler is attached.
//! 2. `ServerPool::start()` opens the TCP listeners and begins serving.
//! 3. `RouteHandle::set_handler(handler)` atomically swaps in the real
//!    [`fiso_core::EventHandler`]; in-flight lookups always see either the
//!    placeholder or the final handler, never a torn state.

mod pool;
mod server;

pub use fiso_core::EventHandler as RouteHandler;
pub use pool::{RouteHandle, ServerPool};
