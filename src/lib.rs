//! caphub: a capability-addressed RPC hub.
//!
//! Heterogeneous workers connect to a central hub over a bidirectional
//! message stream, register named capabilities at runtime, and serve
//! invocations routed to them by capability name. An HTTP gateway exposes
//! the registered capabilities to external callers and correlates each
//! HTTP request with its hub response.
//!
//! The crate ships the hub itself ([`hub`]), the Rust worker SDK ([`sdk`]),
//! the HTTP gateway ([`gateway`]), the shared wire format ([`wire`]) and
//! the durable registry store ([`store`]). The `caphub` binary runs the
//! hub; the `gateway` binary runs the HTTP front.

pub mod config;
pub mod error;
pub mod gateway;
pub mod hub;
pub mod sdk;
pub mod store;
pub mod wire;

pub use error::{ApiError, HubError, HubResult};
pub use wire::{Message, MessageType};
