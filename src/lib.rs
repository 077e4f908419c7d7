//! lineward: a connection-oriented TCP line-protocol server.
//!
//! Accepts TCP connections, wraps each into a managed [`client::ClientHandle`]
//! with proactive liveness polling, and tracks the live set in a
//! [`registry::ClientRegistry`] that supports broadcast and lifecycle
//! operations. The [`server::Server`] runs the accept loop and one session
//! loop per connection.

pub mod client;
pub mod config;
pub mod registry;
pub mod resolver;
pub mod server;
pub mod sync;
