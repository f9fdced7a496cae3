//! Relay core
//!
//! Connection registry, broadcast fan-out and the per-connection lifecycle.
//! Nothing in here knows about sockets; the server module drives it through
//! [`Session`] and drains each [`ClientConnection`]'s outbound queue.

mod connection;
mod message;
mod registry;
mod router;
mod session;

pub use connection::*;
pub use message::*;
pub use registry::*;
pub use router::*;
pub use session::*;
