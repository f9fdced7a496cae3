//! WebSocket server module
//!
//! Accepts client sockets, serves the HTTP health check and bridges
//! WebSocket frames into the relay.

mod handler;
mod routes;
mod websocket;

pub use websocket::*;
