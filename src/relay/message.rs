//! Relay message types
//!
//! Frames are plain text. Inbound payloads are relayed verbatim; the only
//! decoration the relay adds is the sender tag and the one-off welcome.

use std::fmt;
use std::sync::Arc;

use super::ConnectionId;

/// A payload received from one connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub sender: ConnectionId,
    pub payload: String,
}

impl InboundMessage {
    pub fn new(sender: ConnectionId, payload: impl Into<String>) -> Self {
        Self {
            sender,
            payload: payload.into(),
        }
    }
}

/// A message the relay sends to clients
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundMessage {
    /// Unicast greeting sent once, right after registration
    Welcome { id: ConnectionId },
    /// A relayed payload, optionally tagged with its sender
    Broadcast {
        sender: ConnectionId,
        payload: String,
        tagged: bool,
    },
}

impl OutboundMessage {
    pub fn welcome(id: ConnectionId) -> Self {
        Self::Welcome { id }
    }

    pub fn broadcast(inbound: &InboundMessage, tagged: bool) -> Self {
        Self::Broadcast {
            sender: inbound.sender,
            payload: inbound.payload.clone(),
            tagged,
        }
    }

    /// Render once so a single allocation can be shared by every target
    pub fn render(&self) -> Arc<str> {
        Arc::from(self.to_string())
    }
}

impl fmt::Display for OutboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Welcome { id } => write!(f, "Say Hello, Client {id}"),
            Self::Broadcast {
                sender,
                payload,
                tagged: true,
            } => write!(f, "Client {sender}: {payload}"),
            Self::Broadcast {
                payload,
                tagged: false,
                ..
            } => f.write_str(payload),
        }
    }
}
