//! Outbound half of a single client connection
//!
//! The transport owns the socket; the relay only sees this handle. Text is
//! pushed onto a bounded queue that a per-connection writer task drains, so
//! a slow peer can only ever fill its own queue.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;

/// Default capacity of the per-connection outbound queue
pub const DEFAULT_OUTBOUND_QUEUE: usize = 256;

/// Identity assigned to a connection by the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// Handshake done, not yet registered
    Connecting = 0,
    /// Registered and eligible for delivery
    Open = 1,
    /// Close or error observed, deregistration pending
    Closing = 2,
    /// Deregistered
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Open,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Per-target delivery failure
///
/// Always contained to the one recipient; never aborts a broadcast.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SendError {
    #[error("connection is not open ({0:?})")]
    NotOpen(ConnectionState),

    #[error("outbound queue is full")]
    QueueFull,

    #[error("connection writer has gone away")]
    Disconnected,

    #[error("no registered connection with id {0}")]
    Unknown(ConnectionId),
}

/// Handle to one connected peer
pub struct ClientConnection {
    peer_addr: Option<SocketAddr>,
    /// Queue feeding the connection's writer task
    tx: mpsc::Sender<Arc<str>>,
    state: AtomicU8,
    dropped_messages: AtomicU64,
}

impl ClientConnection {
    /// Create a handle plus the receiving end of its outbound queue
    pub fn new(
        peer_addr: Option<SocketAddr>,
        queue_capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Arc<str>>) {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let connection = Self {
            peer_addr,
            tx,
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            dropped_messages: AtomicU64::new(0),
        };
        (Arc::new(connection), rx)
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Move to `Closing` unless the connection is already past it
    ///
    /// Returns `true` if this call performed the transition.
    pub fn begin_close(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current >= ConnectionState::Closing as u8 {
                return false;
            }
            match self.state.compare_exchange(
                current,
                ConnectionState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Queue text for delivery without waiting
    pub fn send(&self, text: Arc<str>) -> Result<(), SendError> {
        let state = self.state();
        if state != ConnectionState::Open {
            return Err(SendError::NotOpen(state));
        }

        self.tx.try_send(text).map_err(|e| {
            self.dropped_messages.fetch_add(1, Ordering::Relaxed);
            match e {
                mpsc::error::TrySendError::Full(_) => SendError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => SendError::Disconnected,
            }
        })
    }

    /// Total messages dropped because the queue was full or closed
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConnection")
            .field("peer_addr", &self.peer_addr)
            .field("state", &self.state())
            .field("dropped_messages", &self.drop_count())
            .finish()
    }
}
