//! Per-connection lifecycle
//!
//! The transport translates socket activity into [`ConnectionEvent`]s and
//! feeds them to a [`Session`], which walks the connection through
//! `Connecting -> Open -> Closing -> Closed`. Close and error both end in
//! the same deregistration, so it does not matter if both fire.

use std::sync::Arc;

use tracing::{debug, error, info};

use super::{ClientConnection, ConnectionId, ConnectionState, InboundMessage, Router};

/// Transport events for one connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Handshake completed
    Opened,
    /// A text payload arrived
    Message(String),
    /// The peer or the server closed the channel
    Closed,
    /// The channel failed
    Error(String),
}

/// State machine for a single connection
pub struct Session {
    router: Arc<Router>,
    connection: Arc<ClientConnection>,
    id: Option<ConnectionId>,
}

impl Session {
    pub fn new(router: Arc<Router>, connection: Arc<ClientConnection>) -> Self {
        Self {
            router,
            connection,
            id: None,
        }
    }

    /// Identity, once registered
    pub fn id(&self) -> Option<ConnectionId> {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Apply one event and return the resulting state
    pub async fn handle(&mut self, event: ConnectionEvent) -> ConnectionState {
        match (self.state(), event) {
            (ConnectionState::Connecting, ConnectionEvent::Opened) => {
                let id = self.router.connect(Arc::clone(&self.connection)).await;
                self.id = Some(id);
            }
            (ConnectionState::Open, ConnectionEvent::Message(payload)) => {
                if let Some(id) = self.id {
                    info!("Received message from Client {}: {}", id, payload);
                    self.router
                        .broadcast(&InboundMessage::new(id, payload))
                        .await;
                }
            }
            (_, ConnectionEvent::Closed) => {
                if self.state() != ConnectionState::Closed {
                    info!("Client {} disconnected", self.label());
                }
                self.close().await;
            }
            (_, ConnectionEvent::Error(e)) => {
                error!("WebSocket error for Client {}: {}", self.label(), e);
                self.close().await;
            }
            (state, event) => {
                debug!(
                    "Ignoring {:?} for Client {} in state {:?}",
                    event,
                    self.label(),
                    state
                );
            }
        }

        self.state()
    }

    async fn close(&mut self) {
        self.connection.begin_close();
        if let Some(id) = self.id {
            self.router.disconnect(id).await;
        }
        self.connection.set_state(ConnectionState::Closed);
    }

    /// Identity for log lines
    pub fn label(&self) -> String {
        match self.id {
            Some(id) => id.to_string(),
            None => "<unregistered>".to_string(),
        }
    }
}
