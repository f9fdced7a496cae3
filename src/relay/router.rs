//! Broadcast router
//!
//! Turns an inbound message into one rendered frame and fans it out over a
//! registry snapshot. Each target is tried independently: a full or closed
//! queue costs that target the message and nothing else.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{
    ClientConnection, ConnectionId, InboundMessage, OutboundMessage, Registry, SendError,
};

/// Fan-out behaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Deliver broadcasts back to the connection that sent them
    pub include_sender: bool,
    /// Prefix broadcasts with `Client <id>: `
    pub tag_sender: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            include_sender: true,
            tag_sender: true,
        }
    }
}

/// Outcome of one broadcast
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Targets whose queue accepted the message
    pub delivered: usize,
    /// Targets left out: the sender when excluded, or no longer open
    pub skipped: usize,
    /// Targets whose delivery failed
    pub failed: usize,
}

/// Routes messages between the connections held in a [`Registry`]
pub struct Router {
    registry: Arc<Registry>,
    config: RouterConfig,
}

impl Router {
    pub fn new(registry: Arc<Registry>, config: RouterConfig) -> Self {
        Self { registry, config }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Register a new connection and greet it
    ///
    /// The welcome goes out after registration so the assigned identity is
    /// known.
    pub async fn connect(&self, connection: Arc<ClientConnection>) -> ConnectionId {
        let id = self.registry.register(Arc::clone(&connection)).await;
        match connection.peer_addr() {
            Some(addr) => info!("Client {} connected from {}", id, addr),
            None => info!("Client {} connected", id),
        }

        match self.send_to(id, &OutboundMessage::welcome(id)).await {
            Ok(()) => debug!("Sent initial greeting to Client {}", id),
            Err(e) => warn!("Failed to greet Client {}: {}", id, e),
        }

        id
    }

    /// Queue a message for one registered connection
    pub async fn send_to(
        &self,
        id: ConnectionId,
        message: &OutboundMessage,
    ) -> Result<(), SendError> {
        let connection = self
            .registry
            .get(id)
            .await
            .ok_or(SendError::Unknown(id))?;
        connection.send(message.render())
    }

    /// Deliver a message to every open connection in the current snapshot
    pub async fn broadcast(&self, inbound: &InboundMessage) -> BroadcastReport {
        let text = OutboundMessage::broadcast(inbound, self.config.tag_sender).render();
        let targets = self.registry.snapshot().await;
        let mut report = BroadcastReport::default();

        for (id, connection) in targets {
            if !self.config.include_sender && id == inbound.sender {
                report.skipped += 1;
                continue;
            }
            if !connection.is_open() {
                report.skipped += 1;
                continue;
            }

            match connection.send(Arc::clone(&text)) {
                Ok(()) => {
                    report.delivered += 1;
                    debug!("Broadcasted message to Client {}", id);
                }
                Err(SendError::QueueFull) => {
                    report.failed += 1;
                    warn!(
                        "Dropped message for Client {} (queue full, {} dropped so far)",
                        id,
                        connection.drop_count()
                    );
                }
                Err(e) => {
                    report.failed += 1;
                    debug!("Skipped delivery to Client {}: {}", id, e);
                }
            }
        }

        debug!(
            "Broadcast from Client {}: delivered={} skipped={} failed={}",
            inbound.sender, report.delivered, report.skipped, report.failed
        );
        report
    }

    /// Drop a connection from the registry
    ///
    /// Safe to call from both the close and the error path.
    pub async fn disconnect(&self, id: ConnectionId) -> bool {
        self.registry.deregister(id).await
    }
}
