//! Out-of-band delivery of handshake messages.

use async_trait::async_trait;
use peerlink_core::{BridgeError, Envelope, HandshakeMessage, PeerScheme};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;

/// Sends an addressed handshake message to a peer.
///
/// Delivery is fire-and-forget: replies arrive separately through whatever
/// inbound path the host wires to the orchestrators.
#[async_trait]
pub trait OutOfBandTransport: Send + Sync {
    async fn send(&self, to: &PeerScheme, message: HandshakeMessage) -> Result<(), BridgeError>;
}

/// Routes envelopes between schemes registered in the same process.
#[derive(Debug, Default)]
pub struct InMemoryRouter {
    routes: Mutex<HashMap<PeerScheme, mpsc::UnboundedSender<Envelope>>>,
    verified: bool,
}

impl InMemoryRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark every delivered envelope as arriving over a verified channel.
    pub fn verified(mut self, verified: bool) -> Self {
        self.verified = verified;
        self
    }

    /// Claim `scheme` and receive everything addressed to it. A second
    /// registration replaces the first.
    pub fn register(&self, scheme: PeerScheme) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(scheme, tx);
        rx
    }

    pub fn unregister(&self, scheme: &PeerScheme) {
        self.routes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(scheme);
    }
}

#[async_trait]
impl OutOfBandTransport for InMemoryRouter {
    async fn send(&self, to: &PeerScheme, message: HandshakeMessage) -> Result<(), BridgeError> {
        let route = self
            .routes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(to)
            .cloned();
        let Some(route) = route else {
            return Err(BridgeError::transport(format!("no handler for {to}://")));
        };

        tracing::debug!(to = %to, action = message.action(), "routing handshake message");
        let mut envelope = Envelope::new(to.clone(), message);
        envelope.verified = self.verified;
        route
            .send(envelope)
            .map_err(|_| BridgeError::transport(format!("{to}:// is no longer listening")))
    }
}
