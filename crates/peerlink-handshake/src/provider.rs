//! Provider side of the handshake: the consent gate in front of the
//! session server.

use peerlink_core::token::{generate_session_token, tokens_match};
use peerlink_core::{
    BridgeError, CapabilityRegistry, ConsentHandler, Dispatcher, Envelope, HandshakeMessage,
    IdentityResolver, LifecycleLease, MemoryRegistryStore, NoIdentity, NoLease, PeerInfo,
    PeerScheme, Ready, Register, Registered, RegistryEntry, RegistryStore,
};
use peerlink_session::{SessionConfig, SessionServer};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::transport::OutOfBandTransport;

/// What to do when no consent handler is installed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MissingConsentPolicy {
    /// Approve every wakeup. Only sensible when the host gates wakeups
    /// some other way.
    #[default]
    Allow,
    Deny,
}

#[derive(Debug, Clone, Default)]
pub struct ProviderConfig {
    pub session: SessionConfig,
    /// Calling identities (or peer schemes) treated as verified.
    pub trust_allowlist: Vec<String>,
    pub missing_consent: MissingConsentPolicy,
}

/// Result of one wakeup. Only `Started` sends anything back to the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WakeupOutcome {
    /// Ignored without reply (foreground obscured, or no token).
    Dropped,
    /// Consent was refused.
    Denied,
    Started {
        endpoint: String,
        /// The stored pairing token matched, so consent was not asked.
        auto_approved: bool,
    },
}

/// Answers wakeups and registrations for one provider scheme.
pub struct ProviderOrchestrator {
    scheme: PeerScheme,
    display_name: String,
    config: ProviderConfig,
    registry: Arc<CapabilityRegistry>,
    server: SessionServer,
    transport: Arc<dyn OutOfBandTransport>,
    store: Arc<dyn RegistryStore>,
    identity: Arc<dyn IdentityResolver>,
    consent: Option<Arc<dyn ConsentHandler>>,
}

pub struct ProviderBuilder {
    scheme: PeerScheme,
    display_name: String,
    registry: Arc<CapabilityRegistry>,
    transport: Arc<dyn OutOfBandTransport>,
    config: ProviderConfig,
    store: Arc<dyn RegistryStore>,
    identity: Arc<dyn IdentityResolver>,
    consent: Option<Arc<dyn ConsentHandler>>,
    lease: Arc<dyn LifecycleLease>,
}

impl ProviderBuilder {
    pub fn config(mut self, config: ProviderConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(mut self, store: Arc<dyn RegistryStore>) -> Self {
        self.store = store;
        self
    }

    pub fn identity(mut self, identity: Arc<dyn IdentityResolver>) -> Self {
        self.identity = identity;
        self
    }

    pub fn consent(mut self, consent: Arc<dyn ConsentHandler>) -> Self {
        self.consent = Some(consent);
        self
    }

    pub fn lease(mut self, lease: Arc<dyn LifecycleLease>) -> Self {
        self.lease = lease;
        self
    }

    pub fn build(self) -> ProviderOrchestrator {
        let dispatcher = Dispatcher::new(self.registry.clone());
        let server = SessionServer::new(self.config.session.clone(), dispatcher, self.lease);
        ProviderOrchestrator {
            scheme: self.scheme,
            display_name: self.display_name,
            config: self.config,
            registry: self.registry,
            server,
            transport: self.transport,
            store: self.store,
            identity: self.identity,
            consent: self.consent,
        }
    }
}

impl ProviderOrchestrator {
    /// Start building a provider. Defaults: in-memory store, no identity
    /// lookup, no lease, no consent handler.
    pub fn builder(
        scheme: PeerScheme,
        display_name: impl Into<String>,
        registry: Arc<CapabilityRegistry>,
        transport: Arc<dyn OutOfBandTransport>,
    ) -> ProviderBuilder {
        ProviderBuilder {
            scheme,
            display_name: display_name.into(),
            registry,
            transport,
            config: ProviderConfig::default(),
            store: Arc::new(MemoryRegistryStore::new()),
            identity: Arc::new(NoIdentity),
            consent: None,
            lease: Arc::new(NoLease),
        }
    }

    pub fn scheme(&self) -> &PeerScheme {
        &self.scheme
    }

    pub fn server(&self) -> &SessionServer {
        &self.server
    }

    pub fn store(&self) -> &Arc<dyn RegistryStore> {
        &self.store
    }

    /// Run the consent gate for a wakeup and, if it passes, start the
    /// session server with the peer's token and reply `ready`.
    pub async fn on_wakeup(&self, mut peer: PeerInfo) -> Result<WakeupOutcome, BridgeError> {
        let scheme = peer.peer_scheme.clone();
        if self.identity.is_foreground_obscured() {
            tracing::warn!(peer = %scheme, "foreground obscured; dropping wakeup");
            return Ok(WakeupOutcome::Dropped);
        }
        let Some(token) = peer.session_token.clone() else {
            tracing::warn!(peer = %scheme, "wakeup without a session token");
            return Ok(WakeupOutcome::Dropped);
        };

        let stored = self.stored_entry(&scheme);
        let auto_approved = stored
            .as_ref()
            .is_some_and(|entry| tokens_match(&entry.token, &token));

        if auto_approved {
            tracing::info!(peer = %scheme, "known pairing token; skipping consent");
        } else {
            if peer.calling_identity.is_none() {
                peer.calling_identity = self.identity.resolve_calling_identity();
            }
            peer.previous_display_name = stored
                .as_ref()
                .filter(|entry| entry.display_name != peer.display_name)
                .map(|entry| entry.display_name.clone());
            peer.identity_verified = self.identity_verified(&peer);
            if let Some(previous) = &peer.previous_display_name {
                tracing::warn!(
                    peer = %scheme,
                    stored = %previous,
                    presented = %peer.display_name,
                    "display name differs from the stored pairing"
                );
            }

            if !self.ask_consent(&peer) {
                tracing::info!(peer = %scheme, "wakeup denied");
                return Ok(WakeupOutcome::Denied);
            }
        }

        let endpoint = self.server.start(&token).await?;

        let entry = RegistryEntry::new(scheme.clone(), peer.display_name.clone(), token)
            .with_capabilities(self.registry.names())
            .superseding(stored.as_ref());
        if let Err(e) = self.store.save(entry) {
            tracing::warn!(peer = %scheme, error = %e, "failed to persist pairing");
        }

        let ready = HandshakeMessage::Ready(Ready {
            endpoint: endpoint.clone(),
            provider_scheme: self.scheme.clone(),
        });
        self.transport.send(&scheme, ready).await?;
        tracing::info!(peer = %scheme, %endpoint, auto_approved, "session ready");

        Ok(WakeupOutcome::Started {
            endpoint,
            auto_approved,
        })
    }

    /// Mint a pairing token for the registering peer and reply with it and
    /// the capability names. No consent: no session is started.
    pub async fn on_register(&self, register: Register) -> Result<Registered, BridgeError> {
        let peer = register.reply_scheme;
        let token = generate_session_token();
        let capabilities = self.registry.names();
        let previous = self.stored_entry(&peer);

        let entry = RegistryEntry::new(peer.clone(), register.display_name, token.clone())
            .with_capabilities(capabilities.clone())
            .superseding(previous.as_ref());
        self.store.save(entry)?;

        let registered = Registered {
            provider_scheme: self.scheme.clone(),
            display_name: self.display_name.clone(),
            token,
            capabilities,
        };
        self.transport
            .send(&peer, HandshakeMessage::Registered(registered.clone()))
            .await?;
        tracing::info!(peer = %peer, "registered peer");
        Ok(registered)
    }

    /// Route one inbound envelope.
    pub async fn handle_inbound(&self, envelope: Envelope) -> Result<(), BridgeError> {
        if envelope.to != self.scheme {
            tracing::debug!(to = %envelope.to, "envelope for another scheme");
            return Ok(());
        }
        match envelope.message {
            HandshakeMessage::Wakeup(wakeup) => {
                let mut peer = PeerInfo::new(wakeup.reply_scheme, wakeup.display_name)
                    .with_token(wakeup.session_token);
                peer.via_verified_channel = envelope.verified;
                let outcome = self.on_wakeup(peer).await?;
                tracing::debug!(?outcome, "wakeup handled");
            }
            HandshakeMessage::Register(register) => {
                self.on_register(register).await?;
            }
            other => {
                tracing::debug!(action = other.action(), "ignoring message meant for a consumer");
            }
        }
        Ok(())
    }

    /// Handle envelopes one at a time until the receiver closes.
    pub async fn serve(&self, mut inbound: mpsc::UnboundedReceiver<Envelope>) {
        while let Some(envelope) = inbound.recv().await {
            let action = envelope.message.action();
            if let Err(e) = self.handle_inbound(envelope).await {
                tracing::warn!(action, error = %e, "handshake failed");
            }
        }
    }

    /// Close the active session, stop listening and release the lease.
    pub async fn dispose(&self) {
        self.server.stop().await;
    }

    fn stored_entry(&self, peer: &PeerScheme) -> Option<RegistryEntry> {
        match self.store.get(peer.as_str()) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(peer = %peer, error = %e, "registry lookup failed");
                None
            }
        }
    }

    fn identity_verified(&self, peer: &PeerInfo) -> bool {
        let resolved = peer.calling_identity.is_some() && peer.previous_display_name.is_none();
        let allowlisted = self.config.trust_allowlist.iter().any(|trusted| {
            peer.calling_identity.as_deref() == Some(trusted.as_str())
                || trusted.eq_ignore_ascii_case(peer.peer_scheme.as_str())
        });
        resolved || peer.via_verified_channel || allowlisted
    }

    fn ask_consent(&self, peer: &PeerInfo) -> bool {
        match &self.consent {
            Some(handler) => handler.approve(peer),
            None => match self.config.missing_consent {
                MissingConsentPolicy::Allow => {
                    tracing::warn!(peer = %peer.peer_scheme, "no consent handler; approving");
                    true
                }
                MissingConsentPolicy::Deny => false,
            },
        }
    }
}
