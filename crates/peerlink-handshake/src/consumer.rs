//! Consumer side of the handshake: wake a provider, then talk to it.

use peerlink_core::token::generate_session_token;
use peerlink_core::{
    BridgeError, CapabilityDefinition, Envelope, HandshakeMessage, LIST_CAPABILITIES_METHOD,
    PeerScheme, Ready, Register, Registered, RegistryEntry, RegistryStore, Wakeup,
};
use peerlink_session::{ClientOptions, DEFAULT_CALL_TIMEOUT, SessionClient};
use serde_json::{Value, json};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{RwLock, mpsc};

use crate::pending::{PendingTable, Resolution, Wait};
use crate::retry::RetryPolicy;
use crate::transport::OutOfBandTransport;

/// How long to wait for `ready` or `registered`.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub handshake_timeout: Duration,
    /// Per call, independent of the handshake timeout.
    pub call_timeout: Duration,
    pub retry: RetryPolicy,
    /// Present the token in the upgrade header rather than an auth message.
    pub pre_authenticate: bool,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            retry: RetryPolicy::default(),
            pre_authenticate: false,
        }
    }
}

/// Wakes providers over the out-of-band transport and opens sessions.
///
/// Share it behind an `Arc`: session handles keep a reference so they can
/// re-run the handshake when their channel drops.
pub struct ConsumerOrchestrator {
    scheme: PeerScheme,
    display_name: String,
    config: ConsumerConfig,
    transport: Arc<dyn OutOfBandTransport>,
    store: Option<Arc<dyn RegistryStore>>,
    wakeups: PendingTable<String, Ready>,
    registrations: PendingTable<(), Registered>,
    clients: Mutex<Vec<Weak<SessionClient>>>,
    disposed: AtomicBool,
}

impl ConsumerOrchestrator {
    /// `scheme` is where providers send their replies.
    pub fn new(
        scheme: PeerScheme,
        display_name: impl Into<String>,
        transport: Arc<dyn OutOfBandTransport>,
    ) -> Self {
        Self {
            scheme,
            display_name: display_name.into(),
            config: ConsumerConfig::default(),
            transport,
            store: None,
            wakeups: PendingTable::new(),
            registrations: PendingTable::new(),
            clients: Mutex::new(Vec::new()),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn with_config(mut self, config: ConsumerConfig) -> Self {
        self.config = config;
        self
    }

    /// Remember pairing tokens so previously approved providers are not
    /// asked for consent again.
    pub fn with_store(mut self, store: Arc<dyn RegistryStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn scheme(&self) -> &PeerScheme {
        &self.scheme
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Wake `peer` and open an authenticated session with it.
    ///
    /// Reuses the stored pairing token for `peer` when there is one, and
    /// joins an in-flight wakeup to the same peer instead of sending another.
    pub async fn open(self: &Arc<Self>, peer: &PeerScheme) -> Result<SessionHandle, BridgeError> {
        let (endpoint, token) = self.wakeup(peer, false).await?;
        let client = self.connect(&endpoint, &token).await?;
        Ok(SessionHandle::new(self.clone(), peer.clone(), client))
    }

    /// Like [`open`](Self::open) but always with a freshly minted token,
    /// superseding any wakeup still pending for `peer`.
    pub async fn reconnect(
        self: &Arc<Self>,
        peer: &PeerScheme,
    ) -> Result<SessionHandle, BridgeError> {
        let (endpoint, token) = self.wakeup(peer, true).await?;
        let client = self.connect(&endpoint, &token).await?;
        Ok(SessionHandle::new(self.clone(), peer.clone(), client))
    }

    /// Ask `peer` for its capability names and a pairing token.
    pub async fn register(&self, peer: &PeerScheme) -> Result<Registered, BridgeError> {
        self.ensure_live()?;
        let join = self.registrations.join(peer, || ());
        let generation = join.generation;
        if join.fresh {
            tracing::info!(peer = %peer, "sending register");
            let message = HandshakeMessage::Register(Register {
                reply_scheme: self.scheme.clone(),
                display_name: self.display_name.clone(),
            });
            if let Err(e) = self.transport.send(peer, message).await {
                self.registrations.unsent(peer, generation);
                return Err(e);
            }
        }

        match join.wait(self.config.handshake_timeout).await {
            Wait::Resolved(registered, ()) => Ok(registered),
            Wait::TimedOut => {
                self.registrations.abandon(peer, generation);
                Err(self.timeout_error(peer))
            }
            Wait::Abandoned => Err(self.abandoned_error(peer)),
        }
    }

    /// Route a reply from a provider. Returns false when nothing was
    /// waiting for it, including a reply to a superseded wakeup.
    pub fn handle_inbound(&self, message: HandshakeMessage) -> bool {
        match message {
            HandshakeMessage::Ready(ready) => {
                let peer = ready.provider_scheme.clone();
                let resolution = self.wakeups.resolve(&peer, ready, |token, _| {
                    self.remember(&peer, token, None);
                });
                log_resolution(&peer, "ready", resolution)
            }
            HandshakeMessage::Registered(registered) => {
                let peer = registered.provider_scheme.clone();
                let resolution = self.registrations.resolve(&peer, registered, |_, registered| {
                    self.remember(&peer, &registered.token, Some(registered));
                });
                log_resolution(&peer, "registered", resolution)
            }
            other => {
                tracing::debug!(action = other.action(), "ignoring message meant for a provider");
                false
            }
        }
    }

    /// Feed inbound envelopes to [`handle_inbound`](Self::handle_inbound)
    /// until the receiver closes or the orchestrator is disposed.
    pub async fn serve(&self, mut inbound: mpsc::UnboundedReceiver<Envelope>) {
        while let Some(envelope) = inbound.recv().await {
            if self.disposed.load(Ordering::SeqCst) {
                break;
            }
            if envelope.to != self.scheme {
                tracing::debug!(to = %envelope.to, "envelope for another scheme");
                continue;
            }
            self.handle_inbound(envelope.message);
        }
    }

    pub fn has_pending_wakeup(&self, peer: &PeerScheme) -> bool {
        self.wakeups.contains(peer)
    }

    /// Fail pending handshakes and calls, then close every session.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.wakeups.clear();
        self.registrations.clear();

        let clients: Vec<Arc<SessionClient>> = lock(&self.clients)
            .drain(..)
            .filter_map(|client| client.upgrade())
            .collect();
        for client in clients {
            client.close().await;
        }
        tracing::info!(scheme = %self.scheme, "consumer disposed");
    }

    /// Send (or join) a wakeup for `peer` and wait for its endpoint.
    /// Returns the endpoint and the token it was issued for.
    async fn wakeup(&self, peer: &PeerScheme, fresh: bool) -> Result<(String, String), BridgeError> {
        self.ensure_live()?;
        let join = if fresh {
            self.wakeups.supersede(peer, generate_session_token())
        } else {
            self.wakeups.join(peer, || self.pairing_token(peer))
        };
        let generation = join.generation;

        if join.fresh {
            tracing::info!(peer = %peer, reconnect = fresh, "sending wakeup");
            let message = HandshakeMessage::Wakeup(Wakeup {
                session_token: join.context.clone(),
                reply_scheme: self.scheme.clone(),
                display_name: self.display_name.clone(),
            });
            if let Err(e) = self.transport.send(peer, message).await {
                self.wakeups.unsent(peer, generation);
                return Err(e);
            }
        } else {
            tracing::debug!(peer = %peer, "joining pending wakeup");
        }

        match join.wait(self.config.handshake_timeout).await {
            Wait::Resolved(ready, token) => Ok((ready.endpoint, token)),
            Wait::TimedOut => {
                self.wakeups.abandon(peer, generation);
                tracing::warn!(peer = %peer, "wakeup timed out");
                Err(self.timeout_error(peer))
            }
            Wait::Abandoned => Err(self.abandoned_error(peer)),
        }
    }

    async fn connect(&self, endpoint: &str, token: &str) -> Result<Arc<SessionClient>, BridgeError> {
        let options = ClientOptions {
            call_timeout: self.config.call_timeout,
            pre_authenticate: self.config.pre_authenticate,
        };
        let client = Arc::new(SessionClient::connect(endpoint, token, options).await?);
        {
            let mut clients = lock(&self.clients);
            clients.retain(|c| c.strong_count() > 0);
            clients.push(Arc::downgrade(&client));
        }
        if self.disposed.load(Ordering::SeqCst) {
            client.close().await;
            return Err(BridgeError::Disposed);
        }
        Ok(client)
    }

    fn pairing_token(&self, peer: &PeerScheme) -> String {
        self.stored_entry(peer)
            .map(|entry| entry.token)
            .unwrap_or_else(generate_session_token)
    }

    fn stored_entry(&self, peer: &PeerScheme) -> Option<RegistryEntry> {
        let store = self.store.as_ref()?;
        match store.get(peer.as_str()) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(peer = %peer, error = %e, "registry lookup failed");
                None
            }
        }
    }

    /// Persist the pairing for `peer`. A `ready` only tells us the token;
    /// a `registered` also names the provider and its capabilities.
    fn remember(&self, peer: &PeerScheme, token: &str, registered: Option<&Registered>) {
        let Some(store) = self.store.as_ref() else {
            return;
        };
        let previous = self.stored_entry(peer);
        let (display_name, capabilities) = match (registered, previous.as_ref()) {
            (Some(r), _) => (r.display_name.clone(), r.capabilities.clone()),
            (None, Some(prev)) => (prev.display_name.clone(), prev.capabilities.clone()),
            (None, None) => (peer.to_string(), Vec::new()),
        };
        let entry = RegistryEntry::new(peer.clone(), display_name, token)
            .with_capabilities(capabilities)
            .superseding(previous.as_ref());
        if let Err(e) = store.save(entry) {
            tracing::warn!(peer = %peer, error = %e, "failed to persist pairing");
        }
    }

    fn ensure_live(&self) -> Result<(), BridgeError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(BridgeError::Disposed);
        }
        Ok(())
    }

    fn timeout_error(&self, peer: &PeerScheme) -> BridgeError {
        BridgeError::HandshakeTimeout {
            scheme: peer.to_string(),
            timeout_ms: self.config.handshake_timeout.as_millis() as u64,
        }
    }

    /// The wait we joined was dropped by its owner: timed out, failed to
    /// send, or disposed.
    fn abandoned_error(&self, peer: &PeerScheme) -> BridgeError {
        if self.disposed.load(Ordering::SeqCst) {
            BridgeError::Disposed
        } else {
            self.timeout_error(peer)
        }
    }
}

/// An open session with one provider.
///
/// Calls that fail for connection-class reasons re-run the handshake with a
/// fresh token and are replayed, per the consumer's [`RetryPolicy`]. Once
/// [`close`](Self::close)d, every call fails with [`BridgeError::Closed`].
pub struct SessionHandle {
    consumer: Arc<ConsumerOrchestrator>,
    peer: PeerScheme,
    client: RwLock<Arc<SessionClient>>,
    closed: AtomicBool,
}

impl SessionHandle {
    fn new(consumer: Arc<ConsumerOrchestrator>, peer: PeerScheme, client: Arc<SessionClient>) -> Self {
        Self {
            consumer,
            peer,
            client: RwLock::new(client),
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn peer(&self) -> &PeerScheme {
        &self.peer
    }

    pub async fn endpoint(&self) -> String {
        self.client.read().await.endpoint().to_string()
    }

    pub async fn list_capabilities(&self) -> Result<Vec<CapabilityDefinition>, BridgeError> {
        let value = self.request(LIST_CAPABILITIES_METHOD, json!({})).await?;
        serde_json::from_value(value).map_err(BridgeError::protocol)
    }

    pub async fn call(&self, name: &str, args: Value) -> Result<Value, BridgeError> {
        self.request(name, args).await
    }

    /// Re-run the handshake with a fresh token and swap in the new channel.
    pub async fn reconnect(&self) -> Result<(), BridgeError> {
        self.ensure_open()?;
        let (endpoint, token) = self.consumer.wakeup(&self.peer, true).await?;
        let client = self.consumer.connect(&endpoint, &token).await?;
        let previous = std::mem::replace(&mut *self.client.write().await, client);
        previous.close().await;
        Ok(())
    }

    /// Close the session for good. Later calls are not retried.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.client.read().await.close().await;
    }

    fn ensure_open(&self) -> Result<(), BridgeError> {
        if self.is_closed() {
            return Err(BridgeError::Closed);
        }
        Ok(())
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value, BridgeError> {
        let params = &params;
        self.consumer
            .config
            .retry
            .execute(
                move || {
                    let params = params.clone();
                    async move {
                        self.ensure_open()?;
                        let client = self.client.read().await.clone();
                        let result = client.call(method, params).await;
                        // A close racing the call wins over its failure.
                        match result {
                            Err(_) if self.is_closed() => Err(BridgeError::Closed),
                            other => other,
                        }
                    }
                },
                move |attempt| async move {
                    tracing::info!(peer = %self.peer, attempt, method, "reconnecting session");
                    self.reconnect().await
                },
                BridgeError::is_connection_class,
            )
            .await
    }
}

fn log_resolution(peer: &PeerScheme, action: &str, resolution: Resolution) -> bool {
    match resolution {
        Resolution::Delivered => true,
        Resolution::Stale => {
            tracing::debug!(peer = %peer, action, "discarding reply to a superseded request");
            false
        }
        Resolution::Unsolicited => {
            tracing::warn!(peer = %peer, action, "unsolicited reply");
            false
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
