use futures_util::{SinkExt, StreamExt};
use peerlink_core::{
    BridgeError, CapabilityDefinition, CapabilityRegistry, ConsentHandler, HandshakeMessage,
    IdentityResolver, InputSchema, MemoryRegistryStore, PeerInfo, PeerScheme, RegistryEntry,
    RegistryStore, RpcError, SessionState, Wakeup,
};
use peerlink_handshake::{
    ConsumerConfig, ConsumerOrchestrator, InMemoryRouter, MissingConsentPolicy,
    OutOfBandTransport, ProviderBuilder, ProviderConfig, ProviderOrchestrator, RetryPolicy,
    WakeupOutcome,
};
use serde_json::{Value, json};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message;

fn scheme(s: &str) -> PeerScheme {
    PeerScheme::new(s).unwrap()
}

fn registry() -> Arc<CapabilityRegistry> {
    let mut registry = CapabilityRegistry::new();
    registry
        .register_fn(
            CapabilityDefinition::new("echo", "Echo text back")
                .with_schema(InputSchema::object().required_property("text", "string")),
            |params| Ok(json!({ "text": params["text"] })),
        )
        .unwrap();
    Arc::new(registry)
}

/// Records every consent request and answers with a fixed decision.
struct RecordingConsent {
    approve: bool,
    seen: Mutex<Vec<PeerInfo>>,
}

impl RecordingConsent {
    fn new(approve: bool) -> Arc<Self> {
        Arc::new(Self {
            approve,
            seen: Mutex::new(Vec::new()),
        })
    }

    fn count(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    fn last(&self) -> PeerInfo {
        self.seen.lock().unwrap().last().cloned().unwrap()
    }
}

impl ConsentHandler for RecordingConsent {
    fn approve(&self, peer: &PeerInfo) -> bool {
        self.seen.lock().unwrap().push(peer.clone());
        self.approve
    }
}

/// Approves every request after blocking the provider for a while.
struct SlowConsent {
    delay: Duration,
    asked: AtomicUsize,
}

impl ConsentHandler for SlowConsent {
    fn approve(&self, _peer: &PeerInfo) -> bool {
        self.asked.fetch_add(1, Ordering::SeqCst);
        tokio::task::block_in_place(|| std::thread::sleep(self.delay));
        true
    }
}

struct FakeIdentity {
    identity: Option<String>,
    obscured: bool,
}

impl IdentityResolver for FakeIdentity {
    fn resolve_calling_identity(&self) -> Option<String> {
        self.identity.clone()
    }

    fn is_foreground_obscured(&self) -> bool {
        self.obscured
    }
}

fn provider_with(
    router: &Arc<InMemoryRouter>,
    configure: impl FnOnce(ProviderBuilder) -> ProviderBuilder,
) -> Arc<ProviderOrchestrator> {
    let transport: Arc<dyn OutOfBandTransport> = router.clone();
    let builder = ProviderOrchestrator::builder(scheme("tool"), "Tool", registry(), transport);
    Arc::new(configure(builder).build())
}

fn spawn_provider(router: &Arc<InMemoryRouter>, provider: &Arc<ProviderOrchestrator>) {
    let inbound = router.register(scheme("tool"));
    let provider = provider.clone();
    tokio::spawn(async move { provider.serve(inbound).await });
}

fn test_config() -> ConsumerConfig {
    ConsumerConfig {
        handshake_timeout: Duration::from_secs(2),
        call_timeout: Duration::from_secs(2),
        retry: RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
        },
        pre_authenticate: false,
    }
}

fn consumer_with(
    router: &Arc<InMemoryRouter>,
    config: ConsumerConfig,
) -> (Arc<ConsumerOrchestrator>, Arc<MemoryRegistryStore>) {
    let store = Arc::new(MemoryRegistryStore::new());
    let transport: Arc<dyn OutOfBandTransport> = router.clone();
    let consumer = Arc::new(
        ConsumerOrchestrator::new(scheme("host"), "Host App", transport)
            .with_config(config)
            .with_store(store.clone()),
    );
    let inbound = router.register(scheme("host"));
    let serving = consumer.clone();
    tokio::spawn(async move { serving.serve(inbound).await });
    (consumer, store)
}

fn wakeup_from_host(token: &str, display_name: &str) -> PeerInfo {
    PeerInfo::new(scheme("host"), display_name).with_token(token)
}

#[tokio::test]
async fn wakeup_ready_auth_and_list_tools() {
    let router = Arc::new(InMemoryRouter::new());
    let consent = RecordingConsent::new(true);
    let provider = provider_with(&router, |b| b.consent(consent.clone()));
    spawn_provider(&router, &provider);
    let mut host = router.register(scheme("host"));

    router
        .send(
            &scheme("tool"),
            HandshakeMessage::Wakeup(Wakeup {
                session_token: "T".into(),
                reply_scheme: scheme("host"),
                display_name: "Host App".into(),
            }),
        )
        .await
        .unwrap();

    let envelope = host.recv().await.unwrap();
    let HandshakeMessage::Ready(ready) = envelope.message else {
        panic!("expected ready, got {:?}", envelope.message);
    };
    assert_eq!(ready.provider_scheme, scheme("tool"));
    assert!(ready.endpoint.starts_with("ws://127.0.0.1:"));
    assert_eq!(consent.count(), 1);

    let (mut ws, _) = tokio_tungstenite::connect_async(ready.endpoint.as_str())
        .await
        .unwrap();
    ws.send(Message::Text(r#"{"type":"auth","token":"T"}"#.to_string().into()))
        .await
        .unwrap();
    ws.send(Message::Text(
        r#"{"jsonrpc":"2.0","id":"1","method":"mcp/listTools","params":{}}"#
            .to_string()
            .into(),
    ))
    .await
    .unwrap();

    let reply = loop {
        match ws.next().await.unwrap().unwrap() {
            Message::Text(text) => break serde_json::from_str::<Value>(text.as_str()).unwrap(),
            _ => continue,
        }
    };
    assert_eq!(reply["jsonrpc"], "2.0");
    assert_eq!(reply["id"], "1");
    assert!(reply.get("error").is_none());
    assert_eq!(reply["result"][0]["name"], "echo");

    let entry = provider.store().get("host").unwrap().unwrap();
    assert_eq!(entry.token, "T");
    assert_eq!(entry.capabilities, vec!["echo".to_string()]);
    assert_eq!(provider.server().state(), SessionState::Active);
}

#[tokio::test]
async fn known_token_skips_consent() {
    let router = Arc::new(InMemoryRouter::new());
    let consent = RecordingConsent::new(true);
    let provider = provider_with(&router, |b| b.consent(consent.clone()));
    let _host = router.register(scheme("host"));

    let first = provider.on_wakeup(wakeup_from_host("T", "Host App")).await.unwrap();
    let second = provider.on_wakeup(wakeup_from_host("T", "Host App")).await.unwrap();

    assert!(matches!(first, WakeupOutcome::Started { auto_approved: false, .. }));
    let WakeupOutcome::Started { endpoint, auto_approved } = second else {
        panic!("expected start");
    };
    assert!(auto_approved);
    assert_eq!(Some(endpoint), provider.server().endpoint().await);
    assert_eq!(consent.count(), 1);
}

#[tokio::test]
async fn mismatched_token_is_a_new_pairing() {
    let router = Arc::new(InMemoryRouter::new());
    let consent = RecordingConsent::new(true);
    let store = Arc::new(MemoryRegistryStore::new());
    let mut stored = RegistryEntry::new(scheme("host"), "Host App", "T");
    stored.created_at = 42;
    store.save(stored).unwrap();
    let provider = provider_with(&router, |b| b.consent(consent.clone()).store(store.clone()));
    let _host = router.register(scheme("host"));

    let outcome = provider.on_wakeup(wakeup_from_host("X", "Totally Host")).await.unwrap();
    assert!(matches!(outcome, WakeupOutcome::Started { auto_approved: false, .. }));

    let asked = consent.last();
    assert_eq!(asked.previous_display_name.as_deref(), Some("Host App"));
    assert!(asked.impersonation_suspected());
    assert!(!asked.identity_verified);

    let entry = store.get("host").unwrap().unwrap();
    assert_eq!(entry.token, "X");
    assert_eq!(entry.created_at, 42);
}

#[tokio::test]
async fn obscured_foreground_drops_wakeup() {
    let router = Arc::new(InMemoryRouter::new());
    let consent = RecordingConsent::new(true);
    let provider = provider_with(&router, |b| {
        b.consent(consent.clone()).identity(Arc::new(FakeIdentity {
            identity: Some("com.example.host".into()),
            obscured: true,
        }))
    });
    let mut host = router.register(scheme("host"));

    let outcome = provider.on_wakeup(wakeup_from_host("T", "Host App")).await.unwrap();
    assert_eq!(outcome, WakeupOutcome::Dropped);
    assert_eq!(consent.count(), 0);
    assert!(host.try_recv().is_err());
    assert_eq!(provider.server().state(), SessionState::Idle);
    assert!(provider.store().get("host").unwrap().is_none());
}

#[tokio::test]
async fn denied_wakeup_sends_nothing() {
    let router = Arc::new(InMemoryRouter::new());
    let consent = RecordingConsent::new(false);
    let provider = provider_with(&router, |b| b.consent(consent.clone()));
    let mut host = router.register(scheme("host"));

    let outcome = provider.on_wakeup(wakeup_from_host("T", "Host App")).await.unwrap();
    assert_eq!(outcome, WakeupOutcome::Denied);
    assert_eq!(consent.count(), 1);
    assert!(host.try_recv().is_err());
    assert_eq!(provider.server().state(), SessionState::Idle);
}

#[tokio::test]
async fn missing_consent_handler_follows_policy() {
    let router = Arc::new(InMemoryRouter::new());
    let _host = router.register(scheme("host"));

    let deny = provider_with(&router, |b| {
        b.config(ProviderConfig {
            missing_consent: MissingConsentPolicy::Deny,
            ..ProviderConfig::default()
        })
    });
    let outcome = deny.on_wakeup(wakeup_from_host("T", "Host App")).await.unwrap();
    assert_eq!(outcome, WakeupOutcome::Denied);

    let allow = provider_with(&router, |b| b);
    let outcome = allow.on_wakeup(wakeup_from_host("T", "Host App")).await.unwrap();
    assert!(matches!(outcome, WakeupOutcome::Started { .. }));
    allow.dispose().await;
}

#[tokio::test]
async fn identity_verification_sources() {
    let router = Arc::new(InMemoryRouter::new());
    let _host = router.register(scheme("host"));

    let consent = RecordingConsent::new(true);
    let resolved = provider_with(&router, |b| {
        b.consent(consent.clone()).identity(Arc::new(FakeIdentity {
            identity: Some("com.example.host".into()),
            obscured: false,
        }))
    });
    resolved.on_wakeup(wakeup_from_host("A", "Host App")).await.unwrap();
    let asked = consent.last();
    assert_eq!(asked.calling_identity.as_deref(), Some("com.example.host"));
    assert!(asked.identity_verified);
    resolved.dispose().await;

    let consent = RecordingConsent::new(true);
    let allowlisted = provider_with(&router, |b| {
        b.consent(consent.clone()).config(ProviderConfig {
            trust_allowlist: vec!["host".into()],
            ..ProviderConfig::default()
        })
    });
    allowlisted.on_wakeup(wakeup_from_host("B", "Host App")).await.unwrap();
    assert!(consent.last().identity_verified);
    allowlisted.dispose().await;

    let consent = RecordingConsent::new(true);
    let plain = provider_with(&router, |b| b.consent(consent.clone()));
    let mut via_channel = wakeup_from_host("C", "Host App");
    via_channel.via_verified_channel = true;
    plain.on_wakeup(via_channel).await.unwrap();
    assert!(consent.last().identity_verified);
    plain.on_wakeup(wakeup_from_host("D", "Host App")).await.unwrap();
    assert!(!consent.last().identity_verified);
    plain.dispose().await;
}

#[tokio::test]
async fn consumer_opens_lists_and_calls() {
    let router = Arc::new(InMemoryRouter::new());
    let consent = RecordingConsent::new(true);
    let provider = provider_with(&router, |b| b.consent(consent.clone()));
    spawn_provider(&router, &provider);
    let (consumer, store) = consumer_with(&router, test_config());

    let session = consumer.open(&scheme("tool")).await.unwrap();
    let tools = session.list_capabilities().await.unwrap();
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].name, "echo");

    let result = session.call("echo", json!({ "text": "hi" })).await.unwrap();
    assert_eq!(result, json!({ "text": "hi" }));

    let mine = store.get("tool").unwrap().unwrap();
    let theirs = provider.store().get("host").unwrap().unwrap();
    assert_eq!(mine.token, theirs.token);
    assert!(mine.capabilities.is_empty());
    assert!(!consumer.has_pending_wakeup(&scheme("tool")));
}

#[tokio::test]
async fn reopening_reuses_the_pairing_token() {
    let router = Arc::new(InMemoryRouter::new());
    let consent = RecordingConsent::new(true);
    let provider = provider_with(&router, |b| b.consent(consent.clone()));
    spawn_provider(&router, &provider);
    let (consumer, _store) = consumer_with(&router, test_config());

    let first = consumer.open(&scheme("tool")).await.unwrap();
    first.close().await;
    let second = consumer.open(&scheme("tool")).await.unwrap();
    second.call("echo", json!({ "text": "again" })).await.unwrap();
    assert_eq!(consent.count(), 1);

    // A reconnect always mints a fresh token, so consent is asked again.
    let third = consumer.reconnect(&scheme("tool")).await.unwrap();
    third.call("echo", json!({ "text": "fresh" })).await.unwrap();
    assert_eq!(consent.count(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reconnect_during_pending_wakeup_uses_its_own_ready() {
    let router = Arc::new(InMemoryRouter::new());
    let consent = Arc::new(SlowConsent {
        delay: Duration::from_millis(300),
        asked: AtomicUsize::new(0),
    });
    let provider = provider_with(&router, |b| b.consent(consent.clone()));
    spawn_provider(&router, &provider);
    let (consumer, _store) = consumer_with(&router, test_config());

    let opening = {
        let consumer = consumer.clone();
        tokio::spawn(async move { consumer.open(&scheme("tool")).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    let fresh = consumer.reconnect(&scheme("tool")).await.unwrap();
    let first = opening.await.unwrap().unwrap();
    assert_eq!(first.endpoint().await, fresh.endpoint().await);
    assert!(!consumer.has_pending_wakeup(&scheme("tool")));

    let result = fresh.call("echo", json!({ "text": "fresh" })).await.unwrap();
    assert_eq!(result, json!({ "text": "fresh" }));
    let result = first.call("echo", json!({ "text": "first" })).await.unwrap();
    assert_eq!(result, json!({ "text": "first" }));
    assert!(consent.asked.load(Ordering::SeqCst) >= 2);
}

#[tokio::test]
async fn closed_handle_fails_calls_without_a_new_handshake() {
    let router = Arc::new(InMemoryRouter::new());
    let consent = RecordingConsent::new(true);
    let provider = provider_with(&router, |b| b.consent(consent.clone()));
    spawn_provider(&router, &provider);
    let (consumer, _store) = consumer_with(&router, test_config());

    let session = consumer.open(&scheme("tool")).await.unwrap();
    session.call("echo", json!({ "text": "x" })).await.unwrap();
    session.close().await;
    assert!(session.is_closed());

    let err = session.call("echo", json!({ "text": "y" })).await.unwrap_err();
    assert!(matches!(err, BridgeError::Closed));
    assert!(!err.is_connection_class());
    assert!(matches!(session.reconnect().await, Err(BridgeError::Closed)));
    assert_eq!(consent.count(), 1);
    assert!(!consumer.has_pending_wakeup(&scheme("tool")));
}

#[tokio::test]
async fn unanswered_wakeup_times_out_and_clears_pending() {
    let router = Arc::new(InMemoryRouter::new());
    let _silent = router.register(scheme("tool"));
    let config = ConsumerConfig {
        handshake_timeout: Duration::from_millis(100),
        ..test_config()
    };
    let (consumer, _store) = consumer_with(&router, config);

    let err = consumer.open(&scheme("tool")).await.err().unwrap();
    assert!(matches!(err, BridgeError::HandshakeTimeout { ref scheme, .. } if scheme == "tool"));
    assert!(err.is_connection_class());
    assert!(!consumer.has_pending_wakeup(&scheme("tool")));
}

#[tokio::test]
async fn concurrent_opens_share_one_wakeup() {
    let router = Arc::new(InMemoryRouter::new());
    let mut silent = router.register(scheme("tool"));
    let config = ConsumerConfig {
        handshake_timeout: Duration::from_millis(200),
        ..test_config()
    };
    let (consumer, _store) = consumer_with(&router, config);

    let tool = scheme("tool");
    let (a, b) = tokio::join!(consumer.open(&tool), consumer.open(&tool));
    assert!(a.is_err() && b.is_err());

    assert!(silent.try_recv().is_ok());
    assert!(silent.try_recv().is_err());
}

#[tokio::test]
async fn unknown_provider_is_a_transport_error() {
    let router = Arc::new(InMemoryRouter::new());
    let (consumer, _store) = consumer_with(&router, test_config());

    let err = consumer.open(&scheme("nobody")).await.err().unwrap();
    assert!(matches!(err, BridgeError::Transport(_)));
    assert!(!consumer.has_pending_wakeup(&scheme("nobody")));
}

#[tokio::test]
async fn registration_pairs_without_consent() {
    let router = Arc::new(InMemoryRouter::new());
    let consent = RecordingConsent::new(true);
    let provider = provider_with(&router, |b| b.consent(consent.clone()));
    spawn_provider(&router, &provider);
    let (consumer, store) = consumer_with(&router, test_config());

    let registered = consumer.register(&scheme("tool")).await.unwrap();
    assert_eq!(registered.provider_scheme, scheme("tool"));
    assert_eq!(registered.display_name, "Tool");
    assert_eq!(registered.capabilities, vec!["echo".to_string()]);
    assert_eq!(consent.count(), 0);

    let theirs = provider.store().get("host").unwrap().unwrap();
    assert_eq!(theirs.token, registered.token);
    assert_eq!(theirs.display_name, "Host App");
    let mine = store.get("tool").unwrap().unwrap();
    assert_eq!(mine.token, registered.token);
    assert_eq!(mine.display_name, "Tool");

    // The stored token is presented on the next wakeup and auto-approved.
    let session = consumer.open(&scheme("tool")).await.unwrap();
    session.call("echo", json!({ "text": "paired" })).await.unwrap();
    assert_eq!(consent.count(), 0);
    assert_eq!(store.get("tool").unwrap().unwrap().capabilities, vec!["echo".to_string()]);
}

#[tokio::test]
async fn application_errors_are_not_retried() {
    let router = Arc::new(InMemoryRouter::new());
    let consent = RecordingConsent::new(true);
    let provider = provider_with(&router, |b| b.consent(consent.clone()));
    spawn_provider(&router, &provider);
    let (consumer, _store) = consumer_with(&router, test_config());
    let session = consumer.open(&scheme("tool")).await.unwrap();

    let err = session.call("echo", json!({})).await.unwrap_err();
    let BridgeError::Rpc(rpc) = &err else {
        panic!("expected rpc error, got {err:?}");
    };
    assert_eq!(rpc.code, RpcError::INVALID_PARAMS);
    assert_eq!(rpc.message, r#"Missing required field: "text""#);

    let err = session.call("nope", json!({})).await.unwrap_err();
    assert_eq!(err.code(), RpcError::METHOD_NOT_FOUND);

    // No reconnect happened: a reconnect would have asked for consent.
    assert_eq!(consent.count(), 1);
}

#[tokio::test]
async fn lost_session_is_reconnected_and_call_replayed() {
    let router = Arc::new(InMemoryRouter::new());
    let consent = RecordingConsent::new(true);
    let provider = provider_with(&router, |b| b.consent(consent.clone()));
    spawn_provider(&router, &provider);
    let (consumer, _store) = consumer_with(&router, test_config());
    let session = consumer.open(&scheme("tool")).await.unwrap();
    session.call("echo", json!({ "text": "before" })).await.unwrap();

    provider.server().stop().await;
    assert_eq!(provider.server().state(), SessionState::Idle);

    let result = session.call("echo", json!({ "text": "after" })).await.unwrap();
    assert_eq!(result, json!({ "text": "after" }));
    assert_eq!(consent.count(), 2);
    assert_eq!(provider.server().state(), SessionState::Active);
}

#[tokio::test]
async fn retries_give_up_after_the_policy_allows() {
    let router = Arc::new(InMemoryRouter::new());
    let consent = RecordingConsent::new(true);
    let provider = provider_with(&router, |b| b.consent(consent.clone()));
    spawn_provider(&router, &provider);
    let config = ConsumerConfig {
        handshake_timeout: Duration::from_millis(200),
        ..test_config()
    };
    let (consumer, _store) = consumer_with(&router, config);
    let session = consumer.open(&scheme("tool")).await.unwrap();

    // Nobody answers wakeups any more.
    router.unregister(&scheme("tool"));
    provider.server().stop().await;

    let err = session.call("echo", json!({ "text": "x" })).await.unwrap_err();
    assert!(matches!(err, BridgeError::Transport(_)));
}

#[tokio::test]
async fn dispose_fails_pending_wakeups() {
    let router = Arc::new(InMemoryRouter::new());
    let _silent = router.register(scheme("tool"));
    let (consumer, _store) = consumer_with(&router, test_config());

    let opening = {
        let consumer = consumer.clone();
        tokio::spawn(async move { consumer.open(&scheme("tool")).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    consumer.dispose().await;

    let err = opening.await.unwrap().err().unwrap();
    assert!(matches!(err, BridgeError::Disposed));
    assert!(matches!(
        consumer.open(&scheme("tool")).await.err().unwrap(),
        BridgeError::Disposed
    ));
}

#[tokio::test]
async fn provider_dispose_closes_the_session() {
    let router = Arc::new(InMemoryRouter::new());
    let provider = provider_with(&router, |b| b);
    spawn_provider(&router, &provider);
    let config = ConsumerConfig {
        retry: RetryPolicy::none(),
        ..test_config()
    };
    let (consumer, _store) = consumer_with(&router, config);
    let session = consumer.open(&scheme("tool")).await.unwrap();
    session.call("echo", json!({ "text": "x" })).await.unwrap();

    provider.dispose().await;
    assert_eq!(provider.server().state(), SessionState::Idle);
    assert!(session.call("echo", json!({ "text": "y" })).await.is_err());
}
