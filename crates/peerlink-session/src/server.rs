//! Session server: one loopback listener, at most one live channel.

use peerlink_core::token::tokens_match;
use peerlink_core::{BridgeError, ChannelState, Dispatcher, LifecycleLease, SessionState};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, RwLock, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

use crate::channel::{CloseReason, SessionChannel};
use crate::config::{SessionConfig, TOKEN_HEADER};

const STOP_GRACE: Duration = Duration::from_secs(1);

/// Serves capability requests to one authenticated consumer at a time.
pub struct SessionServer {
    config: SessionConfig,
    dispatcher: Dispatcher,
    lease: Arc<dyn LifecycleLease>,
    token: Arc<RwLock<String>>,
    state: Arc<watch::Sender<SessionState>>,
    listener: Mutex<Option<Listener>>,
}

struct ActiveChannel {
    id: u64,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<CloseReason>,
}

/// Shared between the accept loop and per-connection tasks.
#[derive(Clone)]
struct AcceptContext {
    dispatcher: Dispatcher,
    token: Arc<RwLock<String>>,
    state: Arc<watch::Sender<SessionState>>,
    auth_timeout: Duration,
    accepting: Arc<AtomicBool>,
    current: Arc<AtomicU64>,
    active: Arc<Mutex<Option<ActiveChannel>>>,
}

struct Listener {
    endpoint: String,
    ctx: AcceptContext,
    accept_task: JoinHandle<()>,
    lease: Arc<dyn LifecycleLease>,
    lease_held: bool,
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.ctx.accepting.store(false, Ordering::SeqCst);
        self.accept_task.abort();
        if self.lease_held {
            self.lease.release();
        }
    }
}

impl SessionServer {
    pub fn new(config: SessionConfig, dispatcher: Dispatcher, lease: Arc<dyn LifecycleLease>) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        Self {
            config,
            dispatcher,
            lease,
            token: Arc::new(RwLock::new(String::new())),
            state: Arc::new(state),
            listener: Mutex::new(None),
        }
    }

    /// Start listening with `token` as the in-force secret.
    ///
    /// Idempotent: when already listening, only the token is replaced (so
    /// the previous token stops working for new connections) and the
    /// existing endpoint is returned.
    pub async fn start(&self, token: &str) -> Result<String, BridgeError> {
        let mut slot = self.listener.lock().await;
        *self.token.write().await = token.to_string();

        if let Some(listener) = slot.as_ref() {
            tracing::info!(endpoint = %listener.endpoint, "session token rotated");
            return Ok(listener.endpoint.clone());
        }

        let tcp = TcpListener::bind(self.config.bind_addr)
            .await
            .map_err(BridgeError::transport)?;
        let addr = tcp.local_addr().map_err(BridgeError::transport)?;
        let endpoint = format!("ws://{addr}");

        let lease_held = self.lease.acquire();
        if !lease_held {
            tracing::warn!("background execution lease refused; serving anyway");
        }

        let ctx = AcceptContext {
            dispatcher: self.dispatcher.clone(),
            token: self.token.clone(),
            state: self.state.clone(),
            auth_timeout: self.config.auth_timeout,
            accepting: Arc::new(AtomicBool::new(true)),
            current: Arc::new(AtomicU64::new(0)),
            active: Arc::new(Mutex::new(None)),
        };
        let accept_task = tokio::spawn(accept_loop(tcp, ctx.clone()));

        self.state.send_replace(SessionState::Listening);
        tracing::info!(%endpoint, "session server listening");

        *slot = Some(Listener {
            endpoint: endpoint.clone(),
            ctx,
            accept_task,
            lease: self.lease.clone(),
            lease_held,
        });
        Ok(endpoint)
    }

    /// Close the active channel, stop listening and release the lease.
    pub async fn stop(&self) {
        let Some(listener) = self.listener.lock().await.take() else {
            return;
        };
        listener.ctx.accepting.store(false, Ordering::SeqCst);
        listener.ctx.current.store(0, Ordering::SeqCst);
        listener.accept_task.abort();

        let active = listener.ctx.active.lock().await.take();
        if let Some(channel) = active {
            let _ = channel.shutdown.send(());
            let mut task = channel.task;
            if tokio::time::timeout(STOP_GRACE, &mut task).await.is_err() {
                task.abort();
            }
        }

        drop(listener);
        self.state.send_replace(SessionState::Idle);
        tracing::info!("session server stopped");
    }

    pub async fn endpoint(&self) -> Option<String> {
        self.listener.lock().await.as_ref().map(|l| l.endpoint.clone())
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Observe state transitions.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }
}

async fn accept_loop(listener: TcpListener, ctx: AcceptContext) {
    let mut next_id: u64 = 0;
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            }
        };
        next_id += 1;
        let ctx = ctx.clone();
        let id = next_id;
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, addr, id, ctx).await {
                tracing::warn!(channel = id, %addr, error = %e, "connection failed");
            }
        });
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    id: u64,
    ctx: AcceptContext,
) -> Result<(), BridgeError> {
    // Peek at the upgrade request for a token delivered out of band.
    let expected = ctx.token.read().await.clone();
    let mut pre_authenticated = false;
    let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        pre_authenticated = req
            .headers()
            .get(TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|presented| tokens_match(&expected, presented));
        Ok(resp)
    };

    let ws = tokio::time::timeout(
        ctx.auth_timeout,
        tokio_tungstenite::accept_hdr_async(stream, callback),
    )
    .await
    .map_err(|_| BridgeError::transport("websocket upgrade timed out"))?
    .map_err(BridgeError::transport)?;

    tracing::debug!(channel = id, %addr, pre_authenticated, "accepted connection");

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let mut active = ctx.active.lock().await;
    if !ctx.accepting.load(Ordering::SeqCst) {
        return Ok(());
    }

    // Newest connection wins.
    ctx.current.store(id, Ordering::SeqCst);
    if let Some(prev) = active.take() {
        tracing::info!(channel = prev.id, replaced_by = id, "closing superseded channel");
        let _ = prev.shutdown.send(());
    }

    let channel = SessionChannel::new(
        id,
        ws,
        pre_authenticated,
        ctx.token.clone(),
        ctx.dispatcher.clone(),
        ctx.auth_timeout,
    );
    let current = ctx.current.clone();
    let state = ctx.state.clone();
    let on_state = move |s: ChannelState| {
        if current.load(Ordering::SeqCst) != id {
            return;
        }
        let next = match s {
            ChannelState::Connecting | ChannelState::Authenticating => SessionState::Authenticating,
            ChannelState::Authenticated => SessionState::Active,
            ChannelState::Closed => SessionState::Listening,
        };
        state.send_replace(next);
    };

    let task = tokio::spawn(channel.run(shutdown_rx, on_state));
    *active = Some(ActiveChannel {
        id,
        shutdown: shutdown_tx,
        task,
    });
    Ok(())
}
