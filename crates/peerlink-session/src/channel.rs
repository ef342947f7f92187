//! Provider side of one session channel.

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use peerlink_core::token::tokens_match;
use peerlink_core::{ChannelState, ControlMessage, Dispatcher, Response};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{RwLock, oneshot};
use tokio::task::JoinSet;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

/// Why a channel ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The consumer hung up.
    PeerClosed,
    /// A newer connection took over, or the server stopped.
    Superseded,
    /// No auth message within the deadline.
    AuthTimeout,
    /// Wrong token, or something other than an auth message came first.
    AuthRejected,
    Transport(String),
}

type Sink<S> = SplitSink<WebSocketStream<S>, Message>;

/// One message-framed duplex channel: auth sub-protocol, then request pump.
pub struct SessionChannel<S> {
    id: u64,
    ws: WebSocketStream<S>,
    pre_authenticated: bool,
    expected_token: Arc<RwLock<String>>,
    dispatcher: Dispatcher,
    auth_timeout: Duration,
}

impl<S> SessionChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Wrap an upgraded socket. A pre-authenticated channel skips the auth
    /// sub-protocol.
    pub fn new(
        id: u64,
        ws: WebSocketStream<S>,
        pre_authenticated: bool,
        expected_token: Arc<RwLock<String>>,
        dispatcher: Dispatcher,
        auth_timeout: Duration,
    ) -> Self {
        Self {
            id,
            ws,
            pre_authenticated,
            expected_token,
            dispatcher,
            auth_timeout,
        }
    }

    /// Drive the channel until it closes. `shutdown` force-closes it;
    /// `on_state` observes every transition, from `Connecting` to the final
    /// `Closed`.
    pub async fn run<F>(self, mut shutdown: oneshot::Receiver<()>, on_state: F) -> CloseReason
    where
        F: Fn(ChannelState) + Send,
    {
        let Self {
            id,
            ws,
            pre_authenticated,
            expected_token,
            dispatcher,
            auth_timeout,
        } = self;
        on_state(ChannelState::Connecting);
        let (mut sink, mut stream) = ws.split();
        let mut inflight: JoinSet<Response> = JoinSet::new();

        let mut state = if pre_authenticated {
            ChannelState::Authenticated
        } else {
            ChannelState::Authenticating
        };
        let auth_deadline = tokio::time::sleep(auth_timeout);
        tokio::pin!(auth_deadline);
        on_state(state);

        let reason = loop {
            tokio::select! {
                _ = &mut shutdown => {
                    close(&mut sink, CloseCode::Normal, "superseded").await;
                    break CloseReason::Superseded;
                }

                _ = &mut auth_deadline, if state == ChannelState::Authenticating => {
                    tracing::warn!(channel = id, "no auth message before deadline");
                    close(&mut sink, CloseCode::Policy, "authentication timeout").await;
                    break CloseReason::AuthTimeout;
                }

                Some(joined) = inflight.join_next(), if !inflight.is_empty() => {
                    let response = match joined {
                        Ok(r) => r,
                        Err(e) => {
                            tracing::warn!(channel = id, error = %e, "dispatch task failed");
                            continue;
                        }
                    };
                    if let Err(e) = send_json(&mut sink, &response).await {
                        break CloseReason::Transport(e);
                    }
                }

                msg = stream.next() => {
                    let msg = match msg {
                        Some(Ok(msg)) => msg,
                        Some(Err(e)) => {
                            tracing::debug!(channel = id, error = %e, "websocket error");
                            break CloseReason::Transport(e.to_string());
                        }
                        None => break CloseReason::PeerClosed,
                    };

                    let text = match msg {
                        Message::Text(text) => text.as_str().to_owned(),
                        Message::Binary(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                        Message::Close(_) => break CloseReason::PeerClosed,
                        _ => continue,
                    };

                    if state == ChannelState::Authenticating {
                        if authenticate(&expected_token, &text).await {
                            tracing::info!(channel = id, "channel authenticated");
                            state = ChannelState::Authenticated;
                            on_state(state);
                            continue;
                        }
                        tracing::warn!(channel = id, "rejected channel before authentication");
                        close(&mut sink, CloseCode::Policy, "authentication failed").await;
                        break CloseReason::AuthRejected;
                    }

                    let dispatcher = dispatcher.clone();
                    inflight.spawn(async move { dispatcher.handle_text(&text).await });
                }
            }
        };

        inflight.abort_all();
        on_state(ChannelState::Closed);
        tracing::debug!(channel = id, ?reason, "channel closed");
        reason
    }
}

/// The first frame must be `{"type":"auth","token":...}` carrying the
/// in-force token. Anything else fails.
async fn authenticate(expected_token: &RwLock<String>, text: &str) -> bool {
    let Ok(ControlMessage::Auth { token }) = serde_json::from_str::<ControlMessage>(text) else {
        return false;
    };
    let expected = expected_token.read().await;
    tokens_match(&expected, &token)
}

async fn send_json<S>(sink: &mut Sink<S>, response: &Response) -> Result<(), String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let text = serde_json::to_string(response).map_err(|e| e.to_string())?;
    sink.send(Message::Text(text.into()))
        .await
        .map_err(|e| e.to_string())
}

async fn close<S>(sink: &mut Sink<S>, code: CloseCode, reason: &str)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let frame = CloseFrame {
        code,
        reason: reason.to_string().into(),
    };
    if let Err(e) = sink.send(Message::Close(Some(frame))).await {
        tracing::debug!(error = %e, "failed to send close frame");
    }
    let _ = sink.close().await;
}
