//! Consumer side of a session channel.

use futures_util::{SinkExt, StreamExt};
use peerlink_core::token::generate_request_id;
use peerlink_core::{
    BridgeError, CapabilityDefinition, ControlMessage, LIST_CAPABILITIES_METHOD, Request,
    RequestId, Response, RpcError,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

use crate::config::{ClientOptions, TOKEN_HEADER};

/// How a session ended, as seen by the consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    /// WebSocket close code, when the provider sent one.
    pub code: Option<u16>,
    pub reason: String,
}

impl CloseInfo {
    /// The provider closed us for a policy violation (bad or missing auth).
    pub fn is_policy_violation(&self) -> bool {
        self.code == Some(u16::from(CloseCode::Policy))
    }
}

type Reply = Result<Response, BridgeError>;

#[derive(Default)]
struct PendingCalls {
    calls: HashMap<RequestId, oneshot::Sender<Reply>>,
    /// Why the session ended, once it has.
    closed: Option<BridgeError>,
}

impl PendingCalls {
    /// Resolve every outstanding call with `error` and refuse new ones.
    fn fail_all(&mut self, error: BridgeError) {
        for (_, tx) in self.calls.drain() {
            let _ = tx.send(Err(error.clone()));
        }
        self.closed.get_or_insert(error);
    }

    /// The error for a call attempted after close. A rejected session stays
    /// a security failure; anything else is a plain transport failure.
    fn closed_error(&self) -> Option<BridgeError> {
        self.closed.as_ref().map(|e| match e {
            BridgeError::Security(_) => e.clone(),
            _ => BridgeError::transport("session closed"),
        })
    }
}

fn session_lost(reason: &str) -> BridgeError {
    RpcError::internal(format!("session closed: {reason}")).into()
}

/// An authenticated connection to a provider's session server.
pub struct SessionClient {
    endpoint: String,
    options: ClientOptions,
    outbound: mpsc::UnboundedSender<Message>,
    pending: Arc<Mutex<PendingCalls>>,
    closed: watch::Receiver<Option<CloseInfo>>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl SessionClient {
    /// Connect to `endpoint` and authenticate with `token`.
    pub async fn connect(
        endpoint: &str,
        token: &str,
        options: ClientOptions,
    ) -> Result<Self, BridgeError> {
        let mut request = endpoint
            .into_client_request()
            .map_err(BridgeError::transport)?;
        if options.pre_authenticate {
            let value = HeaderValue::from_str(token).map_err(BridgeError::protocol)?;
            request.headers_mut().insert(TOKEN_HEADER, value);
        }

        let (ws, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(BridgeError::transport)?;
        let (mut sink, mut stream) = ws.split();

        if !options.pre_authenticate {
            let auth = serde_json::to_string(&ControlMessage::Auth {
                token: token.to_string(),
            })
            .map_err(BridgeError::protocol)?;
            sink.send(Message::Text(auth.into()))
                .await
                .map_err(BridgeError::transport)?;
        }

        let pending = Arc::new(Mutex::new(PendingCalls::default()));
        let (closed_tx, closed) = watch::channel(None);
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

        let writer = tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                let is_close = matches!(msg, Message::Close(_));
                if let Err(e) = sink.send(msg).await {
                    tracing::debug!(error = %e, "session write failed");
                    break;
                }
                if is_close {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let reader_pending = pending.clone();
        let reader = tokio::spawn(async move {
            let info = loop {
                let msg = match stream.next().await {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        break CloseInfo {
                            code: None,
                            reason: e.to_string(),
                        };
                    }
                    None => {
                        break CloseInfo {
                            code: None,
                            reason: "connection closed".to_string(),
                        };
                    }
                };
                match msg {
                    Message::Text(text) => route_response(&reader_pending, text.as_str()),
                    Message::Close(frame) => {
                        break match frame {
                            Some(f) => CloseInfo {
                                code: Some(u16::from(f.code)),
                                reason: f.reason.as_str().to_owned(),
                            },
                            None => CloseInfo {
                                code: None,
                                reason: "closed by provider".to_string(),
                            },
                        };
                    }
                    _ => {}
                }
            };

            let error = if info.is_policy_violation() {
                tracing::warn!(reason = %info.reason, "provider rejected the session");
                BridgeError::security(format!("provider rejected the session: {}", info.reason))
            } else {
                tracing::debug!(reason = %info.reason, "session ended");
                session_lost(&info.reason)
            };
            lock(&reader_pending).fail_all(error);
            let _ = closed_tx.send(Some(info));
        });

        tracing::debug!(%endpoint, "session connected");
        Ok(Self {
            endpoint: endpoint.to_string(),
            options,
            outbound,
            pending,
            closed,
            reader,
            writer,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.pending).closed.is_some()
    }

    /// Wait until the session ends and report why.
    pub async fn wait_closed(&self) -> CloseInfo {
        let mut closed = self.closed.clone();
        let info = match closed.wait_for(|info| info.is_some()).await {
            Ok(info) => info.clone(),
            Err(_) => None,
        };
        info.unwrap_or_else(|| CloseInfo {
            code: None,
            reason: "session reader gone".to_string(),
        })
    }

    /// Invoke `method` and wait for its response, bounded by the call timeout.
    ///
    /// Calls still pending when the session drops fail with an internal
    /// error, or with a security error if the provider rejected the token.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, BridgeError> {
        let id = RequestId::new(generate_request_id());
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = lock(&self.pending);
            if let Some(error) = pending.closed_error() {
                return Err(error);
            }
            pending.calls.insert(id.clone(), tx);
        }

        let request = Request::new(id.clone(), method, params);
        let text = serde_json::to_string(&request).map_err(BridgeError::protocol)?;
        if self.outbound.send(Message::Text(text.into())).is_err() {
            lock(&self.pending).calls.remove(&id);
            return Err(BridgeError::transport("session writer gone"));
        }

        match tokio::time::timeout(self.options.call_timeout, rx).await {
            Ok(Ok(Ok(response))) => response.into_result().map_err(BridgeError::Rpc),
            Ok(Ok(Err(error))) => Err(error),
            Ok(Err(_)) => Err(BridgeError::transport("session closed")),
            Err(_) => {
                lock(&self.pending).calls.remove(&id);
                Err(BridgeError::CallTimeout {
                    method: method.to_string(),
                    timeout_ms: self.options.call_timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Fetch the provider's capability definitions.
    pub async fn list_capabilities(&self) -> Result<Vec<CapabilityDefinition>, BridgeError> {
        let value = self
            .call(LIST_CAPABILITIES_METHOD, Value::Object(Default::default()))
            .await?;
        serde_json::from_value(value).map_err(BridgeError::protocol)
    }

    /// Fail outstanding calls, then close the socket.
    pub async fn close(&self) {
        lock(&self.pending).fail_all(session_lost("closed by consumer"));
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: "bye".to_string().into(),
        };
        let _ = self.outbound.send(Message::Close(Some(frame)));
    }
}

impl Drop for SessionClient {
    fn drop(&mut self) {
        lock(&self.pending).fail_all(session_lost("client dropped"));
        self.reader.abort();
        self.writer.abort();
    }
}

fn route_response(pending: &Mutex<PendingCalls>, text: &str) {
    let response: Response = match serde_json::from_str(text) {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!(error = %e, "malformed response frame");
            // Fail the call it names, if the id is readable.
            let waiting = response_id(text).and_then(|id| lock(pending).calls.remove(&id));
            if let Some(tx) = waiting {
                let _ = tx.send(Err(BridgeError::protocol(e)));
            }
            return;
        }
    };
    match lock(pending).calls.remove(&response.id) {
        Some(tx) => {
            let _ = tx.send(Ok(response));
        }
        None => tracing::debug!(id = %response.id, "response for unknown request"),
    }
}

fn response_id(text: &str) -> Option<RequestId> {
    let mut value: Value = serde_json::from_str(text).ok()?;
    serde_json::from_value(value.get_mut("id")?.take()).ok()
}

fn lock(pending: &Mutex<PendingCalls>) -> std::sync::MutexGuard<'_, PendingCalls> {
    // A panic while holding this lock cannot leave the map inconsistent.
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
