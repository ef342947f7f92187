//! Out-of-band transport over newline-delimited JSON.
//!
//! Each line is one [`Envelope`]. The host process relays lines between
//! peers (a launcher, a pipe pair, a platform shim); nothing here is
//! trusted as verified.

use async_trait::async_trait;
use peerlink_core::{BridgeError, Envelope, HandshakeMessage, PeerScheme};
use peerlink_handshake::OutOfBandTransport;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, mpsc};

/// Writes outbound envelopes as JSON lines.
pub struct LineTransport<W> {
    out: Mutex<W>,
}

impl<W> LineTransport<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }
}

#[async_trait]
impl<W> OutOfBandTransport for LineTransport<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn send(&self, to: &PeerScheme, message: HandshakeMessage) -> Result<(), BridgeError> {
        let mut line = serde_json::to_string(&Envelope::new(to.clone(), message))
            .map_err(BridgeError::protocol)?;
        line.push('\n');

        let mut out = self.out.lock().await;
        out.write_all(line.as_bytes())
            .await
            .map_err(BridgeError::transport)?;
        out.flush().await.map_err(BridgeError::transport)
    }
}

/// Parse envelopes from `input` until EOF. Malformed lines are logged and
/// skipped.
pub fn read_envelopes<R>(input: R) -> mpsc::UnboundedReceiver<Envelope>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut lines = input.lines();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "out-of-band input failed");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Envelope>(&line) {
                Ok(envelope) => {
                    if tx.send(envelope).is_err() {
                        break;
                    }
                }
                Err(e) => tracing::warn!(error = %e, "skipping malformed envelope"),
            }
        }
        tracing::debug!("out-of-band input closed");
    });
    rx
}
