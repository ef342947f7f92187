//! Protocol messages.
//!
//! Two families: the out-of-band handshake messages delivered by address
//! (`wakeup`/`ready`, `register`/`registered`), and the control message
//! that opens an unauthenticated session channel.

use crate::PeerScheme;
use serde::{Deserialize, Serialize};

/// Asks a provider to start its session server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Wakeup {
    pub session_token: String,
    pub reply_scheme: PeerScheme,
    pub display_name: String,
}

/// The provider's answer to a [`Wakeup`]: where to connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ready {
    pub endpoint: String,
    pub provider_scheme: PeerScheme,
}

/// Asks a provider for its capability list and a pairing token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Register {
    pub reply_scheme: PeerScheme,
    pub display_name: String,
}

/// The provider's answer to a [`Register`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registered {
    pub provider_scheme: PeerScheme,
    pub display_name: String,
    pub token: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// Messages carried by the out-of-band channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HandshakeMessage {
    Wakeup(Wakeup),
    Ready(Ready),
    Register(Register),
    Registered(Registered),
}

impl HandshakeMessage {
    /// The link action name, e.g. `wakeup`.
    pub fn action(&self) -> &'static str {
        match self {
            Self::Wakeup(_) => "wakeup",
            Self::Ready(_) => "ready",
            Self::Register(_) => "register",
            Self::Registered(_) => "registered",
        }
    }

    /// Scheme of the peer that sent this message.
    pub fn sender(&self) -> &PeerScheme {
        match self {
            Self::Wakeup(m) => &m.reply_scheme,
            Self::Ready(m) => &m.provider_scheme,
            Self::Register(m) => &m.reply_scheme,
            Self::Registered(m) => &m.provider_scheme,
        }
    }
}

/// An addressed out-of-band message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub to: PeerScheme,
    pub message: HandshakeMessage,
    /// Set by the delivering platform when the channel itself proves the
    /// sender's identity. Never trusted from the sender.
    #[serde(skip)]
    pub verified: bool,
}

impl Envelope {
    pub fn new(to: PeerScheme, message: HandshakeMessage) -> Self {
        Self {
            to,
            message,
            verified: false,
        }
    }
}

/// Control messages on a session channel before RPC traffic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Must be the first message on a channel that was not pre-authenticated.
    Auth { token: String },
}
