//! Session layer for peerlink.
//!
//! After the out-of-band handshake, the consumer connects to the
//! provider's loopback WebSocket endpoint, proves the session token and
//! then exchanges JSON-RPC requests and responses, one per text frame.

mod channel;
mod client;
mod config;
mod server;

pub use channel::{CloseReason, SessionChannel};
pub use client::{CloseInfo, SessionClient};
pub use config::{ClientOptions, DEFAULT_AUTH_TIMEOUT, DEFAULT_CALL_TIMEOUT, SessionConfig, TOKEN_HEADER};
pub use server::SessionServer;
