//! Core types and traits for peerlink.
//!
//! This crate provides the protocol primitives shared by both roles: the
//! handshake and session wire types, the error taxonomy, the capability
//! registry with its dispatcher and schema validator, and the traits
//! through which the platform is consulted.

pub mod collab;
mod dispatch;
pub mod error;
pub mod jsonrpc;
mod message;
mod peer;
mod registry;
pub mod schema;
mod scheme;
mod store;
pub mod token;

pub use collab::{ConsentHandler, IdentityResolver, LifecycleLease, NoIdentity, NoLease, RegistryStore};
pub use dispatch::{Dispatcher, LIST_CAPABILITIES_METHOD};
pub use error::{BridgeError, StoreError};
pub use jsonrpc::{Request, RequestId, Response, RpcError};
pub use message::{ControlMessage, Envelope, HandshakeMessage, Ready, Register, Registered, Wakeup};
pub use peer::{PeerInfo, RegistryEntry, unix_now};
pub use registry::{CapabilityDefinition, CapabilityHandler, CapabilityRegistry, FnHandler};
pub use schema::{InputSchema, SchemaViolation};
pub use scheme::{PeerScheme, SchemeParseError};
pub use store::MemoryRegistryStore;

/// Lifecycle of a session server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Not bound.
    Idle,
    /// Bound, no channel.
    Listening,
    /// A channel is connected but has not proven the token yet.
    Authenticating,
    /// A channel is authenticated and serving requests.
    Active,
}

/// Lifecycle of one session channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Authenticating,
    Authenticated,
    /// Terminal.
    Closed,
}
