//! Error taxonomy shared by every peerlink crate.

use crate::jsonrpc::RpcError;

/// Errors surfaced by the handshake and session layers.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BridgeError {
    /// A wire message could not be parsed.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The peer answered with an error object.
    #[error(transparent)]
    Rpc(#[from] RpcError),

    /// The socket or out-of-band channel failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// Authentication failed or a transport policy was violated.
    #[error("security violation: {0}")]
    Security(String),

    #[error("handshake with {scheme} timed out after {timeout_ms}ms")]
    HandshakeTimeout { scheme: String, timeout_ms: u64 },

    #[error("call to {method} timed out after {timeout_ms}ms")]
    CallTimeout { method: String, timeout_ms: u64 },

    #[error("capability {0:?} is already registered")]
    DuplicateCapability(String),

    #[error("invalid input schema for {name:?}: {reason}")]
    InvalidSchema { name: String, reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("orchestrator disposed")]
    Disposed,

    /// The consumer closed this session handle.
    #[error("session closed by the consumer")]
    Closed,
}

/// Stable code for errors that never reached the wire.
pub const TRANSPORT_ERROR_CODE: i64 = -32000;
pub const SECURITY_ERROR_CODE: i64 = -32001;
pub const TIMEOUT_ERROR_CODE: i64 = -32002;

impl BridgeError {
    pub fn protocol(detail: impl std::fmt::Display) -> Self {
        Self::Protocol(detail.to_string())
    }

    pub fn transport(detail: impl std::fmt::Display) -> Self {
        Self::Transport(detail.to_string())
    }

    pub fn security(detail: impl std::fmt::Display) -> Self {
        Self::Security(detail.to_string())
    }

    /// Connection-class failures: the ones worth re-running the handshake for.
    ///
    /// Application errors returned by a capability (method not found,
    /// invalid params, positive application codes) are excluded, as are
    /// security failures.
    pub fn is_connection_class(&self) -> bool {
        match self {
            Self::Transport(_)
            | Self::HandshakeTimeout { .. }
            | Self::CallTimeout { .. } => true,
            Self::Rpc(e) => e.code == RpcError::INTERNAL_ERROR,
            _ => false,
        }
    }

    /// The stable integer code reported for this error.
    pub fn code(&self) -> i64 {
        match self {
            Self::Protocol(_) => RpcError::PARSE_ERROR,
            Self::Rpc(e) => e.code,
            Self::Transport(_) | Self::Disposed | Self::Closed => TRANSPORT_ERROR_CODE,
            Self::Security(_) => SECURITY_ERROR_CODE,
            Self::HandshakeTimeout { .. } | Self::CallTimeout { .. } => TIMEOUT_ERROR_CODE,
            Self::DuplicateCapability(_) | Self::InvalidSchema { .. } => RpcError::INVALID_REQUEST,
            Self::Store(_) => RpcError::INTERNAL_ERROR,
        }
    }

    /// Convert to a wire error without leaking internal detail.
    pub fn to_rpc_error(&self) -> RpcError {
        match self {
            Self::Rpc(e) => e.clone(),
            other => RpcError::new(other.code(), other.to_string()),
        }
    }
}

/// Failure of a registry store backend.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("registry store io: {0}")]
    Io(String),
    #[error("registry store is corrupt: {0}")]
    Corrupt(String),
}

pub type Result<T, E = BridgeError> = std::result::Result<T, E>;
