use std::net::SocketAddr;
use std::time::Duration;

/// How long an unauthenticated channel may stay open.
pub const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a consumer waits for any single response.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Upgrade request header carrying a token delivered out of band.
/// A matching value pre-authenticates the channel.
pub const TOKEN_HEADER: &str = "x-peerlink-token";

/// Provider-side session settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Loopback address to bind; port 0 picks an ephemeral port.
    pub bind_addr: SocketAddr,
    pub auth_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            auth_timeout: DEFAULT_AUTH_TIMEOUT,
        }
    }
}

/// Consumer-side session settings.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub call_timeout: Duration,
    /// Send the token in the upgrade header instead of an auth message.
    pub pre_authenticate: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            call_timeout: DEFAULT_CALL_TIMEOUT,
            pre_authenticate: false,
        }
    }
}
