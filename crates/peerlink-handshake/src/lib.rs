//! Handshake layer for peerlink.
//!
//! A consumer wakes a provider by sending `wakeup` over an out-of-band,
//! address-based transport. The provider runs its consent gate, starts its
//! session server and answers `ready` with the endpoint. The consumer then
//! opens a session channel with the token it sent, and re-runs the
//! handshake under a [`RetryPolicy`] when the channel drops.

mod consumer;
mod pending;
mod provider;
mod retry;
mod transport;

pub use consumer::{ConsumerConfig, ConsumerOrchestrator, DEFAULT_HANDSHAKE_TIMEOUT, SessionHandle};
pub use provider::{
    MissingConsentPolicy, ProviderBuilder, ProviderConfig, ProviderOrchestrator, WakeupOutcome,
};
pub use retry::RetryPolicy;
pub use transport::{InMemoryRouter, OutOfBandTransport};
