//! Narrow interfaces to the platform.
//!
//! Consent UI, caller identity lookup, background-execution leases and
//! durable storage all live outside the protocol engine. Each is a small
//! trait so hosts can plug in the real thing and tests can plug in fakes.

use crate::error::StoreError;
use crate::peer::{PeerInfo, RegistryEntry};

/// Asks the user whether an unknown (or re-keyed) peer may open a session.
///
/// Invoked at most once per unapproved handshake.
pub trait ConsentHandler: Send + Sync {
    fn approve(&self, peer: &PeerInfo) -> bool;
}

impl<F> ConsentHandler for F
where
    F: Fn(&PeerInfo) -> bool + Send + Sync,
{
    fn approve(&self, peer: &PeerInfo) -> bool {
        self(peer)
    }
}

/// Platform facts about whoever delivered the current handshake.
pub trait IdentityResolver: Send + Sync {
    fn resolve_calling_identity(&self) -> Option<String>;

    /// True when another surface is drawn over ours (tapjacking).
    fn is_foreground_obscured(&self) -> bool;
}

/// Resolver for platforms with no caller lookup.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoIdentity;

impl IdentityResolver for NoIdentity {
    fn resolve_calling_identity(&self) -> Option<String> {
        None
    }

    fn is_foreground_obscured(&self) -> bool {
        false
    }
}

/// Keeps the host process alive while a session server is up.
pub trait LifecycleLease: Send + Sync {
    fn acquire(&self) -> bool;
    fn release(&self);
}

/// Lease for hosts that need none.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoLease;

impl LifecycleLease for NoLease {
    fn acquire(&self) -> bool {
        true
    }

    fn release(&self) {}
}

/// Durable key to entry persistence.
pub trait RegistryStore: Send + Sync {
    fn save(&self, entry: RegistryEntry) -> Result<(), StoreError>;
    fn get(&self, id: &str) -> Result<Option<RegistryEntry>, StoreError>;
    fn all(&self) -> Result<Vec<RegistryEntry>, StoreError>;
    fn remove(&self, id: &str) -> Result<(), StoreError>;
}
