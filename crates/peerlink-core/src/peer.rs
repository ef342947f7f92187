//! What a provider knows about a peer, transient and persisted.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::PeerScheme;

/// The consent context for one inbound handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub peer_scheme: PeerScheme,
    pub display_name: String,
    /// Only present while the handshake is in flight.
    #[serde(default, skip_serializing)]
    pub session_token: Option<String>,
    /// Platform-verified identity of the caller, if the platform knows it.
    pub calling_identity: Option<String>,
    pub identity_verified: bool,
    /// Delivered over a channel the OS binds to the caller's identity.
    pub via_verified_channel: bool,
    /// Display name previously stored for this scheme, when it differs from
    /// the one presented now. A possible impersonation attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_display_name: Option<String>,
}

impl PeerInfo {
    pub fn new(peer_scheme: PeerScheme, display_name: impl Into<String>) -> Self {
        Self {
            peer_scheme,
            display_name: display_name.into(),
            session_token: None,
            calling_identity: None,
            identity_verified: false,
            via_verified_channel: false,
            previous_display_name: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.session_token = Some(token.into());
        self
    }

    pub fn impersonation_suspected(&self) -> bool {
        self.previous_display_name.is_some()
    }
}

/// A previously paired peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryEntry {
    /// The peer's scheme.
    pub id: PeerScheme,
    pub display_name: String,
    /// Current pairing secret; the sole authority for auto-approval.
    pub token: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Unix seconds of the first pairing.
    pub created_at: u64,
}

impl RegistryEntry {
    pub fn new(id: PeerScheme, display_name: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            id,
            display_name: display_name.into(),
            token: token.into(),
            capabilities: Vec::new(),
            created_at: unix_now(),
        }
    }

    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Carry `created_at` over from the entry this one replaces.
    pub fn superseding(mut self, previous: Option<&RegistryEntry>) -> Self {
        if let Some(prev) = previous {
            self.created_at = prev.created_at;
        }
        self
    }
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_is_not_serialized_with_peer_info() {
        let info = PeerInfo::new(PeerScheme::new("host").unwrap(), "Host").with_token("secret");
        let v = serde_json::to_value(&info).unwrap();
        assert!(v.get("sessionToken").is_none());
        assert_eq!(v["peerScheme"], "host");
        assert!(!info.impersonation_suspected());
    }

    #[test]
    fn superseding_keeps_creation_time() {
        let scheme = PeerScheme::new("host").unwrap();
        let mut old = RegistryEntry::new(scheme.clone(), "Host", "t1");
        old.created_at = 100;
        let new = RegistryEntry::new(scheme, "Host", "t2").superseding(Some(&old));
        assert_eq!(new.created_at, 100);
        assert_eq!(new.token, "t2");
    }
}
