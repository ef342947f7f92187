//! Daemon configuration, loaded from TOML.
//!
//! Every field has a default, so an empty file (or no file at all) is a
//! valid configuration.

use anyhow::Context;
use peerlink_core::PeerScheme;
use peerlink_handshake::{ConsumerConfig, MissingConsentPolicy, ProviderConfig, RetryPolicy};
use peerlink_session::SessionConfig;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub provider: ProviderSection,
    pub session: SessionSection,
    pub consumer: ConsumerSection,
    pub retry: RetrySection,
    pub store: StoreSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProviderSection {
    pub scheme: String,
    pub display_name: String,
    pub trust_allowlist: Vec<String>,
    pub missing_consent: MissingConsentPolicy,
}

impl Default for ProviderSection {
    fn default() -> Self {
        Self {
            scheme: "peerlink".to_string(),
            display_name: "peerlink".to_string(),
            trust_allowlist: Vec::new(),
            missing_consent: MissingConsentPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    pub bind: SocketAddr,
    pub auth_timeout_ms: u64,
}

impl Default for SessionSection {
    fn default() -> Self {
        let defaults = SessionConfig::default();
        Self {
            bind: defaults.bind_addr,
            auth_timeout_ms: defaults.auth_timeout.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsumerSection {
    pub handshake_timeout_ms: u64,
    pub call_timeout_ms: u64,
    pub pre_authenticate: bool,
}

impl Default for ConsumerSection {
    fn default() -> Self {
        let defaults = ConsumerConfig::default();
        Self {
            handshake_timeout_ms: defaults.handshake_timeout.as_millis() as u64,
            call_timeout_ms: defaults.call_timeout.as_millis() as u64,
            pre_authenticate: defaults.pre_authenticate,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        let defaults = RetryPolicy::default();
        Self {
            max_retries: defaults.max_retries,
            base_delay_ms: defaults.base_delay.as_millis() as u64,
            max_delay_ms: defaults.max_delay.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    /// JSON file holding paired peers.
    pub path: PathBuf,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            path: PathBuf::from("peerlink-registry.json"),
        }
    }
}

impl Config {
    /// Load from `path`, or use defaults when no path is given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn parse(text: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn provider_scheme(&self) -> anyhow::Result<PeerScheme> {
        PeerScheme::new(&self.provider.scheme)
            .with_context(|| format!("invalid provider scheme {:?}", self.provider.scheme))
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            bind_addr: self.session.bind,
            auth_timeout: Duration::from_millis(self.session.auth_timeout_ms),
        }
    }

    pub fn provider_config(&self) -> ProviderConfig {
        ProviderConfig {
            session: self.session_config(),
            trust_allowlist: self.provider.trust_allowlist.clone(),
            missing_consent: self.provider.missing_consent,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.retry.max_retries,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
        }
    }

    pub fn consumer_config(&self) -> ConsumerConfig {
        ConsumerConfig {
            handshake_timeout: Duration::from_millis(self.consumer.handshake_timeout_ms),
            call_timeout: Duration::from_millis(self.consumer.call_timeout_ms),
            retry: self.retry_policy(),
            pre_authenticate: self.consumer.pre_authenticate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.provider_scheme().unwrap().as_str(), "peerlink");
        assert_eq!(config.provider.missing_consent, MissingConsentPolicy::Allow);
        assert_eq!(config.session_config().auth_timeout, Duration::from_secs(5));
        assert_eq!(config.session.bind.ip().to_string(), "127.0.0.1");
        assert_eq!(config.consumer_config().handshake_timeout, Duration::from_secs(10));
        assert_eq!(config.consumer_config().call_timeout, Duration::from_secs(30));
        assert_eq!(config.retry_policy(), RetryPolicy::default());
    }

    #[test]
    fn sections_override_defaults() {
        let config = Config::parse(
            r#"
            [provider]
            scheme = "Tool"
            display_name = "Tool"
            trust_allowlist = ["com.example.host"]
            missing_consent = "deny"

            [session]
            auth_timeout_ms = 250

            [retry]
            max_retries = 1

            [store]
            path = "/var/lib/peerlink/registry.json"
            "#,
        )
        .unwrap();

        assert_eq!(config.provider_scheme().unwrap().as_str(), "tool");
        let provider = config.provider_config();
        assert_eq!(provider.missing_consent, MissingConsentPolicy::Deny);
        assert_eq!(provider.trust_allowlist, vec!["com.example.host".to_string()]);
        assert_eq!(provider.session.auth_timeout, Duration::from_millis(250));
        assert_eq!(config.retry_policy().max_retries, 1);
        assert_eq!(config.retry_policy().base_delay, Duration::from_millis(500));
        assert_eq!(config.store.path, PathBuf::from("/var/lib/peerlink/registry.json"));
    }

    #[test]
    fn invalid_scheme_is_rejected() {
        let config = Config::parse("[provider]\nscheme = \"9lives\"").unwrap();
        assert!(config.provider_scheme().is_err());
    }
}
