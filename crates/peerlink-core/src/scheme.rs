//! Routing addresses for out-of-band delivery.
//!
//! A peer is addressed by the URL scheme it registered with the platform
//! (e.g. `tool` for links of the form `tool://...`). Schemes follow the
//! RFC 3986 grammar: `ALPHA *( ALPHA / DIGIT / "+" / "-" / "." )`.
//! Schemes compare case-insensitively, so they are stored lowercase.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The routing address of a peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerScheme(String);

impl PeerScheme {
    /// Parse and normalize a scheme.
    pub fn new(raw: impl AsRef<str>) -> Result<Self, SchemeParseError> {
        raw.as_ref().parse()
    }

    /// The normalized scheme string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Build a link addressed to this scheme, e.g. `tool://wakeup`.
    pub fn link(&self, action: &str) -> String {
        format!("{}://{}", self.0, action)
    }
}

impl fmt::Display for PeerScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for PeerScheme {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for PeerScheme {
    type Err = SchemeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Tolerate a full link prefix like "tool://".
        let s = s.strip_suffix("://").unwrap_or(s);

        let mut chars = s.chars();
        let first = chars.next().ok_or(SchemeParseError::Empty)?;
        if !first.is_ascii_alphabetic() {
            return Err(SchemeParseError::InvalidStart(s.to_string()));
        }
        if let Some(bad) = chars.find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.')))
        {
            return Err(SchemeParseError::InvalidChar {
                scheme: s.to_string(),
                ch: bad,
            });
        }

        Ok(Self(s.to_ascii_lowercase()))
    }
}

impl TryFrom<String> for PeerScheme {
    type Error = SchemeParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl TryFrom<&str> for PeerScheme {
    type Error = SchemeParseError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<PeerScheme> for String {
    fn from(scheme: PeerScheme) -> Self {
        scheme.0
    }
}

/// Error parsing a peer scheme.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemeParseError {
    #[error("scheme cannot be empty")]
    Empty,
    #[error("scheme must start with a letter, got: {0}")]
    InvalidStart(String),
    #[error("scheme {scheme:?} contains invalid character {ch:?}")]
    InvalidChar { scheme: String, ch: char },
}
