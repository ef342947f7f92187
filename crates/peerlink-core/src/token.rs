//! Session tokens and request correlation ids.

use base64::Engine as _;
use rand::RngCore as _;
use subtle::ConstantTimeEq as _;

const TOKEN_BYTES: usize = 32;

/// Mint an unguessable session token (256 bits, URL-safe base64).
pub fn generate_session_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// A fresh correlation id for an outgoing request.
pub fn generate_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Compare two tokens without leaking the position of the first mismatch.
pub fn tokens_match(expected: &str, presented: &str) -> bool {
    expected.len() == presented.len()
        && bool::from(expected.as_bytes().ct_eq(presented.as_bytes()))
}
