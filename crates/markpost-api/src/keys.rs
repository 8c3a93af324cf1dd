//! Random opaque identifiers, all URL-safe base64 without padding.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;

fn encode(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Per-user write credential (64 bits).
pub fn post_key() -> String {
    encode(&rand::random::<[u8; 8]>())
}

/// Public post identifier (128 bits).
pub fn post_id() -> String {
    encode(&rand::random::<[u8; 16]>())
}

/// OAuth CSRF state (160 bits).
pub fn oauth_state() -> String {
    encode(&rand::random::<[u8; 20]>())
}
