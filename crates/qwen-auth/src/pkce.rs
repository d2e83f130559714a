//! PKCE (Proof Key for Code Exchange) per RFC 7636, plus the small random
//! identifiers the device flow needs
//!
//! The verifier is retained server-side for the lifetime of a pending device
//! flow and sent during token exchange; the S256 challenge goes out with the
//! device authorization request so the authorization server can verify the
//! exchange request came from the same party that initiated the flow.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::Rng;
use sha2::{Digest, Sha256};

const HEX_CHARS: &[u8] = b"0123456789abcdef";

/// Generate a cryptographically random PKCE code verifier.
///
/// 32 random bytes encoded as URL-safe base64 (no padding), 43 characters,
/// the minimum length RFC 7636 permits.
pub fn generate_verifier() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes[..]);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Compute the S256 code challenge from a verifier.
///
/// `challenge = BASE64URL(SHA256(verifier))`
pub fn compute_challenge(verifier: &str) -> String {
    let hash = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hash)
}

/// Generate a state id for a pending device flow: 32 random hex characters
/// (128 bits of entropy).
pub fn new_state_id() -> String {
    let mut rng = rand::rng();
    (0..32)
        .map(|_| HEX_CHARS[rng.random_range(0..HEX_CHARS.len())] as char)
        .collect()
}

/// Derive the stable handle for a token: the first 8 characters of its
/// refresh token. Collisions are a known limitation of the scheme.
pub fn token_id_for(refresh_token: &str) -> String {
    refresh_token.chars().take(8).collect()
}
