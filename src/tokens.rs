//! Token generation and hashing shared by sessions, claim links, and
//! recovery links.
//!
//! Raw tokens exist only in memory and in the one response delivered to the
//! holder; the database stores SHA-256 digests. Lookups therefore compare
//! fixed-length digests, which removes any length or prefix structure an
//! attacker could try to time.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use sha2::{Digest, Sha256};

const SESSION_TOKEN_BYTES: usize = 32;
const LINK_TOKEN_LEN: usize = 32;

/// Generate a session bearer token: 256 bits of CSPRNG output, URL-safe.
pub(crate) fn generate_session_token() -> String {
    let mut bytes = [0u8; SESSION_TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Generate a 32-character mixed-case alphanumeric token for claim and
/// recovery links.
pub(crate) fn generate_link_token() -> String {
    (&mut OsRng)
        .sample_iter(Alphanumeric)
        .take(LINK_TOKEN_LEN)
        .map(char::from)
        .collect()
}

/// Digest used for at-rest token storage; raw values never touch the database.
pub(crate) fn hash_token(token: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hasher.finalize().to_vec()
}
