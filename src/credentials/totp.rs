//! TOTP secrets, provisioning, and verification (RFC 6238).
//!
//! Secrets are 160 random bits as RFC 4226 recommends; codes are six digits
//! over 30-second steps, accepted within one step of drift either way.

use rand::rngs::OsRng;
use rand::RngCore;
use totp_rs::{Algorithm, TOTP};
use tracing::debug;

use crate::error::{Error, Result};

pub const SECRET_LEN: usize = 20;
pub const DIGITS: usize = 6;
pub const STEP_SECONDS: u64 = 30;
/// Accepted clock drift in steps on either side of now.
pub const SKEW_STEPS: u8 = 1;

/// One-time enrollment material handed to the account holder.
#[derive(Clone, Debug)]
pub struct TotpProvisioning {
    pub secret_base32: String,
    pub otpauth_url: String,
}

/// Generate a fresh 160-bit shared secret.
#[must_use]
pub fn generate_secret() -> Vec<u8> {
    let mut secret = vec![0u8; SECRET_LEN];
    OsRng.fill_bytes(&mut secret);
    secret
}

/// Build enrollment material for an authenticator app.
///
/// # Errors
/// Returns [`Error::InvalidUsername`] when the account name cannot be
/// encoded into an `otpauth://` URI (the URI label forbids a colon).
pub fn provisioning(secret: &[u8], issuer: &str, username: &str) -> Result<TotpProvisioning> {
    let totp = TOTP::new(
        Algorithm::SHA1,
        DIGITS,
        SKEW_STEPS,
        STEP_SECONDS,
        secret.to_vec(),
        Some(issuer.to_string()),
        username.to_string(),
    )
    .map_err(|err| {
        debug!("cannot build otpauth URI: {err}");
        Error::InvalidUsername("cannot be encoded into a provisioning URI")
    })?;

    Ok(TotpProvisioning {
        secret_base32: totp.get_secret_base32(),
        otpauth_url: totp.get_url(),
    })
}

/// Normalize user input: strip spaces and dashes, require exactly six ASCII
/// digits. Anything else is rejected before the HMAC runs.
#[must_use]
pub fn normalize_code(input: &str) -> Option<String> {
    let cleaned: String = input
        .chars()
        .filter(|c| !matches!(c, ' ' | '-'))
        .collect();
    (cleaned.len() == DIGITS && cleaned.bytes().all(|b| b.is_ascii_digit())).then_some(cleaned)
}

/// Verify a code against the current time step.
#[must_use]
pub fn verify(secret: &[u8], code: &str) -> bool {
    verify_at(secret, code, unix_now())
}

/// Verify a code at an explicit Unix timestamp; drift of up to
/// [`SKEW_STEPS`] steps on either side is accepted.
#[must_use]
pub fn verify_at(secret: &[u8], code: &str, timestamp: u64) -> bool {
    let Some(code) = normalize_code(code) else {
        return false;
    };
    let Ok(totp) = build(secret) else {
        return false;
    };
    totp.check(&code, timestamp)
}

/// The expected code for an explicit Unix timestamp. Used by enrollment
/// confirmation flows and tests.
///
/// # Errors
/// Returns [`Error::VerificationFailed`] when the secret is unusable.
pub fn code_at(secret: &[u8], timestamp: u64) -> Result<String> {
    let totp = build(secret)?;
    Ok(totp.generate(timestamp))
}

fn build(secret: &[u8]) -> Result<TOTP> {
    // Issuer and account label are irrelevant for the HMAC check itself.
    TOTP::new(
        Algorithm::SHA1,
        DIGITS,
        SKEW_STEPS,
        STEP_SECONDS,
        secret.to_vec(),
        None,
        "account".to_string(),
    )
    .map_err(|err| {
        debug!("cannot build TOTP context: {err}");
        Error::VerificationFailed
    })
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const T: u64 = 1_700_000_000;

    #[test]
    fn secret_is_160_bits() {
        assert_eq!(generate_secret().len(), 20);
        assert_ne!(generate_secret(), generate_secret());
    }

    #[test]
    fn normalization_strips_separators_and_requires_six_digits() {
        assert_eq!(normalize_code("123 456").as_deref(), Some("123456"));
        assert_eq!(normalize_code("123-456").as_deref(), Some("123456"));
        assert_eq!(normalize_code(" 12 34 56 ").as_deref(), Some("123456"));
        assert!(normalize_code("12345").is_none());
        assert!(normalize_code("1234567").is_none());
        assert!(normalize_code("12345a").is_none());
    }

    #[test]
    fn code_is_accepted_within_the_drift_window() {
        let secret = generate_secret();
        let code = code_at(&secret, T).unwrap();

        assert!(verify_at(&secret, &code, T));
        assert!(verify_at(&secret, &code, T - STEP_SECONDS));
        assert!(verify_at(&secret, &code, T + STEP_SECONDS));
        assert!(!verify_at(&secret, &code, T + 2 * STEP_SECONDS));
        assert!(!verify_at(&secret, &code, T - 2 * STEP_SECONDS));
    }

    #[test]
    fn wrong_code_is_rejected() {
        let secret = generate_secret();
        let code = code_at(&secret, T).unwrap();
        let wrong = if code == "000000" { "000001" } else { "000000" };
        assert!(!verify_at(&secret, wrong, T));
    }

    #[test]
    fn provisioning_exposes_base32_and_otpauth_uri() {
        let secret = generate_secret();
        let material = provisioning(&secret, "Shelfguard", "alice123").unwrap();
        assert!(material.otpauth_url.starts_with("otpauth://totp/"));
        assert!(material.otpauth_url.contains("Shelfguard"));
        assert!(!material.secret_base32.is_empty());
    }
}
