//! End-to-end flows over a real encrypted store: registration, login
//! sessions, backup codes, and recovery.

use std::sync::Arc;

use anyhow::{Context, Result};
use shelfguard::credentials::totp;
use shelfguard::{
    ClaimCredential, EncryptedStore, Error, IdentityCore, KeyManager, RecoveryContact,
    StoredCredential, StoreError, VaultConfig,
};

struct TestContext {
    // Holds the store directory alive for the test's duration.
    _dir: tempfile::TempDir,
    core: IdentityCore,
}

impl TestContext {
    fn new() -> Result<Self> {
        Self::with_config(VaultConfig::new())
    }

    fn with_config(config: VaultConfig) -> Result<Self> {
        let dir = tempfile::tempdir().context("failed to create temp dir")?;
        let config = config
            .with_key_path(dir.path().join("master.key"))
            .with_db_path(dir.path().join("identity.db"))
            .with_relying_party("media.example", "https://media.example");
        let core = IdentityCore::open(&config)?;
        Ok(Self { _dir: dir, core })
    }

    /// Drive the full registration workflow for a TOTP account and return
    /// the claim outcome (user, provisioning material, backup codes).
    fn register_totp_user(&self, username: &str) -> Result<shelfguard::ClaimOutcome> {
        let admin = self.bootstrap_admin()?;
        let request = self.core.registration.request_access(username)?;
        self.core.registration.approve(request.id, &admin)?;
        let token = self.core.registration.start_claim(username)?;
        let outcome = self
            .core
            .registration
            .claim(username, &token, ClaimCredential::Totp, None)?;
        Ok(outcome)
    }

    /// First account of a fresh install, created through the admin path.
    fn bootstrap_admin(&self) -> Result<shelfguard::User> {
        if let Some(existing) = self.core.users.find_by_username("admin001")? {
            return Ok(existing);
        }
        let credential = StoredCredential::Totp {
            secret: totp::generate_secret(),
        };
        let admin = self.core.users.create("admin001", &credential, true)?;
        Ok(admin)
    }
}

#[test]
fn totp_user_end_to_end() -> Result<()> {
    let ctx = TestContext::new()?;
    let outcome = ctx.register_totp_user("alice123")?;

    let material = outcome.totp.context("TOTP claim returns provisioning")?;
    assert!(material.otpauth_url.starts_with("otpauth://totp/"));

    // A code for the current step verifies; an almost-certainly-wrong
    // code does not.
    let user = ctx
        .core
        .users
        .find_by_username("alice123")?
        .context("claimed user exists")?;
    let provisioned = ctx
        .core
        .credentials
        .totp_provisioning(&user)?
        .context("account holds a TOTP secret")?;
    assert_eq!(provisioned.secret_base32, material.secret_base32);

    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)?
        .as_secs();
    let secret = base32_decode(&material.secret_base32)?;
    let code = totp::code_at(&secret, now)?;
    assert!(ctx.core.credentials.verify_totp("alice123", &code)?);
    assert!(!ctx.core.credentials.verify_totp("alice123", "000000")?
        || code == "000000");

    // Unknown users answer exactly like wrong codes.
    assert!(!ctx.core.credentials.verify_totp("nobody99", &code)?);
    Ok(())
}

#[test]
fn backup_codes_are_single_use() -> Result<()> {
    let ctx = TestContext::new()?;
    let outcome = ctx.register_totp_user("alice123")?;
    let user_id = outcome.user.id;

    assert_eq!(outcome.backup_codes.len(), 8);
    assert_eq!(ctx.core.backup_codes.remaining_count(user_id)?, 8);

    let code = &outcome.backup_codes[0];
    assert!(ctx.core.backup_codes.verify_and_consume(user_id, code)?);
    assert_eq!(ctx.core.backup_codes.remaining_count(user_id)?, 7);

    // Second use of the same code fails and leaves the count alone.
    assert!(!ctx.core.backup_codes.verify_and_consume(user_id, code)?);
    assert_eq!(ctx.core.backup_codes.remaining_count(user_id)?, 7);

    // Codes are accepted case-insensitively and without separators.
    let relaxed = outcome.backup_codes[1].to_lowercase().replace('-', "");
    assert!(ctx.core.backup_codes.verify_and_consume(user_id, &relaxed)?);
    Ok(())
}

#[test]
fn second_session_displaces_the_first() -> Result<()> {
    let ctx = TestContext::new()?;
    let outcome = ctx.register_totp_user("alice123")?;
    let user_id = outcome.user.id;

    let (_, first_token) = ctx
        .core
        .sessions
        .create(user_id, Some("tv-app/1.0"), Some("10.0.0.7"))?;
    assert!(ctx.core.sessions.lookup(&first_token)?.is_some());

    let (second, second_token) = ctx.core.sessions.create(user_id, None, None)?;
    assert!(ctx.core.sessions.lookup(&first_token)?.is_none());
    let found = ctx
        .core
        .sessions
        .lookup(&second_token)?
        .context("second session resolves")?;
    assert_eq!(found.id, second.id);
    assert_eq!(found.user_id, user_id);

    // Logout drops everything for the user.
    assert_eq!(ctx.core.sessions.invalidate_all(user_id)?, 1);
    assert!(ctx.core.sessions.lookup(&second_token)?.is_none());
    Ok(())
}

#[test]
fn session_lookup_is_uniform_for_bad_input() -> Result<()> {
    let ctx = TestContext::new()?;
    let outcome = ctx.register_totp_user("alice123")?;
    ctx.core.sessions.create(outcome.user.id, None, None)?;

    assert!(ctx.core.sessions.lookup("")?.is_none());
    assert!(ctx.core.sessions.lookup("short")?.is_none());
    assert!(ctx
        .core
        .sessions
        .lookup(&"A".repeat(512))?
        .is_none());
    Ok(())
}

#[test]
fn expired_sessions_are_invisible_and_swept() -> Result<()> {
    // A negative TTL backdates expiry, standing in for the passage of time.
    let ctx = TestContext::with_config(VaultConfig::new().with_session_ttl_seconds(-1))?;
    let outcome = ctx.register_totp_user("alice123")?;

    let (_, token) = ctx.core.sessions.create(outcome.user.id, None, None)?;
    assert!(ctx.core.sessions.lookup(&token)?.is_none());
    assert_eq!(ctx.core.sessions.cleanup_stale()?, 1);
    assert_eq!(ctx.core.sessions.cleanup_stale()?, 0);
    Ok(())
}

#[test]
fn registration_state_machine_and_claim_are_single_shot() -> Result<()> {
    let ctx = TestContext::new()?;
    let admin = ctx.bootstrap_admin()?;

    let request = ctx.core.registration.request_access("newuser1")?;
    assert_eq!(request.status, shelfguard::RequestStatus::Pending);
    let pending = ctx.core.registration.pending_requests()?;
    assert!(pending.iter().any(|r| r.id == request.id));

    // A duplicate request and a taken username are both rejected up front.
    assert!(matches!(
        ctx.core.registration.request_access("newuser1"),
        Err(Error::DuplicateRequest)
    ));
    assert!(matches!(
        ctx.core.registration.request_access("admin001"),
        Err(Error::UsernameTaken)
    ));

    // Claiming before approval is impossible.
    assert!(matches!(
        ctx.core.registration.start_claim("newuser1"),
        Err(Error::NotApproved)
    ));

    let approved = ctx.core.registration.approve(request.id, &admin)?;
    assert_eq!(approved.status, shelfguard::RequestStatus::Approved);
    assert_eq!(approved.reviewed_by, Some(admin.id));

    // Review is terminal.
    assert!(matches!(
        ctx.core.registration.deny(request.id, &admin, Some("late")),
        Err(Error::NotPending)
    ));

    let token = ctx.core.registration.start_claim("newuser1")?;
    let contact = RecoveryContact::email("new.user@example.com")?;
    let outcome = ctx.core.registration.claim(
        "newuser1",
        &token,
        ClaimCredential::Totp,
        Some(contact),
    )?;
    assert_eq!(outcome.backup_codes.len(), 8);
    assert!(outcome.user.recovery_enabled);
    assert_eq!(
        outcome.user.recovery_email.as_deref(),
        Some("new.user@example.com")
    );

    // The claim token died with the claim.
    assert!(matches!(
        ctx.core
            .registration
            .claim("newuser1", &token, ClaimCredential::Totp, None),
        Err(Error::TokenNotFound)
    ));
    Ok(())
}

#[test]
fn non_admins_cannot_review_requests() -> Result<()> {
    let ctx = TestContext::new()?;
    let outcome = ctx.register_totp_user("alice123")?;

    let request = ctx.core.registration.request_access("newuser1")?;
    assert!(matches!(
        ctx.core.registration.approve(request.id, &outcome.user),
        Err(Error::AdminRequired)
    ));
    Ok(())
}

#[test]
fn expired_claim_token_is_rejected() -> Result<()> {
    let ctx = TestContext::with_config(VaultConfig::new().with_claim_token_ttl_seconds(-1))?;
    let admin = ctx.bootstrap_admin()?;

    let request = ctx.core.registration.request_access("newuser1")?;
    ctx.core.registration.approve(request.id, &admin)?;
    let token = ctx.core.registration.start_claim("newuser1")?;

    assert!(matches!(
        ctx.core
            .registration
            .claim("newuser1", &token, ClaimCredential::Totp, None),
        Err(Error::TokenExpired)
    ));
    Ok(())
}

#[test]
fn backup_code_recovery_rotates_everything() -> Result<()> {
    let ctx = TestContext::new()?;
    let outcome = ctx.register_totp_user("alice123")?;
    let user_id = outcome.user.id;
    let old_secret = outcome
        .totp
        .as_ref()
        .map(|m| m.secret_base32.clone())
        .context("TOTP material present")?;

    let (_, session_token) = ctx.core.sessions.create(user_id, None, None)?;

    let recovered = ctx
        .core
        .recovery
        .recover("alice123", &outcome.backup_codes[0])?;
    let fresh = recovered.totp.context("TOTP accounts get a new secret")?;
    assert_ne!(fresh.secret_base32, old_secret);
    assert!(!recovered.webauthn_reenroll);
    assert_eq!(recovered.backup_codes.len(), 8);
    assert_eq!(recovered.sessions_revoked, 1);
    assert!(ctx.core.sessions.lookup(&session_token)?.is_none());

    // The consumed code is gone; the old batch was replaced wholesale.
    assert!(matches!(
        ctx.core.recovery.recover("alice123", &outcome.backup_codes[0]),
        Err(Error::InvalidUsernameOrCode)
    ));
    assert!(matches!(
        ctx.core.recovery.recover("alice123", &outcome.backup_codes[1]),
        Err(Error::InvalidUsernameOrCode)
    ));
    assert_eq!(ctx.core.backup_codes.remaining_count(user_id)?, 8);

    // Unknown users get the same answer as bad codes.
    assert!(matches!(
        ctx.core.recovery.recover("nobody99", &recovered.backup_codes[0]),
        Err(Error::InvalidUsernameOrCode)
    ));
    Ok(())
}

#[test]
fn magic_link_recovery_is_single_use() -> Result<()> {
    let ctx = TestContext::new()?;
    let outcome = ctx.register_totp_user("alice123")?;

    let token = ctx.core.recovery.request_recovery(outcome.user.id)?;
    let recovered = ctx.core.recovery.complete_recovery(&token)?;
    assert!(recovered.totp.is_some());

    assert!(matches!(
        ctx.core.recovery.complete_recovery(&token),
        Err(Error::TokenAlreadyUsed)
    ));
    assert!(matches!(
        ctx.core.recovery.complete_recovery("no-such-token"),
        Err(Error::TokenNotFound)
    ));
    Ok(())
}

#[test]
fn expired_recovery_token_is_rejected() -> Result<()> {
    let ctx = TestContext::with_config(VaultConfig::new().with_recovery_token_ttl_seconds(-1))?;
    let outcome = ctx.register_totp_user("alice123")?;

    let token = ctx.core.recovery.request_recovery(outcome.user.id)?;
    assert!(matches!(
        ctx.core.recovery.complete_recovery(&token),
        Err(Error::TokenExpired)
    ));
    Ok(())
}

#[test]
fn deleting_a_user_cascades_to_dependents() -> Result<()> {
    let ctx = TestContext::new()?;
    let outcome = ctx.register_totp_user("alice123")?;
    let user_id = outcome.user.id;

    let (_, token) = ctx.core.sessions.create(user_id, None, None)?;
    ctx.core.recovery.request_recovery(user_id)?;

    ctx.core.users.delete(user_id)?;
    assert!(ctx.core.users.get(user_id)?.is_none());
    assert!(ctx.core.sessions.lookup(&token)?.is_none());
    assert_eq!(ctx.core.backup_codes.remaining_count(user_id)?, 0);
    Ok(())
}

#[test]
fn wrong_key_cannot_decrypt_an_existing_store() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let db_path = dir.path().join("identity.db");

    let key = KeyManager::load_or_generate(&dir.path().join("k1.key"), false)?;
    drop(EncryptedStore::open(&db_path, key)?);

    let other_key = KeyManager::load_or_generate(&dir.path().join("k2.key"), false)?;
    let err = EncryptedStore::open(&db_path, other_key)
        .err()
        .context("expected decrypt failure")?;
    assert!(matches!(err, StoreError::CannotDecrypt));

    // The right key still works.
    let key = KeyManager::load_or_generate(&dir.path().join("k1.key"), false)?;
    drop(EncryptedStore::open(&db_path, key)?);
    Ok(())
}

/// RFC 4648 base32 decoding for the provisioning secret, so the test can
/// derive codes the same way an authenticator app would.
fn base32_decode(encoded: &str) -> Result<Vec<u8>> {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";
    let mut bits: u32 = 0;
    let mut bit_count = 0;
    let mut out = Vec::new();
    for c in encoded.trim_end_matches('=').bytes() {
        let value = ALPHABET
            .iter()
            .position(|a| *a == c.to_ascii_uppercase())
            .context("invalid base32 character")?;
        bits = (bits << 5) | u32::try_from(value)?;
        bit_count += 5;
        if bit_count >= 8 {
            bit_count -= 8;
            out.push(u8::try_from((bits >> bit_count) & 0xFF)?);
        }
    }
    Ok(out)
}
