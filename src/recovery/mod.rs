//! Contact-less account recovery.
//!
//! Two paths arrive at the same place: a backup code presented with the
//! username, or a single-use magic-link token minted by
//! [`RecoveryWorkflow::request_recovery`]. Success rotates the credential
//! (fresh TOTP secret, or a cleared slot pending WebAuthn re-enrollment),
//! reissues the full batch of backup codes, and deletes every session for
//! the account, all in one transaction.

pub(crate) mod repo;

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;
use tracing::{info, warn};
use uuid::Uuid;

use crate::backup_codes;
use crate::config::VaultConfig;
use crate::credentials::totp::{self, TotpProvisioning};
use crate::credentials::{AuthType, StoredCredential};
use crate::error::{Error, Result};
use crate::sessions::repo as sessions_repo;
use crate::store::EncryptedStore;
use crate::tokens;
use crate::users::{repo as users_repo, User};

#[derive(Clone, Debug)]
pub struct PendingRecovery {
    pub id: Uuid,
    pub user_id: Uuid,
    /// SHA-256 of the magic-link token; the raw token is never persisted.
    pub token_hash: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
}

/// One-time material returned to the recovered account holder.
pub struct RecoveryOutcome {
    pub user: User,
    /// Fresh enrollment material for TOTP accounts.
    pub totp: Option<TotpProvisioning>,
    /// `true` when the account held a WebAuthn credential: the old one is
    /// gone and a new registration ceremony must follow.
    pub webauthn_reenroll: bool,
    pub backup_codes: Vec<String>,
    pub sessions_revoked: usize,
}

pub struct RecoveryWorkflow {
    store: Arc<EncryptedStore>,
    recovery_token_ttl_seconds: i64,
    totp_issuer: String,
}

impl RecoveryWorkflow {
    #[must_use]
    pub fn new(store: Arc<EncryptedStore>, config: &VaultConfig) -> Self {
        Self {
            store,
            recovery_token_ttl_seconds: config.recovery_token_ttl_seconds(),
            totp_issuer: config.totp_issuer().to_string(),
        }
    }

    /// Recover with a backup code.
    ///
    /// # Errors
    /// Fails uniformly with [`Error::InvalidUsernameOrCode`] for unknown
    /// usernames and for invalid or already-used codes, so the endpoint
    /// cannot be used to enumerate accounts.
    pub fn recover(&self, username: &str, backup_code: &str) -> Result<RecoveryOutcome> {
        let outcome = self.store.with_txn(|conn| {
            let Some(user) = users_repo::find_by_username(conn, username)? else {
                warn!(username, "recovery attempt for unknown user");
                return Err(Error::InvalidUsernameOrCode);
            };
            if !backup_codes::consume_code(conn, user.id, backup_code)? {
                return Err(Error::InvalidUsernameOrCode);
            }
            self.rotate_credential(conn, user)
        })?;

        info!(username, user_id = %outcome.user.id, "account recovered with backup code");
        Ok(outcome)
    }

    /// Mint a single-use magic-link token for the user. The raw token is
    /// returned exactly once; the host delivers it out of band.
    ///
    /// # Errors
    /// [`Error::UserNotFound`] when the account does not exist.
    pub fn request_recovery(&self, user_id: Uuid) -> Result<String> {
        let raw_token = tokens::generate_link_token();
        let token_hash = tokens::hash_token(&raw_token);
        let expires_at = Utc::now() + Duration::seconds(self.recovery_token_ttl_seconds);

        self.store.with_txn(|conn| {
            if users_repo::find_by_id(conn, user_id)?.is_none() {
                return Err(Error::UserNotFound);
            }
            repo::delete_expired(conn)?;
            repo::insert(conn, user_id, &token_hash, expires_at)?;
            Ok(())
        })?;

        info!(%user_id, "recovery token issued");
        Ok(raw_token)
    }

    /// Complete a magic-link recovery. Marks the token used and proceeds
    /// exactly as the backup-code path.
    ///
    /// # Errors
    /// [`Error::TokenNotFound`] / [`Error::TokenExpired`] /
    /// [`Error::TokenAlreadyUsed`] for token problems.
    pub fn complete_recovery(&self, raw_token: &str) -> Result<RecoveryOutcome> {
        let token_hash = tokens::hash_token(raw_token.trim());

        let outcome = self.store.with_txn(|conn| {
            let pending = repo::find_by_hash(conn, &token_hash)?.ok_or(Error::TokenNotFound)?;
            if pending.used_at.is_some() {
                return Err(Error::TokenAlreadyUsed);
            }
            if pending.expires_at <= Utc::now() {
                return Err(Error::TokenExpired);
            }
            // The used_at guard makes consumption single-shot under races.
            if !repo::mark_used(conn, pending.id)? {
                return Err(Error::TokenAlreadyUsed);
            }
            let user =
                users_repo::find_by_id(conn, pending.user_id)?.ok_or(Error::UserNotFound)?;
            self.rotate_credential(conn, user)
        })?;

        info!(user_id = %outcome.user.id, "account recovered with magic link");
        Ok(outcome)
    }

    /// Invalidate the old credential, reissue backup codes, and drop all
    /// sessions. Runs inside the caller's transaction.
    fn rotate_credential(&self, conn: &Connection, mut user: User) -> Result<RecoveryOutcome> {
        let (totp_material, webauthn_reenroll) = match user.auth_type {
            AuthType::Totp => {
                let secret = totp::generate_secret();
                let material = totp::provisioning(&secret, &self.totp_issuer, &user.username)?;
                let blob = StoredCredential::Totp { secret }.to_blob()?;
                users_repo::update_credential(conn, user.id, AuthType::Totp, Some(&blob))?;
                user.auth_credential = Some(blob);
                (Some(material), false)
            }
            AuthType::Passkey | AuthType::Fido2 => {
                // The old public key is invalidated outright; the account is
                // credential-less until a fresh ceremony installs a new one.
                users_repo::update_credential(conn, user.id, user.auth_type, None)?;
                user.auth_credential = None;
                (None, true)
            }
        };

        let codes = backup_codes::issue_codes(conn, user.id, backup_codes::DEFAULT_BATCH_SIZE)?;
        let sessions_revoked = sessions_repo::delete_for_user(conn, user.id)?;

        Ok(RecoveryOutcome {
            user,
            totp: totp_material,
            webauthn_reenroll,
            backup_codes: codes,
            sessions_revoked,
        })
    }
}
