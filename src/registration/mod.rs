//! Admin-gated self-registration: request, review, claim.
//!
//! State machine: `requested -> approved -> claimed`, or
//! `requested -> denied` (terminal). Approval produces nothing by itself;
//! the claim step is authorized by a single-use, time-boxed token that the
//! host delivers out of band. Claiming creates the account, its credential,
//! and its first batch of backup codes in one transaction.

pub(crate) mod repo;

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::backup_codes;
use crate::config::VaultConfig;
use crate::credentials::totp::{self, TotpProvisioning};
use crate::credentials::{AuthType, StoredCredential};
use crate::error::{Error, Result};
use crate::store::EncryptedStore;
use crate::tokens;
use crate::users::{repo as users_repo, validate_username, RecoveryContact, User};

/// Review state of an access request.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RequestStatus {
    Pending,
    Approved,
    Denied,
}

impl RequestStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Denied => "denied",
        }
    }

    #[must_use]
    pub fn from_str(value: &str) -> Option<Self> {
        match value.trim() {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "denied" => Some(Self::Denied),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct AccessRequest {
    pub id: Uuid,
    pub username: String,
    pub status: RequestStatus,
    pub requested_at: DateTime<Utc>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub reviewed_by: Option<Uuid>,
    pub deny_reason: Option<String>,
}

#[derive(Clone, Debug)]
pub struct PendingRegistration {
    pub id: Uuid,
    pub username: String,
    /// SHA-256 of the claim token; the raw token is never persisted.
    pub token_hash: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Credential choice made at claim time.
pub enum ClaimCredential {
    /// The server generates a fresh TOTP secret and returns the enrollment
    /// material in the claim outcome.
    Totp,
    /// A WebAuthn credential from a registration ceremony completed before
    /// the claim call.
    Webauthn(StoredCredential),
}

/// Everything the new account holder gets exactly once.
pub struct ClaimOutcome {
    pub user: User,
    pub totp: Option<TotpProvisioning>,
    pub backup_codes: Vec<String>,
}

pub struct RegistrationWorkflow {
    store: Arc<EncryptedStore>,
    claim_token_ttl_seconds: i64,
    totp_issuer: String,
}

impl RegistrationWorkflow {
    #[must_use]
    pub fn new(store: Arc<EncryptedStore>, config: &VaultConfig) -> Self {
        Self {
            store,
            claim_token_ttl_seconds: config.claim_token_ttl_seconds(),
            totp_issuer: config.totp_issuer().to_string(),
        }
    }

    /// File an access request for a username.
    ///
    /// # Errors
    /// [`Error::InvalidUsername`] on policy violations,
    /// [`Error::UsernameTaken`] when an account already exists, and
    /// [`Error::DuplicateRequest`] when an open request exists.
    pub fn request_access(&self, username: &str) -> Result<AccessRequest> {
        validate_username(username)?;
        let request = self.store.with_txn(|conn| {
            if users_repo::find_by_username(conn, username)?.is_some() {
                return Err(Error::UsernameTaken);
            }
            repo::insert_request(conn, username)
        })?;
        info!(username, request_id = %request.id, "access requested");
        Ok(request)
    }

    /// Access requests awaiting review, oldest first.
    ///
    /// # Errors
    /// Returns storage errors.
    pub fn pending_requests(&self) -> Result<Vec<AccessRequest>> {
        self.store.with_conn(repo::list_pending_requests)
    }

    /// Approve a pending request. Admin-only.
    ///
    /// # Errors
    /// [`Error::AdminRequired`], [`Error::RequestNotFound`], or
    /// [`Error::NotPending`] when the request was already reviewed.
    pub fn approve(&self, request_id: Uuid, admin: &User) -> Result<AccessRequest> {
        self.review(request_id, admin, RequestStatus::Approved, None)
    }

    /// Deny a pending request with an optional reason. Admin-only.
    ///
    /// # Errors
    /// As [`Self::approve`].
    pub fn deny(&self, request_id: Uuid, admin: &User, reason: Option<&str>) -> Result<AccessRequest> {
        self.review(request_id, admin, RequestStatus::Denied, reason)
    }

    fn review(
        &self,
        request_id: Uuid,
        admin: &User,
        verdict: RequestStatus,
        reason: Option<&str>,
    ) -> Result<AccessRequest> {
        if !admin.is_admin {
            return Err(Error::AdminRequired);
        }
        let request = self.store.with_txn(|conn| {
            let request =
                repo::find_request(conn, request_id)?.ok_or(Error::RequestNotFound)?;
            if request.status != RequestStatus::Pending {
                return Err(Error::NotPending);
            }
            // The guard in the UPDATE makes the transition atomic even under
            // a concurrent review of the same request.
            if !repo::transition_request(conn, request_id, verdict, admin.id, reason)? {
                return Err(Error::NotPending);
            }
            repo::find_request(conn, request_id)?.ok_or(Error::RequestNotFound)
        })?;
        info!(
            request_id = %request.id,
            username = %request.username,
            verdict = verdict.as_str(),
            reviewed_by = %admin.id,
            "access request reviewed"
        );
        Ok(request)
    }

    /// Mint the single-use claim token for an approved request. The raw
    /// token is the out-of-band artifact the host emails (or, in
    /// development, shows directly); it is returned exactly once.
    ///
    /// # Errors
    /// [`Error::RequestNotFound`] for unknown usernames and
    /// [`Error::NotApproved`] unless the request is in the approved state.
    pub fn start_claim(&self, username: &str) -> Result<String> {
        let raw_token = tokens::generate_link_token();
        let token_hash = tokens::hash_token(&raw_token);
        let expires_at = Utc::now() + Duration::seconds(self.claim_token_ttl_seconds);

        self.store.with_txn(|conn| {
            let request =
                repo::find_request_by_username(conn, username)?.ok_or(Error::RequestNotFound)?;
            if request.status != RequestStatus::Approved {
                return Err(Error::NotApproved);
            }
            repo::delete_expired_pending(conn)?;
            // A fresh token replaces any live one for the same username.
            repo::delete_pending_for_username(conn, username)?;
            repo::insert_pending(conn, username, &token_hash, expires_at)?;
            Ok(())
        })?;

        info!(username, "claim token issued");
        Ok(raw_token)
    }

    /// Claim an approved registration: create the account with the chosen
    /// credential, issue the first batch of backup codes, and consume the
    /// token. One transaction; a second claim with the same token fails
    /// `TokenNotFound`.
    ///
    /// # Errors
    /// [`Error::TokenNotFound`] / [`Error::TokenExpired`] for token
    /// problems, [`Error::UsernameTaken`] when the name was taken in the
    /// meantime, and [`Error::VerificationFailed`] when the supplied
    /// WebAuthn credential is not a WebAuthn credential.
    pub fn claim(
        &self,
        username: &str,
        claim_token: &str,
        credential: ClaimCredential,
        recovery_contact: Option<RecoveryContact>,
    ) -> Result<ClaimOutcome> {
        let token_hash = tokens::hash_token(claim_token.trim());

        let outcome = self.store.with_txn(|conn| {
            let pending =
                repo::find_pending_by_hash(conn, &token_hash)?.ok_or(Error::TokenNotFound)?;
            if pending.username != username {
                // A token only authorizes the username it was minted for.
                return Err(Error::TokenNotFound);
            }
            if pending.expires_at <= Utc::now() {
                repo::delete_pending(conn, pending.id)?;
                return Err(Error::TokenExpired);
            }

            let (auth_type, stored, totp_material) = match credential {
                ClaimCredential::Totp => {
                    let secret = totp::generate_secret();
                    let material = totp::provisioning(&secret, &self.totp_issuer, username)?;
                    (
                        AuthType::Totp,
                        StoredCredential::Totp { secret },
                        Some(material),
                    )
                }
                ClaimCredential::Webauthn(stored) => {
                    if stored.auth_type() == AuthType::Totp {
                        warn!(username, "claim supplied a TOTP blob as a WebAuthn credential");
                        return Err(Error::VerificationFailed);
                    }
                    (stored.auth_type(), stored, None)
                }
            };

            let blob = stored.to_blob()?;
            let user = users_repo::create(
                conn,
                &users_repo::NewUser {
                    username,
                    auth_type,
                    credential: Some(&blob),
                    recovery_contact: recovery_contact.as_ref(),
                },
            )?;
            let codes = backup_codes::issue_codes(conn, user.id, backup_codes::DEFAULT_BATCH_SIZE)?;
            repo::delete_pending(conn, pending.id)?;

            Ok(ClaimOutcome {
                user,
                totp: totp_material,
                backup_codes: codes,
            })
        })?;

        info!(username, user_id = %outcome.user.id, "account claimed");
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_status_round_trips_through_storage_text() {
        for status in [
            RequestStatus::Pending,
            RequestStatus::Approved,
            RequestStatus::Denied,
        ] {
            assert_eq!(RequestStatus::from_str(status.as_str()), Some(status));
        }
        assert_eq!(RequestStatus::from_str("rejected"), None);
    }
}
