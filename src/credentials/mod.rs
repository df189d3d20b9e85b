//! Polymorphic credential storage and verification.
//!
//! An account holds exactly one credential: a TOTP secret, a platform
//! passkey, or a roaming FIDO2 security key. The credential is serialized
//! into the `users.auth_credential` blob; the blob's confidentiality comes
//! from the SQLCipher layer underneath, not from a second cipher here.

pub mod totp;
pub mod webauthn;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;
use webauthn_rs::prelude::{
    CreationChallengeResponse, Passkey, PublicKeyCredential, RegisterPublicKeyCredential,
    RequestChallengeResponse, SecurityKey,
};
use webauthn_rs_proto::AuthenticatorTransport;

use crate::config::VaultConfig;
use crate::credentials::totp::TotpProvisioning;
use crate::credentials::webauthn::{Attachment, WebauthnCeremonies};
use crate::error::{Error, Result, StoreError};
use crate::store::EncryptedStore;
use crate::users::{repo as users_repo, User};

/// Authenticator type attached to a user, as persisted in `users.auth_type`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    Totp,
    Passkey,
    Fido2,
}

impl AuthType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Totp => "totp",
            Self::Passkey => "passkey",
            Self::Fido2 => "fido2",
        }
    }

    #[must_use]
    pub fn from_str(value: &str) -> Option<Self> {
        match value.trim() {
            "totp" => Some(Self::Totp),
            "passkey" => Some(Self::Passkey),
            "fido2" => Some(Self::Fido2),
            _ => None,
        }
    }
}

/// A verified WebAuthn credential plus the bookkeeping the assertion check
/// needs: the sign counter and the transports announced at registration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WebauthnRecord<K> {
    pub key: K,
    pub sign_count: u32,
    #[serde(default)]
    pub transports: Vec<AuthenticatorTransport>,
    pub created_at: DateTime<Utc>,
}

impl<K> WebauthnRecord<K> {
    pub(crate) fn new(key: K, transports: Vec<AuthenticatorTransport>) -> Self {
        Self {
            key,
            sign_count: 0,
            transports,
            created_at: Utc::now(),
        }
    }
}

/// The credential blob attached to a user row.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoredCredential {
    Totp { secret: Vec<u8> },
    Passkey(WebauthnRecord<Passkey>),
    Fido2(WebauthnRecord<SecurityKey>),
}

impl StoredCredential {
    #[must_use]
    pub fn auth_type(&self) -> AuthType {
        match self {
            Self::Totp { .. } => AuthType::Totp,
            Self::Passkey(_) => AuthType::Passkey,
            Self::Fido2(_) => AuthType::Fido2,
        }
    }

    /// Raw credential id for WebAuthn credentials, `None` for TOTP.
    #[must_use]
    pub fn credential_id(&self) -> Option<Vec<u8>> {
        match self {
            Self::Totp { .. } => None,
            Self::Passkey(record) => Some(record.key.cred_id().as_slice().to_vec()),
            Self::Fido2(record) => Some(record.key.cred_id().as_slice().to_vec()),
        }
    }

    pub(crate) fn to_blob(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(StoreError::from)
            .map_err(Error::from)
    }

    pub(crate) fn from_blob(blob: &[u8]) -> Result<Self> {
        serde_json::from_slice(blob)
            .map_err(StoreError::from)
            .map_err(Error::from)
    }
}

/// Verifies proof-of-possession for every credential type and owns the
/// WebAuthn ceremony state.
pub struct CredentialVault {
    store: Arc<EncryptedStore>,
    ceremonies: WebauthnCeremonies,
    totp_issuer: String,
}

impl CredentialVault {
    /// # Errors
    /// Returns [`Error::InvalidConfig`] when the relying-party origin or id
    /// cannot be used to build a WebAuthn context.
    pub fn new(store: Arc<EncryptedStore>, config: &VaultConfig) -> Result<Self> {
        Ok(Self {
            store,
            ceremonies: WebauthnCeremonies::new(config)?,
            totp_issuer: config.totp_issuer().to_string(),
        })
    }

    /// Verify a TOTP code for the named account.
    ///
    /// Returns `Ok(false)` uniformly for "unknown user", "no TOTP
    /// credential", and "wrong code", so callers cannot probe for accounts.
    ///
    /// # Errors
    /// Returns storage errors only.
    pub fn verify_totp(&self, username: &str, code: &str) -> Result<bool> {
        let Some(user) = self
            .store
            .with_conn(|conn| users_repo::find_by_username(conn, username))?
        else {
            return Ok(false);
        };
        let Some(StoredCredential::Totp { secret }) = user.credential()? else {
            return Ok(false);
        };
        let accepted = totp::verify(&secret, code);
        if !accepted {
            warn!(username, "rejected TOTP code");
        }
        Ok(accepted)
    }

    /// Enrollment material (base32 secret + `otpauth://` URI) for a TOTP
    /// account, or `None` when the account holds another credential type.
    ///
    /// # Errors
    /// Returns storage errors, or [`Error::InvalidUsername`] when the
    /// username cannot be encoded into a provisioning URI.
    pub fn totp_provisioning(&self, user: &User) -> Result<Option<TotpProvisioning>> {
        match user.credential()? {
            Some(StoredCredential::Totp { secret }) => {
                totp::provisioning(&secret, &self.totp_issuer, &user.username).map(Some)
            }
            _ => Ok(None),
        }
    }

    /// Attach a credential to an account, replacing whatever it held. Used
    /// after a WebAuthn re-enrollment that follows account recovery.
    ///
    /// # Errors
    /// [`Error::UserNotFound`] when the account does not exist.
    pub fn install_credential(&self, user_id: Uuid, credential: &StoredCredential) -> Result<()> {
        let blob = credential.to_blob()?;
        self.store.with_txn(|conn| {
            if !users_repo::update_credential(conn, user_id, credential.auth_type(), Some(&blob))? {
                return Err(Error::UserNotFound);
            }
            info!(%user_id, auth_type = credential.auth_type().as_str(), "installed credential");
            Ok(())
        })
    }

    /// Start a WebAuthn registration ceremony. The account may not exist yet
    /// (self-registration); when it does, its current credential id is
    /// excluded from re-registration.
    ///
    /// Returns the browser options and the challenge key the caller must
    /// echo back to [`Self::complete_webauthn_registration`].
    ///
    /// # Errors
    /// Returns storage errors or [`Error::VerificationFailed`] when the
    /// ceremony cannot be built.
    pub fn begin_webauthn_registration(
        &self,
        username: &str,
        attachment: Attachment,
    ) -> Result<(CreationChallengeResponse, String)> {
        let mut exclude = Vec::new();
        if let Some(user) = self
            .store
            .with_conn(|conn| users_repo::find_by_username(conn, username))?
        {
            if let Some(credential) = user.credential()? {
                if let Some(id) = credential.credential_id() {
                    exclude.push(id.into());
                }
            }
        }
        self.ceremonies
            .begin_registration(username, attachment, exclude)
    }

    /// Finish a WebAuthn registration ceremony and return the credential to
    /// persist (via an account claim or [`Self::install_credential`]).
    ///
    /// The challenge is consumed whether or not verification succeeds.
    ///
    /// # Errors
    /// [`Error::ChallengeNotFound`] / [`Error::ChallengeExpired`] /
    /// [`Error::WrongChallengeType`] for challenge-state problems,
    /// [`Error::VerificationFailed`] when the attestation does not verify.
    pub fn complete_webauthn_registration(
        &self,
        response: &RegisterPublicKeyCredential,
        expected_challenge: &str,
    ) -> Result<StoredCredential> {
        self.ceremonies
            .complete_registration(response, expected_challenge)
    }

    /// Start a WebAuthn authentication ceremony for the named account.
    ///
    /// # Errors
    /// Fails uniformly with [`Error::VerificationFailed`] for unknown users
    /// and accounts without a WebAuthn credential.
    pub fn begin_webauthn_authentication(
        &self,
        username: &str,
    ) -> Result<(RequestChallengeResponse, String)> {
        let Some(user) = self
            .store
            .with_conn(|conn| users_repo::find_by_username(conn, username))?
        else {
            warn!(username, "authentication attempt for unknown user");
            return Err(Error::VerificationFailed);
        };
        let Some(credential) = user.credential()? else {
            return Err(Error::VerificationFailed);
        };
        self.ceremonies
            .begin_authentication(user.id, &user.username, &credential)
    }

    /// Finish a WebAuthn authentication ceremony. On success the updated
    /// sign counter is persisted and returned alongside the account.
    ///
    /// # Errors
    /// Challenge-state errors as in registration;
    /// [`Error::VerificationFailed`] when the assertion or the sign-counter
    /// monotonicity check fails.
    pub fn complete_webauthn_authentication(
        &self,
        response: &PublicKeyCredential,
        expected_challenge: &str,
    ) -> Result<(User, u32)> {
        let entry = self.ceremonies.take_authentication(expected_challenge)?;
        let user_id = entry.user_id.ok_or(Error::WrongChallengeType)?;

        self.store.with_txn(|conn| {
            let Some(mut user) = users_repo::find_by_id(conn, user_id)? else {
                // Account deleted while the ceremony was in flight.
                return Err(Error::VerificationFailed);
            };
            if user.username != entry.username {
                // The ceremony stays bound to the username it was started for.
                return Err(Error::VerificationFailed);
            }
            let Some(mut credential) = user.credential()? else {
                return Err(Error::VerificationFailed);
            };

            let sign_count =
                self.ceremonies
                    .verify_assertion(entry.state, response, &mut credential)?;

            let blob = credential.to_blob()?;
            users_repo::update_credential(conn, user_id, credential.auth_type(), Some(&blob))?;
            user.auth_credential = Some(blob);
            Ok((user, sign_count))
        })
    }

    /// Drop expired ceremony state. Also runs lazily on every ceremony
    /// start; exposed for hosts that want scheduled cleanup.
    pub fn purge_expired_challenges(&self) -> usize {
        self.ceremonies.purge_expired()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn auth_type_round_trips_through_storage_text() {
        for auth_type in [AuthType::Totp, AuthType::Passkey, AuthType::Fido2] {
            assert_eq!(AuthType::from_str(auth_type.as_str()), Some(auth_type));
        }
        assert_eq!(AuthType::from_str("password"), None);
    }

    #[test]
    fn totp_credential_blob_round_trips() {
        let credential = StoredCredential::Totp {
            secret: vec![7u8; 20],
        };
        let blob = credential.to_blob().unwrap();
        let parsed = StoredCredential::from_blob(&blob).unwrap();
        assert_eq!(parsed.auth_type(), AuthType::Totp);
        assert!(parsed.credential_id().is_none());
        match parsed {
            StoredCredential::Totp { secret } => assert_eq!(secret, vec![7u8; 20]),
            _ => panic!("expected TOTP credential"),
        }
    }

    #[test]
    fn garbage_blob_is_a_storage_error() {
        let err = StoredCredential::from_blob(b"not-json").unwrap_err();
        assert!(matches!(err, Error::Store(StoreError::Data(_))));
    }
}
