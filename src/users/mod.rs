//! User accounts and the account-name policy.
//!
//! Username validation lives in exactly one place, [`validate_username`];
//! both the registration workflow and admin-facing tooling go through it.

pub(crate) mod repo;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use regex::Regex;
use tracing::info;
use uuid::Uuid;

use crate::credentials::{AuthType, StoredCredential};
use crate::error::{Error, Result};
use crate::store::EncryptedStore;

pub const USERNAME_MIN_LEN: usize = 5;
pub const USERNAME_MAX_LEN: usize = 16;

#[derive(Clone, Debug)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub auth_type: AuthType,
    pub(crate) auth_credential: Option<Vec<u8>>,
    pub can_download: bool,
    pub is_admin: bool,
    pub recovery_email: Option<String>,
    pub recovery_phone: Option<String>,
    pub recovery_enabled: bool,
    pub created_at: DateTime<Utc>,
    pub last_login: Option<DateTime<Utc>>,
}

impl User {
    /// Whether the account currently holds a usable credential. `false`
    /// between a recovery and the follow-up WebAuthn re-enrollment.
    #[must_use]
    pub fn has_credential(&self) -> bool {
        self.auth_credential.is_some()
    }

    pub(crate) fn credential(&self) -> Result<Option<StoredCredential>> {
        self.auth_credential
            .as_deref()
            .map(StoredCredential::from_blob)
            .transpose()
    }
}

/// Validate a username against the account policy: 5-16 printable ASCII
/// characters, no whitespace or controls. Comparison elsewhere is
/// case-sensitive; no normalization happens here.
pub fn validate_username(username: &str) -> Result<()> {
    if username.len() < USERNAME_MIN_LEN || username.len() > USERNAME_MAX_LEN {
        return Err(Error::InvalidUsername("must be 5 to 16 characters"));
    }
    if !username.bytes().all(|b| b.is_ascii_graphic()) {
        return Err(Error::InvalidUsername(
            "only printable ASCII characters without spaces are allowed",
        ));
    }
    Ok(())
}

/// Out-of-band recovery contact: an email address or a phone number, never
/// both. The enum makes the exclusivity structural.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RecoveryContact {
    Email(String),
    Phone(String),
}

impl RecoveryContact {
    /// # Errors
    /// Returns [`Error::InvalidRecoveryContact`] on a malformed address.
    pub fn email(address: &str) -> Result<Self> {
        let address = address.trim().to_lowercase();
        let valid = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$")
            .is_ok_and(|regex| regex.is_match(&address));
        if !valid {
            return Err(Error::InvalidRecoveryContact("malformed email address"));
        }
        Ok(Self::Email(address))
    }

    /// # Errors
    /// Returns [`Error::InvalidRecoveryContact`] on a malformed number.
    pub fn phone(number: &str) -> Result<Self> {
        let number: String = number.chars().filter(|c| !c.is_whitespace()).collect();
        let digits = number.chars().filter(char::is_ascii_digit).count();
        let valid_chars = number
            .chars()
            .enumerate()
            .all(|(idx, c)| c.is_ascii_digit() || c == '-' || (c == '+' && idx == 0));
        if digits < 7 || !valid_chars {
            return Err(Error::InvalidRecoveryContact("malformed phone number"));
        }
        Ok(Self::Phone(number))
    }
}

/// Admin-facing account operations: lookups, authorization flags, recovery
/// contact, deletion. Credential material is managed by the credential vault
/// and the workflows, not here.
pub struct UserDirectory {
    store: Arc<EncryptedStore>,
}

impl UserDirectory {
    #[must_use]
    pub fn new(store: Arc<EncryptedStore>) -> Self {
        Self { store }
    }

    /// Create an account directly, bypassing the registration workflow.
    /// This is the admin/bootstrap path (first account of a fresh install);
    /// it runs the same username validation as self-registration.
    ///
    /// # Errors
    /// [`Error::InvalidUsername`] on policy violations and
    /// [`Error::UsernameTaken`] on collisions.
    pub fn create(
        &self,
        username: &str,
        credential: &StoredCredential,
        is_admin: bool,
    ) -> Result<User> {
        validate_username(username)?;
        let blob = credential.to_blob()?;
        let user = self.store.with_txn(|conn| {
            let user = repo::create(
                conn,
                &repo::NewUser {
                    username,
                    auth_type: credential.auth_type(),
                    credential: Some(&blob),
                    recovery_contact: None,
                },
            )?;
            if is_admin && !repo::set_flags(conn, user.id, user.can_download, true)? {
                return Err(Error::UserNotFound);
            }
            Ok(User {
                is_admin,
                ..user
            })
        })?;
        info!(username, user_id = %user.id, is_admin, "created user account");
        Ok(user)
    }

    /// # Errors
    /// Returns storage errors only; an unknown id yields `Ok(None)`.
    pub fn get(&self, user_id: Uuid) -> Result<Option<User>> {
        self.store.with_conn(|conn| repo::find_by_id(conn, user_id))
    }

    /// # Errors
    /// Returns storage errors only; an unknown username yields `Ok(None)`.
    pub fn find_by_username(&self, username: &str) -> Result<Option<User>> {
        self.store
            .with_conn(|conn| repo::find_by_username(conn, username))
    }

    /// All accounts, ordered by creation time.
    ///
    /// # Errors
    /// Returns storage errors.
    pub fn list(&self) -> Result<Vec<User>> {
        self.store.with_conn(repo::list)
    }

    /// Grant or revoke the authorization flags.
    ///
    /// # Errors
    /// [`Error::UserNotFound`] when the account does not exist.
    pub fn set_flags(&self, user_id: Uuid, can_download: bool, is_admin: bool) -> Result<()> {
        self.store.with_txn(|conn| {
            if !repo::set_flags(conn, user_id, can_download, is_admin)? {
                return Err(Error::UserNotFound);
            }
            info!(%user_id, can_download, is_admin, "updated authorization flags");
            Ok(())
        })
    }

    /// Set or clear the recovery contact. `None` disables recovery.
    ///
    /// # Errors
    /// [`Error::UserNotFound`] when the account does not exist.
    pub fn set_recovery_contact(
        &self,
        user_id: Uuid,
        contact: Option<RecoveryContact>,
    ) -> Result<()> {
        self.store.with_txn(|conn| {
            if !repo::set_recovery_contact(conn, user_id, contact.as_ref())? {
                return Err(Error::UserNotFound);
            }
            Ok(())
        })
    }

    /// Delete the account. Sessions, backup codes, and pending recovery rows
    /// go with it (cascade).
    ///
    /// # Errors
    /// [`Error::UserNotFound`] when the account does not exist.
    pub fn delete(&self, user_id: Uuid) -> Result<()> {
        self.store.with_txn(|conn| {
            if !repo::delete(conn, user_id)? {
                return Err(Error::UserNotFound);
            }
            info!(%user_id, "deleted user account");
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn username_length_bounds() {
        assert!(validate_username("abcd").is_err());
        assert!(validate_username("abcde").is_ok());
        assert!(validate_username("a234567890123456").is_ok());
        assert!(validate_username("a2345678901234567").is_err());
    }

    #[test]
    fn username_rejects_whitespace_and_non_ascii() {
        assert!(validate_username("has space").is_err());
        assert!(validate_username("tab\there").is_err());
        assert!(validate_username("émile1").is_err());
        assert!(validate_username("alice123").is_ok());
        assert!(validate_username("User.Name_9!").is_ok());
    }

    #[test]
    fn usernames_are_case_sensitive() {
        // Validation accepts both; uniqueness is byte-wise in the store.
        assert!(validate_username("Alice1").is_ok());
        assert!(validate_username("alice1").is_ok());
    }

    #[test]
    fn recovery_email_is_normalized_and_checked() {
        let contact = RecoveryContact::email(" Alice@Example.COM ");
        assert_eq!(
            contact.ok(),
            Some(RecoveryContact::Email("alice@example.com".to_string()))
        );
        assert!(RecoveryContact::email("not-an-email").is_err());
    }

    #[test]
    fn recovery_phone_requires_digits() {
        assert!(RecoveryContact::phone("+1-555-0123").is_ok());
        assert!(RecoveryContact::phone("555 0123").is_ok());
        assert!(RecoveryContact::phone("12345").is_err());
        assert!(RecoveryContact::phone("call-me-maybe").is_err());
    }
}
