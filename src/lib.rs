//! # Shelfguard (Authentication & Identity Core)
//!
//! `shelfguard` is the authentication and identity core of a self-hosted
//! media library server. It owns the encrypted-at-rest credential store and
//! everything that touches it: TOTP and WebAuthn verification, single-use
//! backup codes, admin-gated self-registration, and contact-less account
//! recovery. The HTTP layer, media catalog, and notification plumbing are
//! callers of this crate, not part of it.
//!
//! ## Storage
//!
//! All durable state lives in one SQLCipher-encrypted SQLite file keyed by a
//! 256-bit key the [`keys::KeyManager`] loads (or generates) from a
//! 0600-permission key file. Every public operation runs as one scoped
//! IMMEDIATE transaction, which is what the crate's invariants lean on:
//!
//! - **One session per user.** Creating a session deletes the previous one
//!   in the same transaction; two concurrent logins can never leave two live
//!   sessions.
//! - **Single-use codes and tokens.** Backup codes, claim tokens, and
//!   recovery tokens are consumed by guarded updates inside the transaction
//!   that matched them.
//! - **Hash-only persistence.** Raw bearer tokens, claim tokens, recovery
//!   tokens, and backup codes exist only in memory and in the one response
//!   delivered to their holder; the store keeps SHA-256 digests.
//!
//! ## Ceremony state
//!
//! Outstanding WebAuthn challenges are in-memory only (mutex-guarded, TTL
//! 5 minutes, single-use). A restart aborts in-flight ceremonies; clients
//! simply start over. Deployments that scale past one process must pin
//! ceremonies to a single process.

pub mod backup_codes;
pub mod config;
pub mod credentials;
pub mod error;
pub mod keys;
pub mod recovery;
pub mod registration;
pub mod sessions;
pub mod store;
pub mod users;

pub(crate) mod tokens;

use std::sync::Arc;

pub use crate::backup_codes::BackupCodeVault;
pub use crate::config::VaultConfig;
pub use crate::credentials::webauthn::Attachment;
pub use crate::credentials::{AuthType, CredentialVault, StoredCredential};
pub use crate::error::{Error, ErrorKind, KeyError, Result, StoreError};
pub use crate::keys::{KeyManager, MasterKey};
pub use crate::recovery::{RecoveryOutcome, RecoveryWorkflow};
pub use crate::registration::{
    AccessRequest, ClaimCredential, ClaimOutcome, RegistrationWorkflow, RequestStatus,
};
pub use crate::sessions::{Session, SessionManager};
pub use crate::store::EncryptedStore;
pub use crate::users::{RecoveryContact, User, UserDirectory};

/// The assembled identity core: one store handle, every component wired to
/// it. Constructed once at process start and shared with the HTTP layer.
pub struct IdentityCore {
    pub sessions: SessionManager,
    pub credentials: CredentialVault,
    pub backup_codes: BackupCodeVault,
    pub registration: RegistrationWorkflow,
    pub recovery: RecoveryWorkflow,
    pub users: UserDirectory,
}

impl IdentityCore {
    /// Load (or generate) the master key, open the encrypted store, and
    /// wire up every component.
    ///
    /// # Errors
    /// Key-file and store-open failures as described in [`KeyError`] and
    /// [`StoreError`]; [`Error::InvalidConfig`] when the WebAuthn
    /// relying-party settings are unusable.
    pub fn open(config: &VaultConfig) -> Result<Self> {
        let key = KeyManager::load_or_generate(config.key_path(), config.dev_mode())?;
        let store = Arc::new(EncryptedStore::open(config.db_path(), key)?);
        Self::with_store(store, config)
    }

    /// Wire components onto an already-open store. Lets tests run several
    /// cores against independent stores.
    ///
    /// # Errors
    /// [`Error::InvalidConfig`] when the WebAuthn relying-party settings are
    /// unusable.
    pub fn with_store(store: Arc<EncryptedStore>, config: &VaultConfig) -> Result<Self> {
        Ok(Self {
            sessions: SessionManager::new(Arc::clone(&store), config),
            credentials: CredentialVault::new(Arc::clone(&store), config)?,
            backup_codes: BackupCodeVault::new(Arc::clone(&store)),
            registration: RegistrationWorkflow::new(Arc::clone(&store), config),
            recovery: RecoveryWorkflow::new(Arc::clone(&store), config),
            users: UserDirectory::new(store),
        })
    }
}
