//! Error taxonomy for the identity core.
//!
//! Key and storage failures are fatal to the operation that hit them and are
//! surfaced as-is. Everything else is an expected, recoverable outcome with
//! its own variant, so callers are forced to handle each case instead of
//! relying on blanket catch-alls. [`Error::kind`] collapses the variants into
//! coarse families that the HTTP layer can map onto uniform responses without
//! revealing which part of a login attempt was wrong.

use std::path::PathBuf;

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Failures while loading or generating the at-rest encryption key.
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("key file {path:?} has mode {mode:03o}, expected 0600")]
    InsecurePermissions { path: PathBuf, mode: u32 },
    #[error("key file must contain exactly 64 hex characters")]
    InvalidFormat,
    #[error("failed to access key file: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures at the encrypted-store boundary.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cannot decrypt store: wrong key or corrupted file")]
    CannotDecrypt,
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("invalid stored data: {0}")]
    Data(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("unknown user")]
    UserNotFound,
    #[error("access request not found")]
    RequestNotFound,
    #[error("access request already reviewed")]
    NotPending,
    #[error("access request has not been approved")]
    NotApproved,
    #[error("token not found")]
    TokenNotFound,
    #[error("token expired")]
    TokenExpired,
    #[error("token already used")]
    TokenAlreadyUsed,
    #[error("challenge not found")]
    ChallengeNotFound,
    #[error("challenge expired")]
    ChallengeExpired,
    #[error("challenge does not match the ceremony type")]
    WrongChallengeType,
    #[error("username already taken")]
    UsernameTaken,
    #[error("an access request for this username is already open")]
    DuplicateRequest,
    #[error("invalid username: {0}")]
    InvalidUsername(&'static str),
    #[error("invalid recovery contact: {0}")]
    InvalidRecoveryContact(&'static str),
    #[error("invalid username or code")]
    InvalidUsernameOrCode,
    #[error("admin privileges required")]
    AdminRequired,
    #[error("verification failed")]
    VerificationFailed,
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Self::Store(StoreError::from(err))
    }
}

/// Coarse error families, mirroring the propagation policy: `Key` and
/// `Storage` abort the operation, the rest are expected outcomes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    Key,
    Storage,
    NotFound,
    Expired,
    AlreadyUsed,
    Conflict,
    InvalidInput,
    Forbidden,
    Verification,
}

impl Error {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Key(_) => ErrorKind::Key,
            Self::Store(_) => ErrorKind::Storage,
            Self::UserNotFound
            | Self::RequestNotFound
            | Self::TokenNotFound
            | Self::ChallengeNotFound => ErrorKind::NotFound,
            Self::TokenExpired | Self::ChallengeExpired => ErrorKind::Expired,
            Self::TokenAlreadyUsed => ErrorKind::AlreadyUsed,
            Self::NotPending | Self::NotApproved | Self::UsernameTaken | Self::DuplicateRequest => {
                ErrorKind::Conflict
            }
            Self::InvalidConfig(_)
            | Self::InvalidUsername(_)
            | Self::InvalidRecoveryContact(_) => ErrorKind::InvalidInput,
            Self::AdminRequired => ErrorKind::Forbidden,
            Self::InvalidUsernameOrCode | Self::WrongChallengeType | Self::VerificationFailed => {
                ErrorKind::Verification
            }
        }
    }
}
