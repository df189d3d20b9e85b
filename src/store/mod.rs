//! Encrypted store: a SQLCipher-keyed SQLite file behind scoped transactions.
//!
//! Every unit of work opens its own connection, applies the encryption key as
//! the first statement, and runs inside an IMMEDIATE transaction that commits
//! on success and rolls back on any error. Callers never observe a
//! partially-applied mutation, which is what the single-session and
//! single-use-code invariants lean on.

pub(crate) mod schema;

use std::path::PathBuf;
use std::time::Duration;

use rusqlite::{Connection, ErrorCode, TransactionBehavior};
use tracing::debug;

use crate::error::{Error, StoreError};
use crate::keys::MasterKey;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub struct EncryptedStore {
    path: PathBuf,
    key: MasterKey,
}

impl EncryptedStore {
    /// Open (creating if needed) the encrypted database at `path`.
    ///
    /// Runs the decrypt probe and idempotent schema initialization before
    /// returning, so a handle that exists is a handle that works.
    ///
    /// # Errors
    /// [`StoreError::CannotDecrypt`] when the file exists but does not
    /// decrypt under `key`; [`StoreError::Unavailable`] when the file cannot
    /// be opened at all.
    pub fn open(path: impl Into<PathBuf>, key: MasterKey) -> Result<Self, StoreError> {
        let store = Self {
            path: path.into(),
            key,
        };
        let conn = store.connect()?;
        schema::initialize(&conn)?;
        debug!(path = %store.path.display(), "encrypted store opened");
        Ok(store)
    }

    /// Acquire a keyed connection and verify it decrypts the file.
    fn connect(&self) -> Result<Connection, StoreError> {
        let conn = Connection::open(&self.path).map_err(open_error)?;
        // The key pragma must precede every other statement on the connection.
        // The hex rendering is validated at load time, so splicing it into the
        // pragma text is safe.
        conn.execute_batch(&format!("PRAGMA key = \"x'{}'\";", self.key.expose()))?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        verify_decrypt(&conn)?;
        Ok(conn)
    }

    /// Run one read-only unit of work on a fresh keyed connection.
    pub(crate) fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let conn = self.connect()?;
        f(&conn)
    }

    /// Run one unit of work inside an IMMEDIATE transaction.
    ///
    /// The transaction commits when the closure returns `Ok` and rolls back
    /// on `Err` or panic (drop of the uncommitted transaction).
    pub(crate) fn with_txn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let mut conn = self.connect()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StoreError::from)?;
        let out = f(&tx)?;
        tx.commit().map_err(StoreError::from)?;
        Ok(out)
    }
}

fn verify_decrypt(conn: &Connection) -> Result<(), StoreError> {
    // First real read on the connection: fails with SQLITE_NOTADB when the
    // key is wrong or the file is not a SQLCipher database.
    match conn.query_row("SELECT count(*) FROM sqlite_master", [], |row| {
        row.get::<_, i64>(0)
    }) {
        Ok(_) => Ok(()),
        Err(rusqlite::Error::SqliteFailure(err, _)) if err.code == ErrorCode::NotADatabase => {
            Err(StoreError::CannotDecrypt)
        }
        Err(err) => Err(StoreError::from(err)),
    }
}

fn open_error(err: rusqlite::Error) -> StoreError {
    match &err {
        rusqlite::Error::SqliteFailure(failure, message)
            if failure.code == ErrorCode::CannotOpen =>
        {
            StoreError::Unavailable(
                message
                    .clone()
                    .unwrap_or_else(|| "unable to open database file".to_string()),
            )
        }
        _ => StoreError::from(err),
    }
}

/// SQLite reports UNIQUE violations as constraint failures; repositories use
/// this to translate them into domain conflicts.
pub(crate) fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.code == ErrorCode::ConstraintViolation
    )
}
