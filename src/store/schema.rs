//! Schema initialization and version tracking.
//!
//! Migrations run exactly once at store open, so the runtime data model has
//! a single shape; repositories never branch on column counts.

use rusqlite::Connection;
use tracing::info;

use crate::error::StoreError;

pub(crate) const SCHEMA_VERSION: i64 = 1;

const SCHEMA_V1: &str = r"
CREATE TABLE IF NOT EXISTS users (
    id                TEXT PRIMARY KEY,
    username          TEXT NOT NULL UNIQUE,
    auth_type         TEXT NOT NULL,
    auth_credential   BLOB,
    can_download      INTEGER NOT NULL DEFAULT 1,
    is_admin          INTEGER NOT NULL DEFAULT 0,
    recovery_email    TEXT,
    recovery_phone    TEXT,
    recovery_enabled  INTEGER NOT NULL DEFAULT 0,
    created_at        TEXT NOT NULL,
    last_login        TEXT
);

CREATE TABLE IF NOT EXISTS sessions (
    id          TEXT PRIMARY KEY,
    user_id     TEXT NOT NULL UNIQUE REFERENCES users(id) ON DELETE CASCADE,
    token_hash  BLOB NOT NULL UNIQUE,
    created_at  TEXT NOT NULL,
    last_seen   TEXT NOT NULL,
    expires_at  TEXT NOT NULL,
    user_agent  TEXT,
    ip_address  TEXT
);

CREATE TABLE IF NOT EXISTS backup_codes (
    id          TEXT PRIMARY KEY,
    user_id     TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    code_hash   BLOB NOT NULL,
    created_at  TEXT NOT NULL,
    used_at     TEXT
);
CREATE INDEX IF NOT EXISTS backup_codes_user_unused
    ON backup_codes(user_id) WHERE used_at IS NULL;

CREATE TABLE IF NOT EXISTS pending_registrations (
    id          TEXT PRIMARY KEY,
    username    TEXT NOT NULL UNIQUE,
    token_hash  BLOB NOT NULL UNIQUE,
    created_at  TEXT NOT NULL,
    expires_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS access_requests (
    id            TEXT PRIMARY KEY,
    username      TEXT NOT NULL UNIQUE,
    status        TEXT NOT NULL CHECK (status IN ('pending', 'approved', 'denied')),
    requested_at  TEXT NOT NULL,
    reviewed_at   TEXT,
    reviewed_by   TEXT,
    deny_reason   TEXT
);

CREATE TABLE IF NOT EXISTS pending_recovery (
    id          TEXT PRIMARY KEY,
    user_id     TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    token_hash  BLOB NOT NULL UNIQUE,
    created_at  TEXT NOT NULL,
    expires_at  TEXT NOT NULL,
    used_at     TEXT
);
";

/// Bring the database up to [`SCHEMA_VERSION`]. Safe to call on an
/// already-initialized database.
pub(crate) fn initialize(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);",
    )?;

    let mut version = current_version(conn)?;
    if version > SCHEMA_VERSION {
        return Err(StoreError::Unavailable(format!(
            "database schema version {version} is newer than supported version {SCHEMA_VERSION}"
        )));
    }

    while version < SCHEMA_VERSION {
        apply_migration(conn, version)?;
        version += 1;
        set_version(conn, version)?;
        info!(version, "applied schema migration");
    }

    Ok(())
}

fn apply_migration(conn: &Connection, from: i64) -> Result<(), StoreError> {
    match from {
        0 => conn.execute_batch(SCHEMA_V1)?,
        _ => {
            return Err(StoreError::Unavailable(format!(
                "no migration path from schema version {from}"
            )))
        }
    }
    Ok(())
}

fn current_version(conn: &Connection) -> Result<i64, StoreError> {
    let version = conn
        .query_row("SELECT max(version) FROM schema_version", [], |row| {
            row.get::<_, Option<i64>>(0)
        })?
        .unwrap_or(0);
    Ok(version)
}

fn set_version(conn: &Connection, version: i64) -> Result<(), StoreError> {
    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute(
        "INSERT INTO schema_version (version) VALUES (?1)",
        [version],
    )?;
    Ok(())
}
