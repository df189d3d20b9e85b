//! Storage access for pending-recovery rows.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use crate::error::Result;
use crate::recovery::PendingRecovery;
use crate::users::repo::parse_uuid;

pub(crate) fn insert(
    conn: &Connection,
    user_id: Uuid,
    token_hash: &[u8],
    expires_at: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO pending_recovery (id, user_id, token_hash, created_at, expires_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            Uuid::new_v4().to_string(),
            user_id.to_string(),
            token_hash,
            Utc::now(),
            expires_at,
        ],
    )?;
    Ok(())
}

pub(crate) fn find_by_hash(
    conn: &Connection,
    token_hash: &[u8],
) -> Result<Option<PendingRecovery>> {
    let pending = conn
        .query_row(
            "SELECT id, user_id, token_hash, created_at, expires_at, used_at
               FROM pending_recovery WHERE token_hash = ?1",
            [token_hash],
            map_pending,
        )
        .optional()?;
    Ok(pending)
}

pub(crate) fn mark_used(conn: &Connection, pending_id: Uuid) -> Result<bool> {
    let updated = conn.execute(
        "UPDATE pending_recovery SET used_at = ?1 WHERE id = ?2 AND used_at IS NULL",
        params![Utc::now(), pending_id.to_string()],
    )?;
    Ok(updated > 0)
}

/// Drop expired, never-used tokens; used rows stay behind as history.
pub(crate) fn delete_expired(conn: &Connection) -> Result<usize> {
    let deleted = conn.execute(
        "DELETE FROM pending_recovery WHERE expires_at <= ?1 AND used_at IS NULL",
        params![Utc::now()],
    )?;
    Ok(deleted)
}

fn map_pending(row: &Row<'_>) -> rusqlite::Result<PendingRecovery> {
    Ok(PendingRecovery {
        id: parse_uuid(row.get::<_, String>(0)?, 0)?,
        user_id: parse_uuid(row.get::<_, String>(1)?, 1)?,
        token_hash: row.get(2)?,
        created_at: row.get(3)?,
        expires_at: row.get(4)?,
        used_at: row.get(5)?,
    })
}
