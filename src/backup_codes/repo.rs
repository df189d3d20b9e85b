//! Storage access for backup-code rows.

use chrono::Utc;
use rusqlite::{params, Connection};
use uuid::Uuid;

use crate::error::Result;
use crate::users::repo::parse_uuid;

pub(crate) fn insert(conn: &Connection, user_id: Uuid, code_hash: &[u8]) -> Result<()> {
    conn.execute(
        "INSERT INTO backup_codes (id, user_id, code_hash, created_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            Uuid::new_v4().to_string(),
            user_id.to_string(),
            code_hash,
            Utc::now(),
        ],
    )?;
    Ok(())
}

/// Unused digests for one user; the constant-time match runs over these.
pub(crate) fn unused_hashes(conn: &Connection, user_id: Uuid) -> Result<Vec<(Uuid, Vec<u8>)>> {
    let mut stmt = conn.prepare(
        "SELECT id, code_hash FROM backup_codes WHERE user_id = ?1 AND used_at IS NULL",
    )?;
    let rows = stmt
        .query_map([user_id.to_string()], |row| {
            Ok((parse_uuid(row.get::<_, String>(0)?, 0)?, row.get::<_, Vec<u8>>(1)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Mark a code used; the `used_at IS NULL` guard keeps a row from being
/// consumed twice even if two transactions raced to the same candidate.
pub(crate) fn mark_used(conn: &Connection, code_id: Uuid) -> Result<bool> {
    let updated = conn.execute(
        "UPDATE backup_codes SET used_at = ?1 WHERE id = ?2 AND used_at IS NULL",
        params![Utc::now(), code_id.to_string()],
    )?;
    Ok(updated > 0)
}

pub(crate) fn delete_unused(conn: &Connection, user_id: Uuid) -> Result<usize> {
    let deleted = conn.execute(
        "DELETE FROM backup_codes WHERE user_id = ?1 AND used_at IS NULL",
        [user_id.to_string()],
    )?;
    Ok(deleted)
}

pub(crate) fn count_unused(conn: &Connection, user_id: Uuid) -> Result<usize> {
    let count: i64 = conn.query_row(
        "SELECT count(*) FROM backup_codes WHERE user_id = ?1 AND used_at IS NULL",
        [user_id.to_string()],
        |row| row.get(0),
    )?;
    Ok(usize::try_from(count).unwrap_or_default())
}
