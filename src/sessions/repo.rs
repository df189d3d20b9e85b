//! Storage access for session rows.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use crate::error::Result;
use crate::sessions::Session;
use crate::users::repo::parse_uuid;

pub(crate) fn insert(
    conn: &Connection,
    user_id: Uuid,
    token_hash: &[u8],
    ttl: Duration,
    user_agent: Option<&str>,
    ip_address: Option<&str>,
) -> Result<Session> {
    let now = Utc::now();
    let session = Session {
        id: Uuid::new_v4(),
        user_id,
        token_hash: token_hash.to_vec(),
        created_at: now,
        last_seen: now,
        expires_at: now + ttl,
        user_agent: user_agent.map(str::to_string),
        ip_address: ip_address.map(str::to_string),
    };

    conn.execute(
        "INSERT INTO sessions
            (id, user_id, token_hash, created_at, last_seen, expires_at, user_agent, ip_address)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            session.id.to_string(),
            session.user_id.to_string(),
            session.token_hash,
            session.created_at,
            session.last_seen,
            session.expires_at,
            session.user_agent,
            session.ip_address,
        ],
    )?;
    Ok(session)
}

/// Exact-match lookup on the token digest; no prefix or substring matching.
pub(crate) fn find_by_hash(conn: &Connection, token_hash: &[u8]) -> Result<Option<Session>> {
    let session = conn
        .query_row(
            "SELECT id, user_id, token_hash, created_at, last_seen, expires_at,
                    user_agent, ip_address
               FROM sessions WHERE token_hash = ?1",
            [token_hash],
            map_session,
        )
        .optional()?;
    Ok(session)
}

pub(crate) fn touch(conn: &Connection, session_id: Uuid, now: DateTime<Utc>) -> Result<()> {
    conn.execute(
        "UPDATE sessions SET last_seen = ?1 WHERE id = ?2",
        params![now, session_id.to_string()],
    )?;
    Ok(())
}

pub(crate) fn delete_for_user(conn: &Connection, user_id: Uuid) -> Result<usize> {
    let deleted = conn.execute(
        "DELETE FROM sessions WHERE user_id = ?1",
        [user_id.to_string()],
    )?;
    Ok(deleted)
}

pub(crate) fn delete_stale(
    conn: &Connection,
    idle_cutoff: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<usize> {
    let deleted = conn.execute(
        "DELETE FROM sessions WHERE last_seen < ?1 OR expires_at <= ?2",
        params![idle_cutoff, now],
    )?;
    Ok(deleted)
}

fn map_session(row: &Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        id: parse_uuid(row.get::<_, String>(0)?, 0)?,
        user_id: parse_uuid(row.get::<_, String>(1)?, 1)?,
        token_hash: row.get(2)?,
        created_at: row.get(3)?,
        last_seen: row.get(4)?,
        expires_at: row.get(5)?,
        user_agent: row.get(6)?,
        ip_address: row.get(7)?,
    })
}
