//! Storage access for access requests and pending registrations.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::registration::{AccessRequest, PendingRegistration, RequestStatus};
use crate::store::is_unique_violation;
use crate::users::repo::parse_uuid;

pub(crate) fn insert_request(conn: &Connection, username: &str) -> Result<AccessRequest> {
    let request = AccessRequest {
        id: Uuid::new_v4(),
        username: username.to_string(),
        status: RequestStatus::Pending,
        requested_at: Utc::now(),
        reviewed_at: None,
        reviewed_by: None,
        deny_reason: None,
    };

    let inserted = conn.execute(
        "INSERT INTO access_requests (id, username, status, requested_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            request.id.to_string(),
            request.username,
            request.status.as_str(),
            request.requested_at,
        ],
    );

    match inserted {
        Ok(_) => Ok(request),
        Err(err) if is_unique_violation(&err) => Err(Error::DuplicateRequest),
        Err(err) => Err(err.into()),
    }
}

pub(crate) fn find_request(conn: &Connection, request_id: Uuid) -> Result<Option<AccessRequest>> {
    let request = conn
        .query_row(
            &format!("{SELECT_REQUEST} WHERE id = ?1"),
            [request_id.to_string()],
            map_request,
        )
        .optional()?;
    Ok(request)
}

pub(crate) fn find_request_by_username(
    conn: &Connection,
    username: &str,
) -> Result<Option<AccessRequest>> {
    let request = conn
        .query_row(
            &format!("{SELECT_REQUEST} WHERE username = ?1"),
            [username],
            map_request,
        )
        .optional()?;
    Ok(request)
}

pub(crate) fn list_pending_requests(conn: &Connection) -> Result<Vec<AccessRequest>> {
    let mut stmt = conn.prepare(&format!(
        "{SELECT_REQUEST} WHERE status = 'pending' ORDER BY requested_at"
    ))?;
    let requests = stmt
        .query_map([], map_request)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(requests)
}

/// `pending -> approved | denied`; the status guard keeps the transition
/// single-shot under concurrency.
pub(crate) fn transition_request(
    conn: &Connection,
    request_id: Uuid,
    verdict: RequestStatus,
    reviewed_by: Uuid,
    deny_reason: Option<&str>,
) -> Result<bool> {
    let updated = conn.execute(
        "UPDATE access_requests
            SET status = ?1, reviewed_at = ?2, reviewed_by = ?3, deny_reason = ?4
          WHERE id = ?5 AND status = 'pending'",
        params![
            verdict.as_str(),
            Utc::now(),
            reviewed_by.to_string(),
            deny_reason,
            request_id.to_string(),
        ],
    )?;
    Ok(updated > 0)
}

pub(crate) fn insert_pending(
    conn: &Connection,
    username: &str,
    token_hash: &[u8],
    expires_at: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO pending_registrations (id, username, token_hash, created_at, expires_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            Uuid::new_v4().to_string(),
            username,
            token_hash,
            Utc::now(),
            expires_at,
        ],
    )?;
    Ok(())
}

pub(crate) fn find_pending_by_hash(
    conn: &Connection,
    token_hash: &[u8],
) -> Result<Option<PendingRegistration>> {
    let pending = conn
        .query_row(
            "SELECT id, username, token_hash, created_at, expires_at
               FROM pending_registrations WHERE token_hash = ?1",
            [token_hash],
            map_pending,
        )
        .optional()?;
    Ok(pending)
}

pub(crate) fn delete_pending(conn: &Connection, pending_id: Uuid) -> Result<()> {
    conn.execute(
        "DELETE FROM pending_registrations WHERE id = ?1",
        [pending_id.to_string()],
    )?;
    Ok(())
}

pub(crate) fn delete_pending_for_username(conn: &Connection, username: &str) -> Result<()> {
    conn.execute(
        "DELETE FROM pending_registrations WHERE username = ?1",
        [username],
    )?;
    Ok(())
}

pub(crate) fn delete_expired_pending(conn: &Connection) -> Result<usize> {
    let deleted = conn.execute(
        "DELETE FROM pending_registrations WHERE expires_at <= ?1",
        params![Utc::now()],
    )?;
    Ok(deleted)
}

const SELECT_REQUEST: &str = "SELECT id, username, status, requested_at, reviewed_at,
        reviewed_by, deny_reason
   FROM access_requests";

fn map_request(row: &Row<'_>) -> rusqlite::Result<AccessRequest> {
    let status_text: String = row.get(2)?;
    let status = RequestStatus::from_str(&status_text).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid access_requests.status value: {status_text}"),
            )),
        )
    })?;
    let reviewed_by = row
        .get::<_, Option<String>>(5)?
        .map(|value| parse_uuid(value, 5))
        .transpose()?;

    Ok(AccessRequest {
        id: parse_uuid(row.get::<_, String>(0)?, 0)?,
        username: row.get(1)?,
        status,
        requested_at: row.get(3)?,
        reviewed_at: row.get(4)?,
        reviewed_by,
        deny_reason: row.get(6)?,
    })
}

fn map_pending(row: &Row<'_>) -> rusqlite::Result<PendingRegistration> {
    Ok(PendingRegistration {
        id: parse_uuid(row.get::<_, String>(0)?, 0)?,
        username: row.get(1)?,
        token_hash: row.get(2)?,
        created_at: row.get(3)?,
        expires_at: row.get(4)?,
    })
}
