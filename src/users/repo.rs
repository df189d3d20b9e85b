//! Storage access for user rows. Mapping between rows and [`User`] happens
//! here and nowhere else.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use crate::credentials::AuthType;
use crate::error::{Error, Result};
use crate::store::is_unique_violation;
use crate::users::{RecoveryContact, User};

pub(crate) struct NewUser<'a> {
    pub username: &'a str,
    pub auth_type: AuthType,
    pub credential: Option<&'a [u8]>,
    pub recovery_contact: Option<&'a RecoveryContact>,
}

pub(crate) fn create(conn: &Connection, new_user: &NewUser<'_>) -> Result<User> {
    let (email, phone) = split_contact(new_user.recovery_contact);
    let user = User {
        id: Uuid::new_v4(),
        username: new_user.username.to_string(),
        auth_type: new_user.auth_type,
        auth_credential: new_user.credential.map(<[u8]>::to_vec),
        can_download: true,
        is_admin: false,
        recovery_email: email.map(str::to_string),
        recovery_phone: phone.map(str::to_string),
        recovery_enabled: new_user.recovery_contact.is_some(),
        created_at: Utc::now(),
        last_login: None,
    };

    let inserted = conn.execute(
        "INSERT INTO users
            (id, username, auth_type, auth_credential, can_download, is_admin,
             recovery_email, recovery_phone, recovery_enabled, created_at, last_login)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            user.id.to_string(),
            user.username,
            user.auth_type.as_str(),
            user.auth_credential,
            user.can_download,
            user.is_admin,
            user.recovery_email,
            user.recovery_phone,
            user.recovery_enabled,
            user.created_at,
            user.last_login,
        ],
    );

    match inserted {
        Ok(_) => Ok(user),
        Err(err) if is_unique_violation(&err) => Err(Error::UsernameTaken),
        Err(err) => Err(err.into()),
    }
}

pub(crate) fn find_by_id(conn: &Connection, user_id: Uuid) -> Result<Option<User>> {
    let user = conn
        .query_row(
            &format!("{SELECT_USER} WHERE id = ?1"),
            [user_id.to_string()],
            map_user,
        )
        .optional()?;
    Ok(user)
}

pub(crate) fn find_by_username(conn: &Connection, username: &str) -> Result<Option<User>> {
    let user = conn
        .query_row(
            &format!("{SELECT_USER} WHERE username = ?1"),
            [username],
            map_user,
        )
        .optional()?;
    Ok(user)
}

pub(crate) fn list(conn: &Connection) -> Result<Vec<User>> {
    let mut stmt = conn.prepare(&format!("{SELECT_USER} ORDER BY created_at, username"))?;
    let users = stmt
        .query_map([], map_user)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(users)
}

/// Replace the stored credential. `None` leaves the account without a
/// credential pending re-enrollment.
pub(crate) fn update_credential(
    conn: &Connection,
    user_id: Uuid,
    auth_type: AuthType,
    credential: Option<&[u8]>,
) -> Result<bool> {
    let updated = conn.execute(
        "UPDATE users SET auth_type = ?1, auth_credential = ?2 WHERE id = ?3",
        params![auth_type.as_str(), credential, user_id.to_string()],
    )?;
    Ok(updated > 0)
}

pub(crate) fn touch_last_login(conn: &Connection, user_id: Uuid) -> Result<()> {
    conn.execute(
        "UPDATE users SET last_login = ?1 WHERE id = ?2",
        params![Utc::now(), user_id.to_string()],
    )?;
    Ok(())
}

pub(crate) fn set_flags(
    conn: &Connection,
    user_id: Uuid,
    can_download: bool,
    is_admin: bool,
) -> Result<bool> {
    let updated = conn.execute(
        "UPDATE users SET can_download = ?1, is_admin = ?2 WHERE id = ?3",
        params![can_download, is_admin, user_id.to_string()],
    )?;
    Ok(updated > 0)
}

pub(crate) fn set_recovery_contact(
    conn: &Connection,
    user_id: Uuid,
    contact: Option<&RecoveryContact>,
) -> Result<bool> {
    let (email, phone) = split_contact(contact);
    let updated = conn.execute(
        "UPDATE users
            SET recovery_email = ?1, recovery_phone = ?2, recovery_enabled = ?3
          WHERE id = ?4",
        params![email, phone, contact.is_some(), user_id.to_string()],
    )?;
    Ok(updated > 0)
}

pub(crate) fn delete(conn: &Connection, user_id: Uuid) -> Result<bool> {
    let deleted = conn.execute(
        "DELETE FROM users WHERE id = ?1",
        [user_id.to_string()],
    )?;
    Ok(deleted > 0)
}

const SELECT_USER: &str = "SELECT id, username, auth_type, auth_credential, can_download,
        is_admin, recovery_email, recovery_phone, recovery_enabled, created_at, last_login
   FROM users";

fn split_contact(contact: Option<&RecoveryContact>) -> (Option<&str>, Option<&str>) {
    match contact {
        Some(RecoveryContact::Email(email)) => (Some(email.as_str()), None),
        Some(RecoveryContact::Phone(phone)) => (None, Some(phone.as_str())),
        None => (None, None),
    }
}

fn map_user(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: parse_uuid(row.get::<_, String>(0)?, 0)?,
        username: row.get(1)?,
        auth_type: parse_auth_type(&row.get::<_, String>(2)?, 2)?,
        auth_credential: row.get(3)?,
        can_download: row.get(4)?,
        is_admin: row.get(5)?,
        recovery_email: row.get(6)?,
        recovery_phone: row.get(7)?,
        recovery_enabled: row.get(8)?,
        created_at: row.get(9)?,
        last_login: row.get(10)?,
    })
}

pub(crate) fn parse_uuid(value: String, column: usize) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(&value).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(
            column,
            rusqlite::types::Type::Text,
            Box::new(err),
        )
    })
}

fn parse_auth_type(value: &str, column: usize) -> rusqlite::Result<AuthType> {
    AuthType::from_str(value).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            column,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid users.auth_type value: {value}"),
            )),
        )
    })
}
