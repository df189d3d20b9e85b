//! Session issuance and lookup with a single-active-session invariant.
//!
//! Creating a session deletes any prior session for the user inside the same
//! transaction, so at no instant do two live sessions for one account exist.
//! Only the SHA-256 of the bearer token is persisted; lookups hash the
//! presented value and compare digests, never substrings.

pub(crate) mod repo;

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::VaultConfig;
use crate::error::Result;
use crate::store::EncryptedStore;
use crate::tokens;
use crate::users::repo as users_repo;

#[derive(Clone, Debug)]
pub struct Session {
    pub id: Uuid,
    pub user_id: Uuid,
    /// SHA-256 of the bearer token; the raw token is never persisted.
    pub token_hash: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub user_agent: Option<String>,
    pub ip_address: Option<String>,
}

pub struct SessionManager {
    store: Arc<EncryptedStore>,
    ttl_seconds: i64,
    stale_grace_seconds: i64,
}

impl SessionManager {
    #[must_use]
    pub fn new(store: Arc<EncryptedStore>, config: &VaultConfig) -> Self {
        Self {
            store,
            ttl_seconds: config.session_ttl_seconds(),
            stale_grace_seconds: config.session_stale_grace_seconds(),
        }
    }

    /// Issue a session, returning it together with the one-time raw token.
    ///
    /// Deleting the previous session and inserting the new one happen in one
    /// transaction; the user's `last_login` is stamped alongside.
    ///
    /// # Errors
    /// Returns storage errors.
    pub fn create(
        &self,
        user_id: Uuid,
        user_agent: Option<&str>,
        ip_address: Option<&str>,
    ) -> Result<(Session, String)> {
        let raw_token = tokens::generate_session_token();
        let token_hash = tokens::hash_token(&raw_token);
        let ttl = Duration::seconds(self.ttl_seconds);

        let session = self.store.with_txn(|conn| {
            let replaced = repo::delete_for_user(conn, user_id)?;
            if replaced > 0 {
                debug!(%user_id, "replaced existing session");
            }
            let session = repo::insert(conn, user_id, &token_hash, ttl, user_agent, ip_address)?;
            users_repo::touch_last_login(conn, user_id)?;
            Ok(session)
        })?;

        info!(%user_id, session_id = %session.id, "session created");
        Ok((session, raw_token))
    }

    /// Resolve a bearer token. Returns `None` uniformly for unknown,
    /// malformed, and expired tokens.
    ///
    /// # Errors
    /// Returns storage errors.
    pub fn lookup(&self, raw_token: &str) -> Result<Option<Session>> {
        // Hashing first gives every input the same fixed-length comparison.
        let token_hash = tokens::hash_token(raw_token.trim());
        let session = self
            .store
            .with_conn(|conn| repo::find_by_hash(conn, &token_hash))?;
        Ok(session.filter(|session| session.expires_at > Utc::now()))
    }

    /// Record activity on a session.
    ///
    /// # Errors
    /// Returns storage errors.
    pub fn touch(&self, session: &mut Session) -> Result<()> {
        let now = Utc::now();
        self.store
            .with_txn(|conn| repo::touch(conn, session.id, now))?;
        session.last_seen = now;
        Ok(())
    }

    /// Delete every session for a user (logout, admin kick, recovery).
    ///
    /// # Errors
    /// Returns storage errors.
    pub fn invalidate_all(&self, user_id: Uuid) -> Result<usize> {
        let removed = self
            .store
            .with_txn(|conn| repo::delete_for_user(conn, user_id))?;
        if removed > 0 {
            info!(%user_id, removed, "invalidated sessions");
        }
        Ok(removed)
    }

    /// Delete sessions idle past the staleness grace period or past their
    /// absolute expiry. Intended for periodic invocation by the host.
    ///
    /// # Errors
    /// Returns storage errors.
    pub fn cleanup_stale(&self) -> Result<usize> {
        let now = Utc::now();
        let idle_cutoff = now - Duration::seconds(self.stale_grace_seconds);
        let removed = self
            .store
            .with_txn(|conn| repo::delete_stale(conn, idle_cutoff, now))?;
        if removed > 0 {
            debug!(removed, "swept stale sessions");
        }
        Ok(removed)
    }
}
