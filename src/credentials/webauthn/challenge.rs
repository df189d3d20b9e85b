//! In-memory registry of outstanding WebAuthn ceremony state.
//!
//! Challenges are ephemeral: they survive only until consumed or expired,
//! and a process restart aborts in-flight ceremonies (the client restarts
//! the ceremony). Expired entries are pruned on every insert; consumption
//! removes the entry before any verification runs, so a challenge can be
//! used exactly once regardless of the outcome.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use uuid::Uuid;
use webauthn_rs::prelude::{
    PasskeyAuthentication, PasskeyRegistration, SecurityKeyAuthentication, SecurityKeyRegistration,
};

use crate::error::{Error, Result};

#[derive(Debug)]
pub(crate) enum CeremonyState {
    PasskeyRegistration(PasskeyRegistration),
    Fido2Registration(SecurityKeyRegistration),
    PasskeyAuthentication(PasskeyAuthentication),
    Fido2Authentication(SecurityKeyAuthentication),
}

impl CeremonyState {
    fn is_registration(&self) -> bool {
        matches!(
            self,
            Self::PasskeyRegistration(_) | Self::Fido2Registration(_)
        )
    }
}

#[derive(Debug)]
pub(crate) struct ChallengeEntry {
    /// `None` during registration: the account may not exist yet.
    pub user_id: Option<Uuid>,
    pub username: String,
    expires_at: Instant,
    pub state: CeremonyState,
}

#[derive(Debug)]
pub(crate) struct ChallengeRegistry {
    ttl: Duration,
    entries: Mutex<HashMap<String, ChallengeEntry>>,
}

impl ChallengeRegistry {
    pub(crate) fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn insert(
        &self,
        key: String,
        user_id: Option<Uuid>,
        username: &str,
        state: CeremonyState,
    ) {
        let mut entries = self.lock();
        prune(&mut entries);
        entries.insert(
            key,
            ChallengeEntry {
                user_id,
                username: username.to_string(),
                expires_at: Instant::now() + self.ttl,
                state,
            },
        );
    }

    /// Remove and return the entry for `key`. The entry is gone after this
    /// call no matter what it returns.
    ///
    /// # Errors
    /// [`Error::ChallengeNotFound`] for an unknown key,
    /// [`Error::ChallengeExpired`] past the TTL, and
    /// [`Error::WrongChallengeType`] when a registration challenge is
    /// presented to authentication or vice versa.
    pub(crate) fn take(&self, key: &str, registration: bool) -> Result<ChallengeEntry> {
        let entry = self
            .lock()
            .remove(key)
            .ok_or(Error::ChallengeNotFound)?;
        if entry.expires_at <= Instant::now() {
            return Err(Error::ChallengeExpired);
        }
        if entry.state.is_registration() != registration {
            return Err(Error::WrongChallengeType);
        }
        Ok(entry)
    }

    /// Drop every expired entry, returning how many were removed.
    pub(crate) fn purge_expired(&self) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        prune(&mut entries);
        before - entries.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, ChallengeEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }
}

fn prune(entries: &mut HashMap<String, ChallengeEntry>) {
    let now = Instant::now();
    entries.retain(|_, entry| entry.expires_at > now);
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use url::Url;
    use webauthn_rs::WebauthnBuilder;

    fn registration_state() -> CeremonyState {
        let origin = Url::parse("https://media.example").unwrap();
        let webauthn = WebauthnBuilder::new("media.example", &origin)
            .unwrap()
            .build()
            .unwrap();
        let (_, state) = webauthn
            .start_passkey_registration(Uuid::new_v4(), "alice123", "alice123", None)
            .unwrap();
        CeremonyState::PasskeyRegistration(state)
    }

    #[test]
    fn challenge_is_single_use() {
        let registry = ChallengeRegistry::new(Duration::from_secs(300));
        registry.insert("abc".to_string(), None, "alice123", registration_state());

        assert!(registry.take("abc", true).is_ok());
        let err = registry.take("abc", true).unwrap_err();
        assert!(matches!(err, Error::ChallengeNotFound));
    }

    #[test]
    fn wrong_ceremony_type_is_rejected_and_consumed() {
        let registry = ChallengeRegistry::new(Duration::from_secs(300));
        registry.insert("abc".to_string(), None, "alice123", registration_state());

        let err = registry.take("abc", false).unwrap_err();
        assert!(matches!(err, Error::WrongChallengeType));
        // Consumed even on the failure path.
        assert!(matches!(
            registry.take("abc", true).unwrap_err(),
            Error::ChallengeNotFound
        ));
    }

    #[test]
    fn expired_challenge_is_reported_then_gone() {
        let registry = ChallengeRegistry::new(Duration::ZERO);
        registry.insert("abc".to_string(), None, "alice123", registration_state());

        // Insert pruning keeps the fresh entry (TTL zero expires immediately,
        // but pruning only runs on the next insert), so take sees it expired.
        let err = registry.take("abc", true).unwrap_err();
        assert!(matches!(err, Error::ChallengeExpired));
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn inserts_prune_expired_entries() {
        let registry = ChallengeRegistry::new(Duration::ZERO);
        registry.insert("old".to_string(), None, "alice123", registration_state());
        registry.insert("new".to_string(), None, "alice123", registration_state());
        // The second insert pruned the first, already-expired entry.
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn purge_reports_removed_count() {
        let registry = ChallengeRegistry::new(Duration::ZERO);
        registry.insert("abc".to_string(), None, "alice123", registration_state());
        assert_eq!(registry.purge_expired(), 1);
        assert_eq!(registry.purge_expired(), 0);
    }
}
