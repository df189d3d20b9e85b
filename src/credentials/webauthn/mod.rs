//! WebAuthn ceremonies for platform passkeys and roaming FIDO2 keys.
//!
//! The two credential types run the same verification protocol and differ
//! only in the authenticator-attachment preference requested at
//! registration: passkeys ask for a platform authenticator, FIDO2 keys for a
//! cross-platform one. Ceremony state lives in the in-memory
//! [`ChallengeRegistry`] keyed by the base64url challenge; library-level
//! verification failures are logged and reduced to a generic
//! `VerificationFailed` so cryptographic detail never reaches callers.

pub(crate) mod challenge;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;
use webauthn_rs::prelude::{
    AuthenticatorAttachment, CreationChallengeResponse, PublicKeyCredential,
    RegisterPublicKeyCredential, RequestChallengeResponse, WebauthnError,
};
use webauthn_rs::{Webauthn, WebauthnBuilder};

use crate::config::VaultConfig;
use crate::credentials::{StoredCredential, WebauthnRecord};
use crate::error::{Error, Result};

pub(crate) use challenge::{ChallengeEntry, ChallengeRegistry};
use challenge::CeremonyState;

/// Authenticator-attachment preference requested during registration.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Attachment {
    /// Platform authenticator (passkey).
    Platform,
    /// Cross-platform roaming authenticator (FIDO2 security key).
    CrossPlatform,
}

#[derive(Debug)]
pub(crate) struct WebauthnCeremonies {
    webauthn: Webauthn,
    challenges: ChallengeRegistry,
}

impl WebauthnCeremonies {
    pub(crate) fn new(config: &VaultConfig) -> Result<Self> {
        let origin = Url::parse(config.rp_origin()).map_err(|err| {
            Error::InvalidConfig(format!("invalid relying-party origin: {err}"))
        })?;
        let webauthn = WebauthnBuilder::new(config.rp_id(), &origin)
            .map_err(config_error)?
            .rp_name(config.rp_name())
            .build()
            .map_err(config_error)?;

        Ok(Self {
            webauthn,
            challenges: ChallengeRegistry::new(config.challenge_ttl()),
        })
    }

    pub(crate) fn begin_registration(
        &self,
        username: &str,
        attachment: Attachment,
        exclude_credential_ids: Vec<webauthn_rs::prelude::CredentialID>,
    ) -> Result<(CreationChallengeResponse, String)> {
        // The WebAuthn user handle is random and distinct from the database
        // user id, so the id never leaves the server.
        let user_handle = Uuid::new_v4();
        let exclude = (!exclude_credential_ids.is_empty()).then_some(exclude_credential_ids);

        let (options, state) = match attachment {
            Attachment::Platform => {
                let (options, registration) = self
                    .webauthn
                    .start_passkey_registration(user_handle, username, username, exclude)
                    .map_err(verification_error)?;
                (options, CeremonyState::PasskeyRegistration(registration))
            }
            Attachment::CrossPlatform => {
                let (options, registration) = self
                    .webauthn
                    .start_securitykey_registration(
                        user_handle,
                        username,
                        username,
                        exclude,
                        None,
                        Some(AuthenticatorAttachment::CrossPlatform),
                    )
                    .map_err(verification_error)?;
                (options, CeremonyState::Fido2Registration(registration))
            }
        };

        let key = challenge_key(options.public_key.challenge.as_ref());
        self.challenges.insert(key.clone(), None, username, state);
        Ok((options, key))
    }

    pub(crate) fn complete_registration(
        &self,
        response: &RegisterPublicKeyCredential,
        expected_challenge: &str,
    ) -> Result<StoredCredential> {
        let entry = self.challenges.take(expected_challenge, true)?;
        let transports = response.response.transports.clone().unwrap_or_default();

        match entry.state {
            CeremonyState::PasskeyRegistration(registration) => self
                .webauthn
                .finish_passkey_registration(response, &registration)
                .map(|key| StoredCredential::Passkey(WebauthnRecord::new(key, transports)))
                .map_err(verification_error),
            CeremonyState::Fido2Registration(registration) => self
                .webauthn
                .finish_securitykey_registration(response, &registration)
                .map(|key| StoredCredential::Fido2(WebauthnRecord::new(key, transports)))
                .map_err(verification_error),
            _ => Err(Error::WrongChallengeType),
        }
    }

    pub(crate) fn begin_authentication(
        &self,
        user_id: Uuid,
        username: &str,
        credential: &StoredCredential,
    ) -> Result<(RequestChallengeResponse, String)> {
        let (options, state) = match credential {
            StoredCredential::Passkey(record) => {
                let (options, authentication) = self
                    .webauthn
                    .start_passkey_authentication(std::slice::from_ref(&record.key))
                    .map_err(verification_error)?;
                (options, CeremonyState::PasskeyAuthentication(authentication))
            }
            StoredCredential::Fido2(record) => {
                let (options, authentication) = self
                    .webauthn
                    .start_securitykey_authentication(std::slice::from_ref(&record.key))
                    .map_err(verification_error)?;
                (options, CeremonyState::Fido2Authentication(authentication))
            }
            StoredCredential::Totp { .. } => {
                debug!(username, "WebAuthn authentication requested for a TOTP account");
                return Err(Error::VerificationFailed);
            }
        };

        let key = challenge_key(options.public_key.challenge.as_ref());
        self.challenges
            .insert(key.clone(), Some(user_id), username, state);
        Ok((options, key))
    }

    pub(crate) fn take_authentication(&self, expected_challenge: &str) -> Result<ChallengeEntry> {
        self.challenges.take(expected_challenge, false)
    }

    /// Verify an assertion against the stored credential and advance its
    /// sign counter. The caller persists the updated credential.
    pub(crate) fn verify_assertion(
        &self,
        state: CeremonyState,
        response: &PublicKeyCredential,
        credential: &mut StoredCredential,
    ) -> Result<u32> {
        match (state, credential) {
            (CeremonyState::PasskeyAuthentication(auth), StoredCredential::Passkey(record)) => {
                let result = self
                    .webauthn
                    .finish_passkey_authentication(response, &auth)
                    .map_err(verification_error)?;
                check_sign_count(record.sign_count, result.counter())?;
                record.key.update_credential(&result);
                record.sign_count = result.counter();
                Ok(record.sign_count)
            }
            (CeremonyState::Fido2Authentication(auth), StoredCredential::Fido2(record)) => {
                let result = self
                    .webauthn
                    .finish_securitykey_authentication(response, &auth)
                    .map_err(verification_error)?;
                check_sign_count(record.sign_count, result.counter())?;
                record.key.update_credential(&result);
                record.sign_count = result.counter();
                Ok(record.sign_count)
            }
            _ => Err(Error::WrongChallengeType),
        }
    }

    pub(crate) fn purge_expired(&self) -> usize {
        self.challenges.purge_expired()
    }
}

/// Anti-clone defense: a counter that fails to advance while either side is
/// nonzero means the assertion came from a copy of the credential.
fn check_sign_count(stored: u32, new: u32) -> Result<()> {
    if (new != 0 || stored != 0) && new <= stored {
        warn!(stored, new, "sign counter did not advance; possible cloned authenticator");
        return Err(Error::VerificationFailed);
    }
    Ok(())
}

pub(crate) fn challenge_key(challenge: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(challenge)
}

fn config_error(err: WebauthnError) -> Error {
    Error::InvalidConfig(format!("cannot build WebAuthn context: {err}"))
}

fn verification_error(err: WebauthnError) -> Error {
    // Internal detail stays in the logs; callers only learn that it failed.
    debug!("webauthn verification error: {err}");
    Error::VerificationFailed
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ceremonies() -> WebauthnCeremonies {
        let config = VaultConfig::new()
            .with_relying_party("media.example", "https://media.example");
        WebauthnCeremonies::new(&config).unwrap()
    }

    fn dummy_register_response() -> RegisterPublicKeyCredential {
        serde_json::from_value(json!({
            "id": "dummy",
            "rawId": "AA",
            "type": "public-key",
            "response": {
                "attestationObject": "AA",
                "clientDataJSON": "AA"
            }
        }))
        .unwrap()
    }

    #[test]
    fn rejects_invalid_origin_configuration() {
        let config = VaultConfig::new().with_relying_party("media.example", "not a url");
        let err = WebauthnCeremonies::new(&config).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn registration_challenge_is_consumed_on_failure_too() {
        let service = ceremonies();
        let (_, key) = service
            .begin_registration("alice123", Attachment::Platform, Vec::new())
            .unwrap();

        // A garbage response fails verification but still consumes the entry.
        let err = service
            .complete_registration(&dummy_register_response(), &key)
            .unwrap_err();
        assert!(matches!(err, Error::VerificationFailed));

        let err = service
            .complete_registration(&dummy_register_response(), &key)
            .unwrap_err();
        assert!(matches!(err, Error::ChallengeNotFound));
    }

    #[test]
    fn challenge_key_is_base64url_of_the_options_challenge() {
        let service = ceremonies();
        let (options, key) = service
            .begin_registration("alice123", Attachment::CrossPlatform, Vec::new())
            .unwrap();
        assert_eq!(key, challenge_key(options.public_key.challenge.as_ref()));
    }

    #[test]
    fn sign_counter_must_advance_unless_both_sides_are_zero() {
        // Counter-less authenticators report zero forever.
        assert!(check_sign_count(0, 0).is_ok());
        assert!(check_sign_count(0, 1).is_ok());
        assert!(check_sign_count(41, 42).is_ok());
        // Regression or stall while counters are in use: cloned credential.
        assert!(check_sign_count(41, 41).is_err());
        assert!(check_sign_count(41, 40).is_err());
        assert!(check_sign_count(41, 0).is_err());
    }
}
