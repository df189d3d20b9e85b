//! Runtime configuration for the identity core.
//!
//! Every knob has a safe default; [`VaultConfig::from_env`] layers
//! `SHELFGUARD_*` environment overrides on top for deployments that cannot
//! pass configuration programmatically.

use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_KEY_PATH: &str = "shelfguard.key";
const DEFAULT_DB_PATH: &str = "shelfguard.db";
const DEFAULT_RP_ID: &str = "localhost";
const DEFAULT_RP_NAME: &str = "Shelfguard";
const DEFAULT_RP_ORIGIN: &str = "http://localhost:8096";
const DEFAULT_TOTP_ISSUER: &str = "Shelfguard";
const DEFAULT_SESSION_TTL_SECONDS: i64 = 30 * 24 * 60 * 60;
const DEFAULT_SESSION_STALE_GRACE_SECONDS: i64 = 30 * 60;
const DEFAULT_LINK_TOKEN_TTL_SECONDS: i64 = 15 * 60;
const DEFAULT_CHALLENGE_TTL_SECONDS: u64 = 300;

const ENV_DEV_MODE: &str = "SHELFGUARD_DEV_MODE";
const ENV_KEY_PATH: &str = "SHELFGUARD_KEY_PATH";
const ENV_DB_PATH: &str = "SHELFGUARD_DB_PATH";
const ENV_RP_ID: &str = "SHELFGUARD_RP_ID";
const ENV_RP_NAME: &str = "SHELFGUARD_RP_NAME";
const ENV_RP_ORIGIN: &str = "SHELFGUARD_RP_ORIGIN";
const ENV_TOTP_ISSUER: &str = "SHELFGUARD_TOTP_ISSUER";
const ENV_SESSION_TTL_SECONDS: &str = "SHELFGUARD_SESSION_TTL_SECONDS";
const ENV_SESSION_STALE_GRACE_SECONDS: &str = "SHELFGUARD_SESSION_STALE_GRACE_SECONDS";
const ENV_CHALLENGE_TTL_SECONDS: &str = "SHELFGUARD_CHALLENGE_TTL_SECONDS";

#[derive(Clone, Debug)]
pub struct VaultConfig {
    dev_mode: bool,
    key_path: PathBuf,
    db_path: PathBuf,
    rp_id: String,
    rp_name: String,
    rp_origin: String,
    totp_issuer: String,
    session_ttl_seconds: i64,
    session_stale_grace_seconds: i64,
    claim_token_ttl_seconds: i64,
    recovery_token_ttl_seconds: i64,
    challenge_ttl: Duration,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            dev_mode: false,
            key_path: PathBuf::from(DEFAULT_KEY_PATH),
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            rp_id: DEFAULT_RP_ID.to_string(),
            rp_name: DEFAULT_RP_NAME.to_string(),
            rp_origin: DEFAULT_RP_ORIGIN.to_string(),
            totp_issuer: DEFAULT_TOTP_ISSUER.to_string(),
            session_ttl_seconds: DEFAULT_SESSION_TTL_SECONDS,
            session_stale_grace_seconds: DEFAULT_SESSION_STALE_GRACE_SECONDS,
            claim_token_ttl_seconds: DEFAULT_LINK_TOKEN_TTL_SECONDS,
            recovery_token_ttl_seconds: DEFAULT_LINK_TOKEN_TTL_SECONDS,
            challenge_ttl: Duration::from_secs(DEFAULT_CHALLENGE_TTL_SECONDS),
        }
    }
}

impl VaultConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build configuration from `SHELFGUARD_*` environment variables on top
    /// of the defaults.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(dev_mode) = parse_bool_env(ENV_DEV_MODE) {
            config.dev_mode = dev_mode;
        }
        if let Some(path) = non_empty_env(ENV_KEY_PATH) {
            config.key_path = PathBuf::from(path);
        }
        if let Some(path) = non_empty_env(ENV_DB_PATH) {
            config.db_path = PathBuf::from(path);
        }
        if let Some(rp_id) = non_empty_env(ENV_RP_ID) {
            config.rp_id = rp_id;
        }
        if let Some(rp_name) = non_empty_env(ENV_RP_NAME) {
            config.rp_name = rp_name;
        }
        if let Some(rp_origin) = non_empty_env(ENV_RP_ORIGIN) {
            config.rp_origin = rp_origin;
        }
        if let Some(issuer) = non_empty_env(ENV_TOTP_ISSUER) {
            config.totp_issuer = issuer;
        }
        if let Some(seconds) = parse_seconds_env(ENV_SESSION_TTL_SECONDS) {
            config.session_ttl_seconds = seconds;
        }
        if let Some(seconds) = parse_seconds_env(ENV_SESSION_STALE_GRACE_SECONDS) {
            config.session_stale_grace_seconds = seconds;
        }
        if let Some(seconds) = parse_seconds_env(ENV_CHALLENGE_TTL_SECONDS) {
            config.challenge_ttl = Duration::from_secs(seconds.unsigned_abs());
        }
        config
    }

    #[must_use]
    pub fn with_dev_mode(mut self, dev_mode: bool) -> Self {
        self.dev_mode = dev_mode;
        self
    }

    #[must_use]
    pub fn with_key_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.key_path = path.into();
        self
    }

    #[must_use]
    pub fn with_db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.db_path = path.into();
        self
    }

    #[must_use]
    pub fn with_relying_party(
        mut self,
        rp_id: impl Into<String>,
        rp_origin: impl Into<String>,
    ) -> Self {
        self.rp_id = rp_id.into();
        self.rp_origin = rp_origin.into();
        self
    }

    #[must_use]
    pub fn with_rp_name(mut self, rp_name: impl Into<String>) -> Self {
        self.rp_name = rp_name.into();
        self
    }

    #[must_use]
    pub fn with_totp_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.totp_issuer = issuer.into();
        self
    }

    #[must_use]
    pub fn with_session_ttl_seconds(mut self, seconds: i64) -> Self {
        self.session_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_session_stale_grace_seconds(mut self, seconds: i64) -> Self {
        self.session_stale_grace_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_claim_token_ttl_seconds(mut self, seconds: i64) -> Self {
        self.claim_token_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_recovery_token_ttl_seconds(mut self, seconds: i64) -> Self {
        self.recovery_token_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_challenge_ttl(mut self, ttl: Duration) -> Self {
        self.challenge_ttl = ttl;
        self
    }

    #[must_use]
    pub fn dev_mode(&self) -> bool {
        self.dev_mode
    }

    #[must_use]
    pub fn key_path(&self) -> &PathBuf {
        &self.key_path
    }

    #[must_use]
    pub fn db_path(&self) -> &PathBuf {
        &self.db_path
    }

    #[must_use]
    pub fn rp_id(&self) -> &str {
        &self.rp_id
    }

    #[must_use]
    pub fn rp_name(&self) -> &str {
        &self.rp_name
    }

    #[must_use]
    pub fn rp_origin(&self) -> &str {
        &self.rp_origin
    }

    #[must_use]
    pub fn totp_issuer(&self) -> &str {
        &self.totp_issuer
    }

    #[must_use]
    pub fn session_ttl_seconds(&self) -> i64 {
        self.session_ttl_seconds
    }

    #[must_use]
    pub fn session_stale_grace_seconds(&self) -> i64 {
        self.session_stale_grace_seconds
    }

    #[must_use]
    pub fn claim_token_ttl_seconds(&self) -> i64 {
        self.claim_token_ttl_seconds
    }

    #[must_use]
    pub fn recovery_token_ttl_seconds(&self) -> i64 {
        self.recovery_token_ttl_seconds
    }

    #[must_use]
    pub fn challenge_ttl(&self) -> Duration {
        self.challenge_ttl
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_seconds_env(key: &str) -> Option<i64> {
    non_empty_env(key)
        .and_then(|value| value.parse::<i64>().ok())
        .filter(|value| *value > 0)
}

fn parse_bool_env(key: &str) -> Option<bool> {
    non_empty_env(key).and_then(|value| match value.as_str() {
        "1" | "true" | "TRUE" | "yes" | "YES" => Some(true),
        "0" | "false" | "FALSE" | "no" | "NO" => Some(false),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_production_safe() {
        let config = VaultConfig::default();
        assert!(!config.dev_mode());
        assert_eq!(config.session_stale_grace_seconds(), 30 * 60);
        assert_eq!(config.claim_token_ttl_seconds(), 15 * 60);
        assert_eq!(config.challenge_ttl(), Duration::from_secs(300));
    }

    #[test]
    fn builder_overrides_stick() {
        let config = VaultConfig::new()
            .with_dev_mode(true)
            .with_relying_party("media.example", "https://media.example")
            .with_session_ttl_seconds(3600);
        assert!(config.dev_mode());
        assert_eq!(config.rp_id(), "media.example");
        assert_eq!(config.rp_origin(), "https://media.example");
        assert_eq!(config.session_ttl_seconds(), 3600);
    }
}
