//! Master key management for the encrypted store.
//!
//! The key is 256 bits, stored on disk as 64 hex characters. A missing key
//! file is generated with a CSPRNG and written with owner-only permissions;
//! an existing file must already carry mode 0600 outside development mode.

use std::fmt;
use std::fs;
use std::io::Write;
use std::path::Path;

use rand::rngs::OsRng;
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use tracing::info;

use crate::error::KeyError;

const KEY_HEX_LEN: usize = 64;
const KEY_FILE_MODE: u32 = 0o600;

/// The at-rest encryption key, held as its hex rendering.
///
/// The raw value is only reachable through [`MasterKey::expose`]; `Debug`
/// output is redacted so the key cannot leak through logs.
pub struct MasterKey {
    hex: SecretString,
}

impl MasterKey {
    fn from_hex(hex: String) -> Result<Self, KeyError> {
        if hex.len() != KEY_HEX_LEN || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(KeyError::InvalidFormat);
        }
        Ok(Self { hex: hex.into() })
    }

    /// Hex rendering of the key, for the SQLCipher `PRAGMA key` statement.
    pub(crate) fn expose(&self) -> &str {
        self.hex.expose_secret()
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterKey(..)")
    }
}

pub struct KeyManager;

impl KeyManager {
    /// Load the key from `path`, generating and persisting a fresh one when
    /// the file does not exist. The key is loaded once; callers keep the
    /// returned handle for the process lifetime.
    ///
    /// # Errors
    /// Returns [`KeyError::InsecurePermissions`] when the existing file is
    /// not mode 0600 and `dev_mode` is off, [`KeyError::InvalidFormat`] when
    /// the contents are not exactly 64 hex characters, and [`KeyError::Io`]
    /// on filesystem failures.
    pub fn load_or_generate(path: &Path, dev_mode: bool) -> Result<MasterKey, KeyError> {
        if path.exists() {
            Self::load(path, dev_mode)
        } else {
            Self::generate(path)
        }
    }

    fn load(path: &Path, dev_mode: bool) -> Result<MasterKey, KeyError> {
        #[cfg(unix)]
        if !dev_mode {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(path)?.permissions().mode() & 0o777;
            if mode != KEY_FILE_MODE {
                return Err(KeyError::InsecurePermissions {
                    path: path.to_path_buf(),
                    mode,
                });
            }
        }
        #[cfg(not(unix))]
        let _ = dev_mode;

        let contents = fs::read_to_string(path)?;
        MasterKey::from_hex(contents.trim().to_string())
    }

    fn generate(path: &Path) -> Result<MasterKey, KeyError> {
        let mut raw = [0u8; KEY_HEX_LEN / 2];
        OsRng.fill_bytes(&mut raw);
        let hex = hex::encode(raw);

        let mut options = fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(KEY_FILE_MODE);
        }
        let mut file = options.open(path)?;
        file.write_all(hex.as_bytes())?;
        file.write_all(b"\n")?;

        info!(path = %path.display(), "generated new master key");
        MasterKey::from_hex(hex)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn generates_and_reloads_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("master.key");

        let generated = KeyManager::load_or_generate(&path, false).unwrap();
        let reloaded = KeyManager::load_or_generate(&path, false).unwrap();
        assert_eq!(generated.expose(), reloaded.expose());
        assert_eq!(generated.expose().len(), KEY_HEX_LEN);
    }

    #[cfg(unix)]
    #[test]
    fn generated_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("master.key");
        KeyManager::load_or_generate(&path, false).unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[cfg(unix)]
    #[test]
    fn rejects_world_readable_key_outside_dev_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("master.key");
        KeyManager::load_or_generate(&path, false).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();

        let err = KeyManager::load_or_generate(&path, false).unwrap_err();
        assert!(matches!(err, KeyError::InsecurePermissions { mode, .. } if mode == 0o644));

        // Development mode skips the permission gate but keeps the format check.
        assert!(KeyManager::load_or_generate(&path, true).is_ok());
    }

    #[test]
    fn rejects_malformed_key_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("master.key");
        fs::write(&path, "not-a-key\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o600)).unwrap();
        }

        let err = KeyManager::load_or_generate(&path, false).unwrap_err();
        assert!(matches!(err, KeyError::InvalidFormat));
    }

    #[test]
    fn debug_output_is_redacted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("master.key");
        let key = KeyManager::load_or_generate(&path, false).unwrap();
        assert_eq!(format!("{key:?}"), "MasterKey(..)");
    }
}
