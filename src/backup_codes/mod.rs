//! Single-use backup codes for account recovery.
//!
//! Codes are four groups of four symbols from a 32-symbol alphabet that
//! drops the visually confusable 0/O and 1/I, giving 80 bits of entropy per
//! code. Only SHA-256 digests are persisted; consumption marks the matched
//! digest used inside the transaction that found it, so two concurrent uses
//! of the same code can never both succeed.

pub(crate) mod repo;

use std::sync::Arc;

use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::store::EncryptedStore;

pub const DEFAULT_BATCH_SIZE: usize = 8;

const CODE_LEN: usize = 16;
const GROUP_SIZE: usize = 4;
// Uppercase letters and digits minus 0/O and 1/I.
const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

pub struct BackupCodeVault {
    store: Arc<EncryptedStore>,
}

impl BackupCodeVault {
    #[must_use]
    pub fn new(store: Arc<EncryptedStore>) -> Self {
        Self { store }
    }

    /// Issue a fresh batch, dropping any unused codes from earlier batches
    /// (used codes stay behind as history). The raw codes are returned
    /// exactly once and are never retrievable again.
    ///
    /// # Errors
    /// Returns storage errors.
    pub fn issue(&self, user_id: Uuid, count: usize) -> Result<Vec<String>> {
        self.store.with_txn(|conn| issue_codes(conn, user_id, count))
    }

    /// Verify a code and, when it matches, mark it used in the same
    /// transaction. Returns `false` for malformed, unknown, and already-used
    /// codes alike.
    ///
    /// # Errors
    /// Returns storage errors.
    pub fn verify_and_consume(&self, user_id: Uuid, code: &str) -> Result<bool> {
        self.store
            .with_txn(|conn| consume_code(conn, user_id, code))
    }

    /// How many unused codes the user has left.
    ///
    /// # Errors
    /// Returns storage errors.
    pub fn remaining_count(&self, user_id: Uuid) -> Result<usize> {
        self.store
            .with_conn(|conn| repo::count_unused(conn, user_id))
    }
}

/// Batch issuance inside an existing transaction; the registration and
/// recovery workflows call this as part of their own atomic operation.
pub(crate) fn issue_codes(
    conn: &rusqlite::Connection,
    user_id: Uuid,
    count: usize,
) -> Result<Vec<String>> {
    repo::delete_unused(conn, user_id)?;

    let mut codes = Vec::with_capacity(count);
    for _ in 0..count {
        let code = generate_code();
        repo::insert(conn, user_id, &hash_code(&strip_code(&code)))?;
        codes.push(code);
    }

    info!(%user_id, count, "issued backup codes");
    Ok(codes)
}

/// Single-use consumption inside an existing transaction.
pub(crate) fn consume_code(
    conn: &rusqlite::Connection,
    user_id: Uuid,
    code: &str,
) -> Result<bool> {
    let Some(normalized) = normalize_code(code) else {
        return Ok(false);
    };
    let hash = hash_code(&normalized);

    // Scan every unused digest with a constant-time compare; no early exit,
    // so one candidate costs the same whether it matches or not.
    let mut matched = None;
    for (id, stored) in repo::unused_hashes(conn, user_id)? {
        if bool::from(stored.as_slice().ct_eq(hash.as_slice())) {
            matched = Some(id);
        }
    }

    match matched {
        Some(id) => Ok(repo::mark_used(conn, id)?),
        None => {
            warn!(%user_id, "rejected backup code");
            Ok(false)
        }
    }
}

/// Generate one code in display form (`XXXX-XXXX-XXXX-XXXX`).
fn generate_code() -> String {
    let mut raw = [0u8; CODE_LEN];
    OsRng.fill_bytes(&mut raw);

    let mut code = String::with_capacity(CODE_LEN + CODE_LEN / GROUP_SIZE - 1);
    for (idx, byte) in raw.iter().enumerate() {
        if idx > 0 && idx % GROUP_SIZE == 0 {
            code.push('-');
        }
        let symbol = CODE_ALPHABET[usize::from(*byte) % CODE_ALPHABET.len()];
        code.push(symbol as char);
    }
    code
}

/// Normalize user input: uppercase, strip separators and spaces, then
/// require the exact length and alphabet.
fn normalize_code(input: &str) -> Option<String> {
    let normalized: String = input
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_uppercase())
        .collect();

    let valid = normalized.len() == CODE_LEN
        && normalized.bytes().all(|b| CODE_ALPHABET.contains(&b));
    valid.then_some(normalized)
}

fn strip_code(display: &str) -> String {
    display.chars().filter(|c| *c != '-').collect()
}

fn hash_code(normalized: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    hasher.finalize().to_vec()
}
