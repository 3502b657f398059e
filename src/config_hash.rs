// Deterministic fingerprint of a reconciler's tracked-entity configuration.
//
// Completion rows are keyed by this hash: changing the tracked set changes the
// hash and invalidates every previously reconciled timestamp, because "nothing
// to fetch" under the old set may be "data missing" under the new one.

use anyhow::Result;
use ethers::utils::keccak256;
use serde::Serialize;
use std::fmt;

/// keccak256 over the canonical JSON serialization of the ordered entity set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConfigHash(pub [u8; 32]);

impl ConfigHash {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let raw = hex::decode(s.trim_start_matches("0x"))?;
        anyhow::ensure!(raw.len() == 32, "config hash must be 32 bytes");
        let mut out = [0u8; 32];
        out.copy_from_slice(&raw);
        Ok(ConfigHash(out))
    }
}

impl fmt::Display for ConfigHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Hashes the ordered tracked-entity set. Serialization goes through
/// `serde_json` so two runs with an identical configuration always produce the
/// same hash across process restarts.
pub fn config_hash<T: Serialize>(entries: &[T]) -> Result<ConfigHash> {
    let canonical = serde_json::to_vec(entries)?;
    Ok(ConfigHash(keccak256(canonical)))
}
