//! Deterministic session id derivation.
//!
//! A session id has a deterministic half (a hash of the goal and the
//! canonicalized working directory, so two runs against the same goal and
//! workdir agree) and a unique half (a caller-supplied timestamp, since
//! this module may not read the clock itself).

use sha2::{Digest, Sha256};

/// The deterministic half: first 16 hex characters of `sha256(goal ||
/// '\0' || workdir)`.
pub fn deterministic_half(goal: &str, canonical_workdir: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(goal.as_bytes());
    hasher.update([0u8]);
    hasher.update(canonical_workdir.as_bytes());
    let digest = hasher.finalize();
    hex::encode(digest)[..16].to_string()
}

/// A full session id: `<deterministic_half>-<unix_timestamp_millis>`.
pub fn derive(goal: &str, canonical_workdir: &str, unix_timestamp_millis: u128) -> String {
    format!("{}-{unix_timestamp_millis}", deterministic_half(goal, canonical_workdir))
}

/// The deterministic half of a full session id, if it parses as one this
/// module produced.
pub fn deterministic_half_of(session_id: &str) -> Option<&str> {
    session_id.split('-').next()
}
