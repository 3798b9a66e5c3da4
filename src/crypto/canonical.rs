//! # Canonical Serialization
//!
//! Deterministic JSON byte production for everything that is hashed or
//! signed. The rule is a hard interface: object keys are serialized in
//! lexicographic order at every nesting level, so the same value produces
//! the same bytes on every run, platform, and peer.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     CANONICALIZATION PIPELINE                           │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │   T: Serialize ──► serde_json::Value ──► compact JSON bytes            │
//! │                    (object maps are                                    │
//! │                     ordered by key)                                    │
//! │                                                                         │
//! │   Signed payloads:  sign( canonical_bytes(payload) )                   │
//! │   Hashed payloads:  SHA256( canonical_bytes(payload) )                 │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Relying on a struct's field order would silently break the moment a
//! field is reordered; routing through `serde_json::Value` (whose object
//! map is key-ordered) removes that hazard.

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::Result;

/// Serialize a value to canonical JSON bytes
///
/// Keys are lexicographically ordered at every nesting level; output is
/// compact (no whitespace). Array order is preserved.
pub fn to_canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    // serde_json::Value's object map is a BTreeMap, so re-serializing
    // through Value yields sorted keys at every depth.
    let value = serde_json::to_value(value)?;
    Ok(serde_json::to_vec(&value)?)
}

/// SHA-256 over the canonical JSON bytes of a value
pub fn sha256_canonical<T: Serialize>(value: &T) -> Result<[u8; 32]> {
    let bytes = to_canonical_bytes(value)?;
    Ok(Sha256::digest(&bytes).into())
}

/// SHA-256 over the canonical bytes, hex-encoded (for wire hashes)
pub fn sha256_canonical_hex<T: Serialize>(value: &T) -> Result<String> {
    Ok(hex::encode(sha256_canonical(value)?))
}

/// Number of decimal digit groups in a rendered fingerprint
const FINGERPRINT_GROUPS: usize = 8;

/// Render a key fingerprint for out-of-band comparison
///
/// The SHA-256 of the canonical key encoding is rendered as eight
/// five-digit decimal groups, e.g. `01234 56789 ...`. Decimal groups are
/// easier to read over a phone call than hex.
pub fn fingerprint<T: Serialize>(value: &T) -> Result<String> {
    let digest = sha256_canonical(value)?;
    let groups: Vec<String> = digest
        .chunks(2)
        .take(FINGERPRINT_GROUPS)
        .map(|pair| format!("{:05}", u16::from_be_bytes([pair[0], pair[1]])))
        .collect();
    Ok(groups.join(" "))
}

// ============================================================================
// TESTS
// ============================================================================
