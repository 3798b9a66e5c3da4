//! # Encryption Module
//!
//! AES-256-GCM authenticated encryption for data at rest.
//!
//! Peer records and the node identity are sealed under the storage master
//! key before they touch the KV store; per-peer shared secrets are sealed
//! individually. Application payloads are NOT encrypted here; end-to-end
//! message encryption is outside this crate.
//!
//! ## Sealed Blob Format
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        SEALED BLOB FORMAT                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌──────────────┬──────────────────────────────┬──────────────────┐    │
//! │  │  nonce       │  ciphertext                  │  GCM tag         │    │
//! │  │  12 bytes    │  len(plaintext) bytes        │  16 bytes        │    │
//! │  └──────────────┴──────────────────────────────┴──────────────────┘    │
//! │                                                                         │
//! │  The nonce is random per seal; the storage key name is bound in as     │
//! │  associated data so blobs cannot be swapped between keys.              │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce as AesNonce,
};
use rand::RngCore;
use zeroize::ZeroizeOnDrop;

use crate::error::{Error, Result};

/// Size of the AES-GCM nonce in bytes (96 bits)
pub const NONCE_SIZE: usize = 12;

/// Size of the encryption key in bytes (256 bits)
pub const KEY_SIZE: usize = 32;

/// A nonce (number used once) for AES-GCM encryption
///
/// ## Critical Security Requirement
///
/// **NEVER reuse a nonce with the same key!** Random 96-bit nonces are
/// safe for up to 2^32 seals per key.
#[derive(Clone, Copy, Debug)]
pub struct Nonce(pub [u8; NONCE_SIZE]);

impl Nonce {
    /// Generate a cryptographically random nonce
    pub fn random() -> Self {
        let mut bytes = [0u8; NONCE_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Create from existing bytes
    pub fn from_bytes(bytes: [u8; NONCE_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.0
    }
}

/// An AES-256-GCM encryption key
///
/// Zeroized when dropped.
#[derive(ZeroizeOnDrop)]
pub struct EncryptionKey([u8; KEY_SIZE]);

impl EncryptionKey {
    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes (for key derivation / storage only)
    pub(crate) fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl Clone for EncryptionKey {
    fn clone(&self) -> Self {
        Self(self.0)
    }
}

/// Encrypt plaintext with AES-256-GCM
///
/// ## Parameters
///
/// - `key`: the 256-bit cipher key
/// - `plaintext`: the bytes to seal
/// - `associated_data`: authenticated but unencrypted context (we bind the
///   KV key name so blobs cannot be swapped between records)
///
/// ## Returns
///
/// The random nonce and the ciphertext (tag appended).
pub fn encrypt(
    key: &EncryptionKey,
    plaintext: &[u8],
    associated_data: &[u8],
) -> Result<(Nonce, Vec<u8>)> {
    let cipher = Aes256Gcm::new_from_slice(&key.0)
        .map_err(|e| Error::EncryptionFailed(format!("Invalid key: {}", e)))?;

    let nonce = Nonce::random();
    let ciphertext = cipher
        .encrypt(
            AesNonce::from_slice(&nonce.0),
            Payload { msg: plaintext, aad: associated_data },
        )
        .map_err(|e| Error::EncryptionFailed(e.to_string()))?;

    Ok((nonce, ciphertext))
}

/// Decrypt ciphertext with AES-256-GCM
///
/// Fails if the ciphertext was tampered with or the associated data does
/// not match what was bound at seal time.
pub fn decrypt(
    key: &EncryptionKey,
    nonce: &Nonce,
    ciphertext: &[u8],
    associated_data: &[u8],
) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(&key.0)
        .map_err(|e| Error::DecryptionFailed(format!("Invalid key: {}", e)))?;

    cipher
        .decrypt(
            AesNonce::from_slice(&nonce.0),
            Payload { msg: ciphertext, aad: associated_data },
        )
        .map_err(|_| Error::DecryptionFailed("Authentication failed".into()))
}

/// Seal plaintext into a single self-contained blob (nonce ‖ ciphertext)
pub fn seal_blob(key: &EncryptionKey, plaintext: &[u8], associated_data: &[u8]) -> Result<Vec<u8>> {
    let (nonce, ciphertext) = encrypt(key, plaintext, associated_data)?;
    let mut blob = nonce.as_bytes().to_vec();
    blob.extend_from_slice(&ciphertext);
    Ok(blob)
}

/// Open a blob produced by [`seal_blob`]
pub fn open_blob(key: &EncryptionKey, blob: &[u8], associated_data: &[u8]) -> Result<Vec<u8>> {
    if blob.len() < NONCE_SIZE {
        return Err(Error::DecryptionFailed("Blob too short".into()));
    }
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    nonce_bytes.copy_from_slice(&blob[..NONCE_SIZE]);
    decrypt(key, &Nonce::from_bytes(nonce_bytes), &blob[NONCE_SIZE..], associated_data)
}

// ============================================================================
// TESTS
// ============================================================================
