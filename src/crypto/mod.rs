//! # Cryptography Module
//!
//! Cryptographic primitives behind the mesh overlay.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    CRYPTOGRAPHIC ARCHITECTURE                           │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Signing (Ed25519; ECDSA-P256 accepted on verify)                      │
//! │  ────────────────────────────────────────────────                       │
//! │  • Identity exchange messages                                          │
//! │  • Presence / ip-change announcements                                  │
//! │  • Relay envelopes                                                     │
//! │                                                                         │
//! │  Key agreement (ECDH P-256)                                            │
//! │  ──────────────────────────                                             │
//! │  • Per-peer shared secret during identity exchange                     │
//! │                                                                         │
//! │  Encryption at rest (AES-256-GCM)                                      │
//! │  ────────────────────────────────                                       │
//! │  • Node identity blob, trust store, peer-record secrets                │
//! │  • Master key derived via HKDF-SHA256 from persisted local entropy     │
//! │                                                                         │
//! │  Canonical serialization                                               │
//! │  ───────────────────────                                                │
//! │  • Lexicographic key order for every signed or hashed payload          │
//! │  • SHA-256 hashes, decimal-digit-group key fingerprints                │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Algorithm Choices & Rationale
//!
//! | Algorithm | Purpose | Why Chosen |
//! |-----------|---------|------------|
//! | Ed25519 | Signing | Fast, small keys, widely audited |
//! | ECDSA-P256 | Verify fallback | Interop with platforms lacking Ed25519 |
//! | ECDH P-256 | Key agreement | Same curve as the fallback, ubiquitous |
//! | AES-256-GCM | At-rest encryption | Hardware acceleration, AEAD |
//! | HKDF-SHA256 | Key derivation | Industry standard, well-analyzed |
//!
//! ## Security Considerations
//!
//! 1. **Key Zeroization**: secret keys are zeroized when dropped
//! 2. **Secure Random**: `rand::rngs::OsRng` for all key and nonce material
//! 3. **No Nonce Reuse**: random nonce per seal
//! 4. **Determinism where it matters**: canonical bytes, never ambient
//!    serializer key order, feed every signature and hash

pub mod canonical;
mod encryption;
pub mod kdf;
mod keys;
mod signing;

pub use encryption::{
    decrypt, encrypt, open_blob, seal_blob, EncryptionKey, Nonce, KEY_SIZE, NONCE_SIZE,
};
pub use keys::{EcdhKeyPair, KeyPair, PublicKey, SignatureAlgorithm, SigningKeyPair};
pub use signing::{sign, verify, Signature, SIGNATURE_SIZE};

/// Size of Ed25519 public keys in bytes
pub const ED25519_PUBLIC_KEY_SIZE: usize = 32;

/// Size of SEC1-compressed P-256 public keys in bytes
pub const P256_PUBLIC_KEY_SIZE: usize = 33;
