//! # Error Handling
//!
//! This module provides the error types for Tether Core.
//!
//! ## Error Hierarchy
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           ERROR HIERARCHY                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Error (top-level)                                                     │
//! │  │                                                                      │
//! │  ├── Lifecycle Errors                                                  │
//! │  │   ├── NotStarted             - Component not started                │
//! │  │   ├── AlreadyStarted         - Component already started            │
//! │  │   └── ShutdownInProgress     - Core is shutting down                │
//! │  │                                                                      │
//! │  ├── Identity Errors                                                   │
//! │  │   ├── NoIdentity             - No identity loaded                   │
//! │  │   ├── KeyDerivationFailed    - Failed to derive storage key         │
//! │  │   └── UnsupportedAlgorithm   - Unknown signature algorithm          │
//! │  │                                                                      │
//! │  ├── Crypto Errors                                                     │
//! │  │   ├── EncryptionFailed       - AES-GCM encryption failed            │
//! │  │   ├── DecryptionFailed       - AES-GCM decryption failed            │
//! │  │   ├── VerificationFailed     - Signature verification failed        │
//! │  │   ├── InvalidKey             - Invalid key format/length            │
//! │  │   └── KeyExchangeFailed      - ECDH agreement failed                │
//! │  │                                                                      │
//! │  ├── Storage Errors                                                    │
//! │  │   ├── StorageReadError       - Failed to read from the KV store     │
//! │  │   ├── StorageWriteError      - Failed to write to the KV store      │
//! │  │   ├── StorageNotFound        - Key not present in the KV store      │
//! │  │   └── StorageCorrupted       - Stored data failed to decode         │
//! │  │                                                                      │
//! │  ├── Transport Errors                                                  │
//! │  │   ├── NotConnected           - No live channel to the peer          │
//! │  │   ├── ConnectionFailed       - Transport never reached connected    │
//! │  │   ├── Timeout                - Deadline expired                     │
//! │  │   └── TransportError         - Collaborator-reported failure        │
//! │  │                                                                      │
//! │  ├── Reconnection Errors                                               │
//! │  │   ├── NoPathFound            - Path query produced no relay         │
//! │  │   ├── AlreadyConnected       - Target is already a live peer        │
//! │  │   ├── TooManyConcurrentAttempts                                     │
//! │  │   ├── CollisionDetected      - Both sides offered simultaneously    │
//! │  │   └── ReconnectRejected      - Remote declined the offer            │
//! │  │                                                                      │
//! │  └── Security Errors                                                   │
//! │      ├── KeyMismatch            - TOFU pin violated (never auto-fixed) │
//! │      └── Verification           - Wrapped VerifyFailure tag            │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Negative verification outcomes are *values*, not errors: [`VerifyFailure`]
//! carries exactly the reason tags the authentication layer reports, so that
//! callers drop the artefact and bump a counter instead of unwinding. Only
//! the TOFU pin violation is promoted to a hard [`Error::KeyMismatch`].

use thiserror::Error;

/// Result type alias for Tether Core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Tether Core
///
/// All errors are categorized by module/domain to make error handling
/// clearer and to provide meaningful error messages to users.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Lifecycle Errors (100-199)
    // ========================================================================

    /// Component has not been started
    #[error("Component has not been started. Call start() first.")]
    NotStarted,

    /// Component has already been started
    #[error("Component has already been started.")]
    AlreadyStarted,

    /// Core is shutting down
    #[error("Tether Core is shutting down.")]
    ShutdownInProgress,

    // ========================================================================
    // Identity Errors (200-299)
    // ========================================================================

    /// No identity has been loaded
    #[error("No identity loaded. Create or load an identity first.")]
    NoIdentity,

    /// Key derivation failed
    #[error("Failed to derive keys: {0}")]
    KeyDerivationFailed(String),

    /// Unsupported signature algorithm (fatal on init)
    #[error("Unsupported signature algorithm: {0}")]
    UnsupportedAlgorithm(String),

    // ========================================================================
    // Crypto Errors (300-399)
    // ========================================================================

    /// Encryption failed
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    /// Decryption failed
    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    /// Signing failed
    #[error("Signing failed: {0}")]
    SigningFailed(String),

    /// Signature verification failed
    #[error("Signature verification failed")]
    VerificationFailed,

    /// Invalid key format or length
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Key exchange failed
    #[error("Key exchange failed: {0}")]
    KeyExchangeFailed(String),

    // ========================================================================
    // Storage Errors (400-499)
    // ========================================================================

    /// Failed to read from the KV store
    #[error("Failed to read from storage: {0}")]
    StorageReadError(String),

    /// Failed to write to the KV store
    #[error("Failed to write to storage: {0}")]
    StorageWriteError(String),

    /// Key not present in the KV store
    #[error("Item not found: {0}")]
    StorageNotFound(String),

    /// Stored data failed to decode
    #[error("Data corruption detected: {0}")]
    StorageCorrupted(String),

    // ========================================================================
    // Transport Errors (500-599)
    // ========================================================================

    /// No live channel to the peer
    #[error("Not connected to peer: {0}")]
    NotConnected(String),

    /// Transport never reached the connected state
    #[error("Failed to connect to peer: {0}")]
    ConnectionFailed(String),

    /// Operation timed out
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Collaborator-reported transport failure
    #[error("Transport error: {0}")]
    TransportError(String),

    // ========================================================================
    // Reconnection Errors (600-699)
    // ========================================================================

    /// Path query produced no relay
    #[error("No path found to peer: {0}")]
    NoPathFound(String),

    /// Target is already a live peer
    #[error("Already connected to peer: {0}")]
    AlreadyConnected(String),

    /// Concurrent attempt cap reached
    #[error("Too many concurrent reconnection attempts")]
    TooManyConcurrentAttempts,

    /// Both sides offered simultaneously; the lower id wins
    #[error("Reconnection collision detected with peer: {0}")]
    CollisionDetected(String),

    /// Remote declined the offer
    #[error("Reconnection rejected by peer {peer_id}: {reason}")]
    ReconnectRejected {
        /// The rejecting peer
        peer_id: String,
        /// The remote's stated reason
        reason: String,
    },

    // ========================================================================
    // Security Errors (700-799)
    // ========================================================================

    /// A peer presented a signing key that differs from the pinned one.
    /// This is never auto-resolved; the host application must ask the
    /// operator.
    #[error("Key mismatch for peer {peer_id}: pinned key differs from presented key")]
    KeyMismatch {
        /// The peer whose pin was violated
        peer_id: String,
    },

    /// A negative verification outcome propagated as an error
    #[error("Verification failed: {0}")]
    Verification(VerifyFailure),

    // ========================================================================
    // Internal Errors (900-999)
    // ========================================================================

    /// Internal error (should not happen in normal operation)
    #[error("Internal error: {0}")]
    Internal(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Deserialization error
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
}

/// Reason tags for negative verification results.
///
/// These are returned as values from the authentication layer (`auth`),
/// never raised: the caller drops the offending artefact and increments a
/// security counter. The snake_case tag names are part of the external
/// interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VerifyFailure {
    /// Signer is not in the trust store
    UnknownPeer,
    /// Timestamp outside the acceptance window (past or future)
    TimestampOutOfRange,
    /// Nonce already seen within its TTL window
    NonceReused,
    /// Sequence number did not strictly increase
    SequenceNotIncremented,
    /// Signature did not verify under the pinned key
    InvalidSignature,
    /// Relay wrapping exceeded the maximum depth
    RelayChainTooLong,
    /// Relaying peer is not in the trust store
    UntrustedRelay,
    /// Relay signature did not verify
    InvalidRelaySignature,
    /// Relay timestamp is too far in the past
    RelayTooOld,
    /// Relay timestamp precedes the original announcement
    RelayBeforeOriginal,
}

impl VerifyFailure {
    /// The stable snake_case tag for this failure
    pub fn as_str(&self) -> &'static str {
        match self {
            VerifyFailure::UnknownPeer => "unknown_peer",
            VerifyFailure::TimestampOutOfRange => "timestamp_out_of_range",
            VerifyFailure::NonceReused => "nonce_reused",
            VerifyFailure::SequenceNotIncremented => "sequence_number_not_incremented",
            VerifyFailure::InvalidSignature => "invalid_signature",
            VerifyFailure::RelayChainTooLong => "relay_chain_too_long",
            VerifyFailure::UntrustedRelay => "untrusted_relay",
            VerifyFailure::InvalidRelaySignature => "invalid_relay_signature",
            VerifyFailure::RelayTooOld => "relay_too_old",
            VerifyFailure::RelayBeforeOriginal => "relay_before_original",
        }
    }
}

impl std::fmt::Display for VerifyFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    /// Get the stable numeric code for this error
    ///
    /// Error codes are organized by category:
    /// - 100-199: Lifecycle
    /// - 200-299: Identity
    /// - 300-399: Crypto
    /// - 400-499: Storage
    /// - 500-599: Transport
    /// - 600-699: Reconnection
    /// - 700-799: Security
    /// - 900-999: Internal
    pub fn code(&self) -> i32 {
        match self {
            // Lifecycle (100-199)
            Error::NotStarted => 100,
            Error::AlreadyStarted => 101,
            Error::ShutdownInProgress => 102,

            // Identity (200-299)
            Error::NoIdentity => 200,
            Error::KeyDerivationFailed(_) => 201,
            Error::UnsupportedAlgorithm(_) => 202,

            // Crypto (300-399)
            Error::EncryptionFailed(_) => 300,
            Error::DecryptionFailed(_) => 301,
            Error::SigningFailed(_) => 302,
            Error::VerificationFailed => 303,
            Error::InvalidKey(_) => 304,
            Error::KeyExchangeFailed(_) => 305,

            // Storage (400-499)
            Error::StorageReadError(_) => 400,
            Error::StorageWriteError(_) => 401,
            Error::StorageNotFound(_) => 402,
            Error::StorageCorrupted(_) => 403,

            // Transport (500-599)
            Error::NotConnected(_) => 500,
            Error::ConnectionFailed(_) => 501,
            Error::Timeout(_) => 502,
            Error::TransportError(_) => 503,

            // Reconnection (600-699)
            Error::NoPathFound(_) => 600,
            Error::AlreadyConnected(_) => 601,
            Error::TooManyConcurrentAttempts => 602,
            Error::CollisionDetected(_) => 603,
            Error::ReconnectRejected { .. } => 604,

            // Security (700-799)
            Error::KeyMismatch { .. } => 700,
            Error::Verification(_) => 701,

            // Internal (900-999)
            Error::Internal(_) => 900,
            Error::SerializationError(_) => 901,
            Error::DeserializationError(_) => 902,
        }
    }

    /// Check if this error is recoverable
    ///
    /// Recoverable errors can potentially be resolved by retrying
    /// or by waiting for the mesh to change.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_)
                | Error::ConnectionFailed(_)
                | Error::NotConnected(_)
                | Error::NoPathFound(_)
                | Error::TooManyConcurrentAttempts
                | Error::CollisionDetected(_)
                | Error::StorageReadError(_)
                | Error::StorageWriteError(_)
        )
    }

    /// Check if this error must be surfaced to the operator
    ///
    /// Security errors are never auto-resolved by the core.
    pub fn is_security_alert(&self) -> bool {
        matches!(self, Error::KeyMismatch { .. })
    }
}

// ============================================================================
// ERROR CONVERSIONS
// ============================================================================

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::SerializationError(err.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::SerializationError(err.to_string())
    }
}

impl From<VerifyFailure> for Error {
    fn from(failure: VerifyFailure) -> Self {
        Error::Verification(failure)
    }
}

// ============================================================================
// TESTS
// ============================================================================
