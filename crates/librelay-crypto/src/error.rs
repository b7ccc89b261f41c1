//! Error types for the session primitives
//!
//! The incoming pipeline's fault recovery keys on these variants:
//! duplicate counters are absorbed, untrusted identities become user
//! decisions, prekey faults trigger replenishment, and the remaining
//! session faults force a session reset.

use thiserror::Error;

use librelay_core::storage::StorageError;

/// Result type alias for cryptographic operations
pub type Result<T> = std::result::Result<T, CryptoError>;

/// Errors surfaced by the session cipher and builder primitives
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Message replays an already-consumed ratchet counter
    #[error("message with old or duplicate counter {0}")]
    MessageCounter(u32),

    /// The remote identity key does not match the stored one
    #[error("untrusted identity key for {addr}")]
    UntrustedIdentity { addr: String, identity_key: Vec<u8> },

    /// A referenced prekey is missing, consumed or exhausted
    #[error("prekey error: {0}")]
    PreKey(String),

    /// Ratchet session fault (missing session, bad chain state, ...)
    #[error("session error: {0}")]
    Session(String),

    /// Ciphertext could not be interpreted
    #[error("invalid ciphertext message: {0}")]
    InvalidMessage(String),

    /// MAC verification failed
    #[error("message authentication failed")]
    AuthenticationFailed,

    /// Key material has the wrong length
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    /// Underlying store access failed
    #[error("storage failure during cipher operation")]
    Storage(#[from] StorageError),
}

impl CryptoError {
    /// Whether the incoming pipeline should absorb this error silently
    /// (idempotent delivery of a replayed envelope)
    pub fn is_duplicate(&self) -> bool {
        matches!(self, CryptoError::MessageCounter(_))
    }
}
