//! Cryptographic seams for the librelay messaging client
//!
//! The ratchet/session primitives are an external library; this crate
//! defines the traits the pipelines compose them through, the error
//! taxonomy their faults surface as, and the concrete signaling-key
//! frame crypto for the streaming transport.

pub mod cipher;
pub mod error;
pub mod signaling;

pub use cipher::{
    CiphertextType, EncryptedMessage, PreKeyProvider, SessionBuilder, SessionCipher,
};
pub use error::{CryptoError, Result};
pub use signaling::{SignalingKey, SIGNALING_KEY_LEN};
