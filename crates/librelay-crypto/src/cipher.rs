//! Session primitive seams
//!
//! The ratchet cryptography (prekey processing, whisper message
//! encrypt/decrypt) lives in an external library; the pipelines compose
//! it through these traits. Implementations persist their state through
//! the store facade and must keep the session invariant: a record
//! either does not exist or holds a well-formed ratchet state.

use async_trait::async_trait;

use librelay_core::keys::{DeviceKeys, KeyRegistrationBundle};
use librelay_core::types::ProtocolAddress;

use crate::error::Result;

/// Wire type of a produced ciphertext
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum CiphertextType {
    /// Ratchet message within an established session
    Whisper = 1,
    /// Session-establishing message carrying prekey material
    PreKeyBundle = 3,
}

/// One device's ciphertext, ready for the send-messages call
#[derive(Clone, Debug)]
pub struct EncryptedMessage {
    pub msg_type: CiphertextType,
    pub registration_id: u32,
    pub body: Vec<u8>,
}

/// Per-device ratchet encrypt/decrypt over the stored sessions
#[async_trait]
pub trait SessionCipher: Send + Sync {
    /// Encrypt a padded body for the remote device
    async fn encrypt(&self, remote: &ProtocolAddress, padded: &[u8]) -> Result<EncryptedMessage>;

    /// Decrypt a CIPHERTEXT envelope body
    async fn decrypt_whisper_message(
        &self,
        remote: &ProtocolAddress,
        body: &[u8],
    ) -> Result<Vec<u8>>;

    /// Decrypt a PREKEY_BUNDLE envelope body, establishing the session
    /// as a side effect
    async fn decrypt_pre_key_whisper_message(
        &self,
        remote: &ProtocolAddress,
        body: &[u8],
    ) -> Result<Vec<u8>>;

    /// Whether an open session exists for the remote device
    async fn has_open_session(&self, remote: &ProtocolAddress) -> Result<bool>;

    /// Archive the open session. The record is retained so the device
    /// can be re-keyed without losing history; contrast with the
    /// store's `remove_session`.
    async fn close_open_session(&self, remote: &ProtocolAddress) -> Result<()>;
}

/// Establishes ratchet sessions from fetched prekey bundles
#[async_trait]
pub trait SessionBuilder: Send + Sync {
    /// Run the key agreement for one device and persist the resulting
    /// session. Fails with `UntrustedIdentity` when `identity_key`
    /// conflicts with the stored identity for the address.
    async fn process_pre_key_bundle(
        &self,
        remote: &ProtocolAddress,
        identity_key: &[u8],
        keys: &DeviceKeys,
    ) -> Result<()>;
}

/// Generates fresh prekey material for upload to the service
#[async_trait]
pub trait PreKeyProvider: Send + Sync {
    /// Generate a registration bundle, persisting the private halves
    /// through the store
    async fn generate_keys(&self) -> Result<KeyRegistrationBundle>;
}
