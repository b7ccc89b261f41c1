//! Session store facade
//!
//! Uniform interface over the persistent store for process state,
//! sessions, identity keys, prekeys and the blocked-sender set. The
//! pipelines hold no cryptographic state of their own; everything flows
//! through these traits. Backends must provide per-key atomicity for
//! session records, identity keys and prekey sets.

pub mod config;
pub mod memory;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use thiserror::Error;

use crate::types::{Address, DeviceId};

pub use config::{StorageBacking, StorageConfig};
pub use memory::MemoryStorage;

/// Result type alias for store operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Store access failure
#[derive(Debug, Error)]
pub enum StorageError {
    /// Backend rejected or failed the operation
    #[error("storage backend failure: {0}")]
    Backend(String),

    /// A required process-state key is absent
    #[error("missing state key: {0}")]
    MissingState(&'static str),

    /// A stored value could not be interpreted
    #[error("corrupt stored value for {key}: {reason}")]
    CorruptValue { key: String, reason: String },

    /// Filesystem backend I/O failure
    #[error("storage io error")]
    Io(#[from] std::io::Error),
}

/// Scalar process state: own address, device id, credentials, signaling
/// key
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get_state(&self, key: &str) -> StorageResult<Option<String>>;
    async fn put_state(&self, key: &str, value: &str) -> StorageResult<()>;
    async fn remove_state(&self, key: &str) -> StorageResult<()>;
}

/// Session records keyed by the encoded `"<addr>.<deviceId>"` pair.
///
/// Records are opaque here; only the session cipher primitives interpret
/// them. A record either does not exist or holds a well-formed ratchet
/// state.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Sorted device ids with a stored session for `addr`; may be empty
    async fn get_device_ids(&self, addr: &Address) -> StorageResult<Vec<DeviceId>>;
    async fn load_session(&self, encoded_addr: &str) -> StorageResult<Option<Vec<u8>>>;
    async fn store_session(&self, encoded_addr: &str, record: &[u8]) -> StorageResult<()>;
    async fn remove_session(&self, encoded_addr: &str) -> StorageResult<()>;
}

/// Remote identity keys, keyed by address
#[async_trait]
pub trait IdentityStore: Send + Sync {
    async fn get_identity(&self, addr: &Address) -> StorageResult<Option<Vec<u8>>>;
    async fn save_identity(&self, addr: &Address, identity_key: &[u8]) -> StorageResult<()>;
    async fn remove_identity(&self, addr: &Address) -> StorageResult<()>;

    /// Trust-on-first-use check: an unknown address is trusted, a known
    /// one must match the stored key
    async fn is_trusted_identity(
        &self,
        addr: &Address,
        identity_key: &[u8],
    ) -> StorageResult<bool>;
}

/// One-time and signed prekey records consumed by the cipher primitives
#[async_trait]
pub trait PreKeyStore: Send + Sync {
    async fn load_pre_key(&self, key_id: u32) -> StorageResult<Option<Vec<u8>>>;
    async fn store_pre_key(&self, key_id: u32, record: &[u8]) -> StorageResult<()>;
    async fn remove_pre_key(&self, key_id: u32) -> StorageResult<()>;
    async fn load_signed_pre_key(&self, key_id: u32) -> StorageResult<Option<Vec<u8>>>;
    async fn store_signed_pre_key(&self, key_id: u32, record: &[u8]) -> StorageResult<()>;
}

/// Persistent set of blocked sender addresses. Read-only from the
/// receiving pipeline's perspective.
#[async_trait]
pub trait BlockedStore: Send + Sync {
    async fn is_blocked(&self, addr: &Address) -> StorageResult<bool>;
}

/// The full store facade consumed by the pipelines
#[async_trait]
pub trait Storage:
    StateStore + SessionStore + IdentityStore + PreKeyStore + BlockedStore
{
    async fn initialize(&self) -> StorageResult<()>;
    async fn shutdown(&self) -> StorageResult<()>;
}

/// Well-known process-state keys
pub mod state_keys {
    pub const ADDR: &str = "addr";
    pub const DEVICE_ID: &str = "deviceId";
    pub const SIGNALING_KEY: &str = "signalingKey";
    pub const USERNAME: &str = "username";
    pub const PASSWORD: &str = "password";
}

/// Immutable per-process identity, loaded once after provisioning
#[derive(Clone, Debug)]
pub struct ProcessState {
    pub addr: Address,
    pub device_id: DeviceId,
    /// Raw signaling key material (base64 in the store)
    pub signaling_key: Vec<u8>,
}

impl ProcessState {
    /// Load from the state store. Fails if provisioning never ran.
    pub async fn load(store: &dyn StateStore) -> StorageResult<Self> {
        let addr = store
            .get_state(state_keys::ADDR)
            .await?
            .ok_or(StorageError::MissingState(state_keys::ADDR))?;
        let device_id = store
            .get_state(state_keys::DEVICE_ID)
            .await?
            .ok_or(StorageError::MissingState(state_keys::DEVICE_ID))?;
        let device_id: DeviceId =
            device_id
                .parse()
                .map_err(|_| StorageError::CorruptValue {
                    key: state_keys::DEVICE_ID.to_string(),
                    reason: "not an integer".to_string(),
                })?;
        let signaling_key = store
            .get_state(state_keys::SIGNALING_KEY)
            .await?
            .ok_or(StorageError::MissingState(state_keys::SIGNALING_KEY))?;
        let signaling_key =
            STANDARD
                .decode(&signaling_key)
                .map_err(|e| StorageError::CorruptValue {
                    key: state_keys::SIGNALING_KEY.to_string(),
                    reason: e.to_string(),
                })?;

        Ok(Self {
            addr: Address::from(addr),
            device_id,
            signaling_key,
        })
    }
}
