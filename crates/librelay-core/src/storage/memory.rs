//! In-memory store backend (for testing)

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::types::{Address, DeviceId, ProtocolAddress};

use super::{
    BlockedStore, IdentityStore, PreKeyStore, SessionStore, StateStore, Storage, StorageResult,
};

/// Non-persistent store holding everything in process memory
#[derive(Default)]
pub struct MemoryStorage {
    state: RwLock<HashMap<String, String>>,
    sessions: RwLock<HashMap<String, Vec<u8>>>,
    identities: RwLock<HashMap<Address, Vec<u8>>>,
    pre_keys: RwLock<HashMap<u32, Vec<u8>>>,
    signed_pre_keys: RwLock<HashMap<u32, Vec<u8>>>,
    blocked: RwLock<HashSet<Address>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an address to the blocked set
    pub fn block(&self, addr: Address) {
        self.blocked.write().insert(addr);
    }

    /// Remove an address from the blocked set
    pub fn unblock(&self, addr: &Address) {
        self.blocked.write().remove(addr);
    }

    /// Count of stored session records
    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }
}

#[async_trait]
impl StateStore for MemoryStorage {
    async fn get_state(&self, key: &str) -> StorageResult<Option<String>> {
        Ok(self.state.read().get(key).cloned())
    }

    async fn put_state(&self, key: &str, value: &str) -> StorageResult<()> {
        self.state.write().insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove_state(&self, key: &str) -> StorageResult<()> {
        self.state.write().remove(key);
        Ok(())
    }
}

#[async_trait]
impl SessionStore for MemoryStorage {
    async fn get_device_ids(&self, addr: &Address) -> StorageResult<Vec<DeviceId>> {
        let mut ids: Vec<DeviceId> = self
            .sessions
            .read()
            .keys()
            .filter_map(|key| key.parse::<ProtocolAddress>().ok())
            .filter(|pa| &pa.addr == addr)
            .map(|pa| pa.device_id)
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    async fn load_session(&self, encoded_addr: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.sessions.read().get(encoded_addr).cloned())
    }

    async fn store_session(&self, encoded_addr: &str, record: &[u8]) -> StorageResult<()> {
        self.sessions
            .write()
            .insert(encoded_addr.to_string(), record.to_vec());
        Ok(())
    }

    async fn remove_session(&self, encoded_addr: &str) -> StorageResult<()> {
        self.sessions.write().remove(encoded_addr);
        Ok(())
    }
}

#[async_trait]
impl IdentityStore for MemoryStorage {
    async fn get_identity(&self, addr: &Address) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.identities.read().get(addr).cloned())
    }

    async fn save_identity(&self, addr: &Address, identity_key: &[u8]) -> StorageResult<()> {
        self.identities
            .write()
            .insert(addr.clone(), identity_key.to_vec());
        Ok(())
    }

    async fn remove_identity(&self, addr: &Address) -> StorageResult<()> {
        self.identities.write().remove(addr);
        Ok(())
    }

    async fn is_trusted_identity(
        &self,
        addr: &Address,
        identity_key: &[u8],
    ) -> StorageResult<bool> {
        Ok(match self.identities.read().get(addr) {
            Some(stored) => stored == identity_key,
            None => true,
        })
    }
}

#[async_trait]
impl PreKeyStore for MemoryStorage {
    async fn load_pre_key(&self, key_id: u32) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.pre_keys.read().get(&key_id).cloned())
    }

    async fn store_pre_key(&self, key_id: u32, record: &[u8]) -> StorageResult<()> {
        self.pre_keys.write().insert(key_id, record.to_vec());
        Ok(())
    }

    async fn remove_pre_key(&self, key_id: u32) -> StorageResult<()> {
        self.pre_keys.write().remove(&key_id);
        Ok(())
    }

    async fn load_signed_pre_key(&self, key_id: u32) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.signed_pre_keys.read().get(&key_id).cloned())
    }

    async fn store_signed_pre_key(&self, key_id: u32, record: &[u8]) -> StorageResult<()> {
        self.signed_pre_keys.write().insert(key_id, record.to_vec());
        Ok(())
    }
}

#[async_trait]
impl BlockedStore for MemoryStorage {
    async fn is_blocked(&self, addr: &Address) -> StorageResult<bool> {
        Ok(self.blocked.read().contains(addr))
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn initialize(&self) -> StorageResult<()> {
        Ok(())
    }

    async fn shutdown(&self) -> StorageResult<()> {
        Ok(())
    }
}
