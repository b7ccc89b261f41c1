//! Programmable fakes for the pipeline scenario tests

// Each scenario binary uses a different subset of the fakes
#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use prost::Message as ProstMessage;

use librelay_core::envelope::{envelope::Type as EnvelopeType, Content, DataMessage, Envelope};
use librelay_core::events::{Event, EventDispatcher, EventListener, ListenerError};
use librelay_core::keys::{
    AddressKeys, DeviceInfo, DeviceKeys, KeyRegistrationBundle, PreKeyEntry, SignedPreKeyEntry,
};
use librelay_core::storage::{MemoryStorage, ProcessState, SessionStore};
use librelay_core::types::{Address, DeviceId, ProtocolAddress, Timestamp};
use librelay_crypto::{
    CiphertextType, CryptoError, EncryptedMessage, SessionBuilder, SessionCipher,
};
use librelay_protocol::config::ClientConfig;
use librelay_protocol::error::ServiceError;
use librelay_protocol::outgoing::OutgoingMessage;
use librelay_protocol::receiver::MessageReceiver;
use librelay_protocol::sender::MessageSender;
use librelay_protocol::service::{MessageBatch, MessageBundle, SignalService};

/// Scripted message service
#[derive(Default)]
pub struct FakeService {
    /// Popped per send_messages call; Ok when empty
    pub send_results: Mutex<VecDeque<Result<(), ServiceError>>>,
    /// Keyed by (addr, device); missing entries answer 404
    pub key_responses: Mutex<HashMap<(String, Option<DeviceId>), AddressKeys>>,
    /// Popped per get_messages call; empty batch when exhausted
    pub batches: Mutex<VecDeque<MessageBatch>>,

    pub sent_calls: Mutex<Vec<(Address, Vec<MessageBundle>, Timestamp)>>,
    pub key_calls: Mutex<Vec<(Address, Option<DeviceId>)>>,
    pub registered_keys: Mutex<Vec<KeyRegistrationBundle>>,
    pub deleted: Mutex<Vec<(Address, Timestamp)>>,
}

impl FakeService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script_send(&self, result: Result<(), ServiceError>) {
        self.send_results.lock().push_back(result);
    }

    pub fn script_keys(&self, addr: &Address, device_id: Option<DeviceId>, keys: AddressKeys) {
        self.key_responses
            .lock()
            .insert((addr.to_string(), device_id), keys);
    }

    pub fn script_batch(&self, batch: MessageBatch) {
        self.batches.lock().push_back(batch);
    }

    /// Device ids of the bundles in the n-th transmit
    pub fn sent_device_ids(&self, call: usize) -> Vec<DeviceId> {
        self.sent_calls.lock()[call]
            .1
            .iter()
            .map(|b| b.destination_device_id)
            .collect()
    }
}

pub fn protocol_error(code: u16, body: serde_json::Value) -> ServiceError {
    ServiceError::Protocol {
        code,
        response: Some(body),
    }
}

#[async_trait]
impl SignalService for FakeService {
    async fn get_keys_for_addr(
        &self,
        addr: &Address,
        device_id: Option<DeviceId>,
    ) -> Result<AddressKeys, ServiceError> {
        self.key_calls.lock().push((addr.clone(), device_id));
        self.key_responses
            .lock()
            .get(&(addr.to_string(), device_id))
            .cloned()
            .ok_or(ServiceError::Protocol {
                code: 404,
                response: None,
            })
    }

    async fn send_messages(
        &self,
        addr: &Address,
        messages: &[MessageBundle],
        timestamp: Timestamp,
    ) -> Result<(), ServiceError> {
        self.sent_calls
            .lock()
            .push((addr.clone(), messages.to_vec(), timestamp));
        self.send_results.lock().pop_front().unwrap_or(Ok(()))
    }

    async fn get_devices(&self) -> Result<Vec<DeviceInfo>, ServiceError> {
        Ok(Vec::new())
    }

    async fn generate_keys(&self) -> Result<KeyRegistrationBundle, ServiceError> {
        Ok(KeyRegistrationBundle {
            identity_key: vec![5; 33],
            signed_pre_key: SignedPreKeyEntry {
                key_id: 1,
                public_key: vec![1; 33],
                signature: vec![2; 64],
            },
            pre_keys: vec![PreKeyEntry {
                key_id: 100,
                public_key: vec![3; 33],
            }],
        })
    }

    async fn register_keys(&self, keys: &KeyRegistrationBundle) -> Result<(), ServiceError> {
        self.registered_keys.lock().push(keys.clone());
        Ok(())
    }

    async fn get_messages(&self) -> Result<MessageBatch, ServiceError> {
        Ok(self.batches.lock().pop_front().unwrap_or_default())
    }

    async fn delete_message(
        &self,
        source: &Address,
        timestamp: Timestamp,
    ) -> Result<(), ServiceError> {
        self.deleted.lock().push((source.clone(), timestamp));
        Ok(())
    }

    async fn get_attachment(&self, _id: u64) -> Result<Vec<u8>, ServiceError> {
        Ok(Vec::new())
    }

    async fn get_message_websocket_url(&self) -> Result<String, ServiceError> {
        Ok("ws://unused.example".to_string())
    }
}

/// Scripted session cipher
#[derive(Default)]
pub struct FakeCipher {
    /// Encoded addresses with an open session
    pub open_sessions: Mutex<HashSet<String>>,
    /// Encoded addresses that fail encryption
    pub fail_encrypt: Mutex<HashSet<String>>,
    /// Popped per decrypt call
    pub decrypt_results: Mutex<VecDeque<Result<Vec<u8>, CryptoError>>>,

    pub closed: Mutex<Vec<String>>,
    /// (encoded addr, padded body) per encrypt call
    pub encrypt_calls: Mutex<Vec<(String, Vec<u8>)>>,
}

impl FakeCipher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn open_session(&self, remote: &ProtocolAddress) {
        self.open_sessions.lock().insert(remote.encode());
    }

    pub fn script_decrypt(&self, result: Result<Vec<u8>, CryptoError>) {
        self.decrypt_results.lock().push_back(result);
    }

    fn pop_decrypt(&self) -> Result<Vec<u8>, CryptoError> {
        self.decrypt_results
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(CryptoError::Session("no scripted decrypt".to_string())))
    }
}

#[async_trait]
impl SessionCipher for FakeCipher {
    async fn encrypt(
        &self,
        remote: &ProtocolAddress,
        padded: &[u8],
    ) -> Result<EncryptedMessage, CryptoError> {
        let encoded = remote.encode();
        self.encrypt_calls
            .lock()
            .push((encoded.clone(), padded.to_vec()));
        if self.fail_encrypt.lock().contains(&encoded) {
            return Err(CryptoError::Session("scripted encrypt failure".to_string()));
        }
        Ok(EncryptedMessage {
            msg_type: CiphertextType::Whisper,
            registration_id: 42,
            body: format!("ct:{encoded}").into_bytes(),
        })
    }

    async fn decrypt_whisper_message(
        &self,
        _remote: &ProtocolAddress,
        _body: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        self.pop_decrypt()
    }

    async fn decrypt_pre_key_whisper_message(
        &self,
        _remote: &ProtocolAddress,
        _body: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        self.pop_decrypt()
    }

    async fn has_open_session(&self, remote: &ProtocolAddress) -> Result<bool, CryptoError> {
        Ok(self.open_sessions.lock().contains(&remote.encode()))
    }

    async fn close_open_session(&self, remote: &ProtocolAddress) -> Result<(), CryptoError> {
        let encoded = remote.encode();
        self.open_sessions.lock().remove(&encoded);
        self.closed.lock().push(encoded);
        Ok(())
    }
}

/// Session builder running a trust-on-first-use check against the
/// memory store and recording a session for each processed device
pub struct FakeBuilder {
    storage: Arc<MemoryStorage>,
    pub processed: Mutex<Vec<(String, Vec<u8>)>>,
}

impl FakeBuilder {
    pub fn new(storage: Arc<MemoryStorage>) -> Arc<Self> {
        Arc::new(Self {
            storage,
            processed: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl SessionBuilder for FakeBuilder {
    async fn process_pre_key_bundle(
        &self,
        remote: &ProtocolAddress,
        identity_key: &[u8],
        _keys: &DeviceKeys,
    ) -> Result<(), CryptoError> {
        use librelay_core::storage::IdentityStore;

        let trusted = self
            .storage
            .is_trusted_identity(&remote.addr, identity_key)
            .await?;
        if !trusted {
            return Err(CryptoError::UntrustedIdentity {
                addr: remote.addr.to_string(),
                identity_key: identity_key.to_vec(),
            });
        }

        self.storage.save_identity(&remote.addr, identity_key).await?;
        self.storage
            .store_session(&remote.encode(), b"session")
            .await?;
        self.processed
            .lock()
            .push((remote.encode(), identity_key.to_vec()));
        Ok(())
    }
}

/// Records every dispatched event; optionally accepts key changes
pub struct EventCollector {
    pub events: Mutex<Vec<Event>>,
    pub accept_keychange: bool,
}

impl EventCollector {
    pub fn new(accept_keychange: bool) -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
            accept_keychange,
        })
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.events.lock().iter().map(|e| e.name()).collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.names().iter().filter(|n| **n == name).count()
    }
}

#[async_trait]
impl EventListener for EventCollector {
    async fn on_event(&self, event: &Event) -> Result<(), ListenerError> {
        if let Event::KeyChange(change) = event {
            if self.accept_keychange {
                change.accept();
            }
        }
        self.events.lock().push(event.clone());
        Ok(())
    }
}

/// Assembled pipeline collaborators
pub struct TestBed {
    pub storage: Arc<MemoryStorage>,
    pub service: Arc<FakeService>,
    pub cipher: Arc<FakeCipher>,
    pub builder: Arc<FakeBuilder>,
    pub events: Arc<EventDispatcher>,
    pub collector: Arc<EventCollector>,
    pub our_addr: Address,
    pub our_device: DeviceId,
}

impl TestBed {
    pub fn new(accept_keychange: bool) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let storage = Arc::new(MemoryStorage::new());
        let events = Arc::new(EventDispatcher::new());
        let collector = EventCollector::new(accept_keychange);
        events.add_listener(collector.clone());

        Self {
            storage: storage.clone(),
            service: FakeService::new(),
            cipher: FakeCipher::new(),
            builder: FakeBuilder::new(storage),
            events,
            collector,
            our_addr: Address::from("11111111-0000-0000-0000-000000000001"),
            our_device: 1,
        }
    }

    /// Store a session record and mark it open in the cipher
    pub async fn seed_session(&self, addr: &Address, device_id: DeviceId) {
        let remote = addr.with_device(device_id);
        self.storage
            .store_session(&remote.encode(), b"session")
            .await
            .unwrap();
        self.cipher.open_session(&remote);
    }

    pub fn outgoing(&self, timestamp: Timestamp, padded: Vec<u8>) -> OutgoingMessage {
        OutgoingMessage::new(
            self.service.clone(),
            self.storage.clone(),
            self.cipher.clone(),
            self.builder.clone(),
            self.events.clone(),
            self.our_addr.clone(),
            timestamp,
            padded,
        )
    }

    pub fn sender(&self) -> Arc<MessageSender> {
        Arc::new(MessageSender::new(
            self.service.clone(),
            self.storage.clone(),
            self.cipher.clone(),
            self.builder.clone(),
            self.events.clone(),
            self.our_addr.clone(),
        ))
    }

    pub fn receiver(&self, with_sender: bool) -> MessageReceiver {
        let state = ProcessState {
            addr: self.our_addr.clone(),
            device_id: self.our_device,
            signaling_key: vec![7; 52],
        };
        let sender = with_sender.then(|| self.sender());
        MessageReceiver::new(
            ClientConfig::default(),
            state,
            self.service.clone(),
            self.storage.clone(),
            self.cipher.clone(),
            sender,
            self.events.clone(),
        )
        .unwrap()
    }
}

/// A prekey-fetch response for one device
pub fn address_keys(identity_key: Vec<u8>, device_ids: &[DeviceId]) -> AddressKeys {
    AddressKeys {
        identity_key,
        devices: device_ids
            .iter()
            .map(|id| DeviceKeys {
                device_id: *id,
                registration_id: 1000 + id,
                signed_pre_key: SignedPreKeyEntry {
                    key_id: 1,
                    public_key: vec![1; 33],
                    signature: vec![2; 64],
                },
                pre_key: Some(PreKeyEntry {
                    key_id: 7,
                    public_key: vec![3; 33],
                }),
            })
            .collect(),
    }
}

/// A ciphertext envelope carrying `content`
pub fn content_envelope(source: &Address, device_id: DeviceId, timestamp: u64) -> Envelope {
    Envelope {
        r#type: EnvelopeType::Ciphertext as i32,
        source: Some(source.to_string()),
        relay: None,
        timestamp: Some(timestamp),
        legacy_message: None,
        source_device: Some(device_id),
        content: Some(vec![0xaa; 16]),
    }
}

/// Encoded, padded Content with a plain text body
pub fn padded_body_content(body: &str) -> Vec<u8> {
    let content = Content {
        data_message: Some(DataMessage {
            body: Some(body.to_string()),
            ..Default::default()
        }),
        sync_message: None,
    };
    librelay_core::padding::pad(&content.encode_to_vec())
}

/// Encoded, padded Content wrapping the given sync message
pub fn padded_sync_content(sync: librelay_core::envelope::SyncMessage) -> Vec<u8> {
    let content = Content {
        data_message: None,
        sync_message: Some(sync),
    };
    librelay_core::padding::pad(&content.encode_to_vec())
}

/// Encoded, padded Content with the END_SESSION flag set
pub fn padded_end_session_content() -> Vec<u8> {
    let content = Content {
        data_message: Some(DataMessage {
            flags: Some(librelay_core::envelope::data_message::Flags::EndSession as u32),
            ..Default::default()
        }),
        sync_message: None,
    };
    librelay_core::padding::pad(&content.encode_to_vec())
}
