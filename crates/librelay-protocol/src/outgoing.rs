//! Outgoing message pipeline
//!
//! One instance fans a padded plaintext out to every device of every
//! recipient address. `send_to_addr` runs up to two rounds of send per
//! address, reconciling device-list drift the service reports via 409
//! and 410 rejections, and always terminates with exactly one journal
//! entry in `sent` or `errors`.

use std::sync::Arc;

use futures::future::try_join_all;
use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use librelay_core::events::{ErrorEvent, Event, EventDispatcher, KeyChangeEvent, SentEvent};
use librelay_core::storage::Storage;
use librelay_core::types::{Address, DeviceId, Timestamp, PRIMARY_DEVICE_ID};
use librelay_crypto::{CryptoError, SessionBuilder, SessionCipher};

use crate::error::{SendError, ServiceError, MISMATCHED_DEVICES, NOT_FOUND, STALE_DEVICES};
use crate::service::{MessageBundle, SignalService};

/// Journaled success for one address
#[derive(Clone, Debug)]
pub struct SentEntry {
    pub addr: Address,
    pub timestamp: Timestamp,
}

/// Journaled failure for one address
#[derive(Clone, Debug)]
pub struct ErrorEntry {
    pub addr: Address,
    pub timestamp: Timestamp,
    pub error: Arc<SendError>,
}

/// One in-flight outgoing message
pub struct OutgoingMessage {
    service: Arc<dyn SignalService>,
    storage: Arc<dyn Storage>,
    cipher: Arc<dyn SessionCipher>,
    builder: Arc<dyn SessionBuilder>,
    events: Arc<EventDispatcher>,
    our_addr: Address,
    /// Assigned by the sender at construction; the logical message id
    /// in retransmit and receipt flows
    timestamp: Timestamp,
    created: Timestamp,
    padded_message: Vec<u8>,
    sent: Mutex<Vec<SentEntry>>,
    errors: Mutex<Vec<ErrorEntry>>,
}

impl OutgoingMessage {
    /// Create a pipeline for one padded plaintext
    pub fn new(
        service: Arc<dyn SignalService>,
        storage: Arc<dyn Storage>,
        cipher: Arc<dyn SessionCipher>,
        builder: Arc<dyn SessionBuilder>,
        events: Arc<EventDispatcher>,
        our_addr: Address,
        timestamp: Timestamp,
        padded_message: Vec<u8>,
    ) -> Self {
        Self {
            service,
            storage,
            cipher,
            builder,
            events,
            our_addr,
            timestamp,
            created: Timestamp::now(),
            padded_message,
            sent: Mutex::new(Vec::new()),
            errors: Mutex::new(Vec::new()),
        }
    }

    /// Message id
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// Construction time
    pub fn created(&self) -> Timestamp {
        self.created
    }

    /// The padded plaintext being sent
    pub fn message(&self) -> &[u8] {
        &self.padded_message
    }

    /// Snapshot of the success journal
    pub fn sent(&self) -> Vec<SentEntry> {
        self.sent.lock().clone()
    }

    /// Snapshot of the failure journal
    pub fn errors(&self) -> Vec<ErrorEntry> {
        self.errors.lock().clone()
    }

    /// Send to every device of one address.
    ///
    /// Never fails out: every path ends with exactly one journal entry
    /// for `addr` and a matching `sent` or `error` event.
    #[instrument(skip(self), fields(timestamp = %self.timestamp))]
    pub async fn send_to_addr(&self, addr: &Address) {
        match self.try_send(addr).await {
            Ok(()) => self.journal_sent(addr).await,
            Err(error) => self.journal_error(addr, error).await,
        }
    }

    async fn try_send(&self, addr: &Address) -> Result<(), SendError> {
        // One interactive keychange is allowed across every key refresh
        // of this call
        let mut key_change_surfaced = false;

        let mut device_ids = self.storage.get_device_ids(addr).await?;
        if device_ids.is_empty() {
            if *addr == self.our_addr {
                // Syncing to self with no other paired device
                debug!("no paired devices for self send");
                return Ok(());
            }
            // We know nothing about this address yet; contact the
            // primary and let drift reconciliation find the rest
            device_ids = vec![PRIMARY_DEVICE_ID];
        }

        let mut update_devices = Vec::new();
        for device_id in device_ids {
            let remote = addr.with_device(device_id);
            let open = self
                .cipher
                .has_open_session(&remote)
                .await
                .map_err(|cause| self.session_error(addr, cause))?;
            if !open {
                update_devices.push(device_id);
            }
        }
        if !update_devices.is_empty() {
            self.refresh_keys(addr, Some(&update_devices), &mut key_change_surfaced)
                .await?;
        }

        let mut attempts = 0u32;
        loop {
            let bundles = self.encrypt_to_devices(addr).await?;
            let result = self
                .service
                .send_messages(addr, &bundles, self.timestamp)
                .await;
            let err = match result {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };

            match err.code() {
                Some(MISMATCHED_DEVICES) => {
                    attempts += 1;
                    if attempts > 1 {
                        return Err(self.retry_limit(addr));
                    }
                    let mismatch = err.mismatched_devices().ok_or_else(|| {
                        self.send_failure(
                            addr,
                            ServiceError::BadResponse("unparseable 409 body".to_string()),
                        )
                    })?;
                    info!(
                        extra = ?mismatch.extra_devices,
                        missing = ?mismatch.missing_devices,
                        "reconciling mismatched devices"
                    );
                    for device_id in &mismatch.extra_devices {
                        self.storage
                            .remove_session(&addr.with_device(*device_id).encode())
                            .await?;
                    }
                    if !mismatch.missing_devices.is_empty() {
                        self.refresh_keys(
                            addr,
                            Some(&mismatch.missing_devices),
                            &mut key_change_surfaced,
                        )
                        .await?;
                    }
                }
                Some(STALE_DEVICES) => {
                    attempts += 1;
                    if attempts > 1 {
                        return Err(self.retry_limit(addr));
                    }
                    let stale = err.stale_devices().ok_or_else(|| {
                        self.send_failure(
                            addr,
                            ServiceError::BadResponse("unparseable 410 body".to_string()),
                        )
                    })?;
                    info!(stale = ?stale.stale_devices, "re-keying stale devices");
                    for device_id in &stale.stale_devices {
                        // Archive, don't delete: the record survives
                        // the re-key
                        self.cipher
                            .close_open_session(&addr.with_device(*device_id))
                            .await
                            .map_err(|cause| self.session_error(addr, cause))?;
                    }
                    self.refresh_keys(addr, Some(&stale.stale_devices), &mut key_change_surfaced)
                        .await?;
                }
                Some(NOT_FOUND) => {
                    return Err(SendError::UnregisteredUser { addr: addr.clone() });
                }
                _ => return Err(self.send_failure(addr, err)),
            }
        }
    }

    /// Fetch prekey bundles and build sessions, retrying once after an
    /// identity key change has been surfaced to listeners
    async fn refresh_keys(
        &self,
        addr: &Address,
        devices: Option<&[DeviceId]>,
        key_change_surfaced: &mut bool,
    ) -> Result<(), SendError> {
        loop {
            let err = match self.fetch_and_build(addr, devices).await {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };
            let identity_key = match &err {
                SendError::Session {
                    cause: CryptoError::UntrustedIdentity { identity_key, .. },
                    ..
                } => identity_key.clone(),
                _ => return Err(err),
            };
            if *key_change_surfaced {
                return Err(SendError::OutgoingIdentityKey {
                    addr: addr.clone(),
                    timestamp: self.timestamp,
                    identity_key,
                });
            }
            *key_change_surfaced = true;

            let change = Arc::new(KeyChangeEvent::new(addr.clone(), identity_key));
            self.events.emit(&Event::KeyChange(change.clone())).await;
            if change.is_accepted() {
                self.storage
                    .save_identity(addr, &change.identity_key)
                    .await?;
            }
        }
    }

    async fn fetch_and_build(
        &self,
        addr: &Address,
        devices: Option<&[DeviceId]>,
    ) -> Result<(), SendError> {
        let mut key_sets = Vec::new();
        match devices {
            None => {
                let keys = self
                    .service
                    .get_keys_for_addr(addr, None)
                    .await
                    .map_err(|err| self.key_fetch_failure(addr, err))?;
                key_sets.push(keys);
            }
            Some(list) => {
                // Server constraint: specific devices fetch one at a
                // time
                for device_id in list {
                    match self.service.get_keys_for_addr(addr, Some(*device_id)).await {
                        Ok(keys) => key_sets.push(keys),
                        Err(err)
                            if err.code() == Some(NOT_FOUND)
                                && *device_id != PRIMARY_DEVICE_ID =>
                        {
                            warn!(device = device_id, "device vanished, dropping local session");
                            self.storage
                                .remove_session(&addr.with_device(*device_id).encode())
                                .await?;
                        }
                        Err(err) => return Err(self.key_fetch_failure(addr, err)),
                    }
                }
            }
        }

        for keys in &key_sets {
            for device in &keys.devices {
                let remote = addr.with_device(device.device_id);
                self.builder
                    .process_pre_key_bundle(&remote, &keys.identity_key, device)
                    .await
                    .map_err(|cause| self.session_error(addr, cause))?;
            }
        }
        Ok(())
    }

    /// Encrypt the padded body for every currently stored device.
    /// Per-device encryption proceeds in parallel; any failure is
    /// terminal for the address.
    async fn encrypt_to_devices(&self, addr: &Address) -> Result<Vec<MessageBundle>, SendError> {
        let device_ids = self.storage.get_device_ids(addr).await?;
        let tasks = device_ids.into_iter().map(|device_id| {
            let remote = addr.with_device(device_id);
            async move {
                self.cipher
                    .encrypt(&remote, &self.padded_message)
                    .await
                    .map(|message| MessageBundle::new(device_id, &message))
            }
        });
        try_join_all(tasks).await.map_err(|cause| SendError::Encrypt {
            addr: addr.clone(),
            timestamp: self.timestamp,
            cause,
        })
    }

    async fn journal_sent(&self, addr: &Address) {
        info!(%addr, "message transmitted");
        self.sent.lock().push(SentEntry {
            addr: addr.clone(),
            timestamp: self.timestamp,
        });
        self.events
            .emit(&Event::Sent(SentEvent {
                destination: addr.clone(),
                timestamp: self.timestamp,
            }))
            .await;
    }

    async fn journal_error(&self, addr: &Address, error: SendError) {
        warn!(%addr, "send failed: {error}");
        let error = Arc::new(error);
        self.errors.lock().push(ErrorEntry {
            addr: addr.clone(),
            timestamp: self.timestamp,
            error: error.clone(),
        });
        self.events
            .emit(&Event::Error(ErrorEvent {
                cause: error,
                envelope: None,
            }))
            .await;
    }

    fn session_error(&self, addr: &Address, cause: CryptoError) -> SendError {
        SendError::Session {
            addr: addr.clone(),
            timestamp: self.timestamp,
            cause,
        }
    }

    fn send_failure(&self, addr: &Address, cause: ServiceError) -> SendError {
        SendError::SendMessage {
            addr: addr.clone(),
            timestamp: self.timestamp,
            cause,
        }
    }

    fn key_fetch_failure(&self, addr: &Address, cause: ServiceError) -> SendError {
        if cause.code() == Some(NOT_FOUND) {
            SendError::UnregisteredUser { addr: addr.clone() }
        } else {
            SendError::KeyFetch {
                addr: addr.clone(),
                timestamp: self.timestamp,
                cause,
            }
        }
    }

    fn retry_limit(&self, addr: &Address) -> SendError {
        SendError::RetryLimit {
            addr: addr.clone(),
            timestamp: self.timestamp,
        }
    }
}
