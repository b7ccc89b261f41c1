//! Message sender
//!
//! Thin front over the outgoing pipeline: pads the plaintext, fans out
//! to multiple recipients, and owns the end-session path the incoming
//! pipeline's fault recovery calls into.

use std::sync::Arc;

use prost::Message as ProstMessage;
use serde_json::json;
use tracing::instrument;

use librelay_core::envelope::{data_message, Content, DataMessage};
use librelay_core::events::EventDispatcher;
use librelay_core::padding::pad;
use librelay_core::storage::Storage;
use librelay_core::types::{Address, Timestamp};
use librelay_crypto::{SessionBuilder, SessionCipher};

use crate::error::SendError;
use crate::outgoing::OutgoingMessage;
use crate::service::SignalService;

/// Constructs outgoing messages and drives them per recipient
pub struct MessageSender {
    service: Arc<dyn SignalService>,
    storage: Arc<dyn Storage>,
    cipher: Arc<dyn SessionCipher>,
    builder: Arc<dyn SessionBuilder>,
    events: Arc<EventDispatcher>,
    our_addr: Address,
}

impl MessageSender {
    pub fn new(
        service: Arc<dyn SignalService>,
        storage: Arc<dyn Storage>,
        cipher: Arc<dyn SessionCipher>,
        builder: Arc<dyn SessionBuilder>,
        events: Arc<EventDispatcher>,
        our_addr: Address,
    ) -> Self {
        Self {
            service,
            storage,
            cipher,
            builder,
            events,
            our_addr,
        }
    }

    fn outgoing(&self, timestamp: Timestamp, padded: Vec<u8>) -> OutgoingMessage {
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

    /// Fan a plaintext body out to every recipient. Per-address
    /// outcomes land in the returned message's journals; no ordering is
    /// promised across addresses.
    #[instrument(skip(self, body), fields(recipients = recipients.len()))]
    pub async fn send(
        &self,
        body: &[u8],
        recipients: &[Address],
        timestamp: Timestamp,
    ) -> Arc<OutgoingMessage> {
        let message = Arc::new(self.outgoing(timestamp, pad(body)));
        futures::future::join_all(recipients.iter().map(|addr| message.send_to_addr(addr))).await;
        message
    }

    /// Send an end-session message to `addr`, then close all local
    /// sessions for it. `retransmit` asks the peer to resend the
    /// envelope with that timestamp after the reset.
    #[instrument(skip(self))]
    pub async fn close_session(
        &self,
        addr: &Address,
        retransmit: Option<Timestamp>,
    ) -> Result<(), Arc<SendError>> {
        let data = DataMessage {
            body: retransmit.map(|ts| {
                json!({
                    "control": "retransmit",
                    "timestamp": ts.as_millis(),
                })
                .to_string()
            }),
            flags: Some(data_message::Flags::EndSession as u32),
            ..Default::default()
        };
        let content = Content {
            data_message: Some(data),
            sync_message: None,
        };

        let message = self.outgoing(Timestamp::now(), pad(&content.encode_to_vec()));
        message.send_to_addr(addr).await;

        // Local sessions close regardless of the transmit outcome
        let device_ids = self
            .storage
            .get_device_ids(addr)
            .await
            .map_err(|e| Arc::new(SendError::Storage(e)))?;
        for device_id in device_ids {
            self.cipher
                .close_open_session(&addr.with_device(device_id))
                .await
                .map_err(|cause| {
                    Arc::new(SendError::Session {
                        addr: addr.clone(),
                        timestamp: message.timestamp(),
                        cause,
                    })
                })?;
        }

        match message.errors().into_iter().next() {
            Some(entry) => Err(entry.error),
            None => Ok(()),
        }
    }
}
