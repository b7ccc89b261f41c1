//! Incoming message pipeline
//!
//! Decrypts and dispatches envelopes arriving over the streaming
//! transport, heals from session faults, and drains the server-side
//! queue over the REST API when streaming is disabled. All envelope
//! handling funnels through the serialization queue: envelope n+1 does
//! not start until envelope n has fully handled, events included.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use prost::Message as ProstMessage;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use librelay_core::envelope::{
    envelope::Type as EnvelopeType, CodecError, Content, DataMessage, Envelope, SyncMessage,
    data_message,
};
use librelay_core::events::{
    ErrorEvent, Event, EventDispatcher, KeyChangeEvent, MessageEvent, ReadEvent, ReceiptEvent,
    SentEvent,
};
use librelay_core::padding::unpad;
use librelay_core::storage::{ProcessState, Storage};
use librelay_core::types::{Address, DeviceId, Timestamp};
use librelay_crypto::{CryptoError, SessionCipher, SignalingKey};

use crate::config::ClientConfig;
use crate::error::ReceiveError;
use crate::queue::{QueueClosed, SerialQueue};
use crate::sender::MessageSender;
use crate::service::SignalService;
use crate::transport::{self, IncomingRequest, TransportEvent, TransportHandle};

const QUEUE_EMPTY_PATH: &str = "/api/v1/queue/empty";
const MESSAGE_PATH: &str = "/api/v1/message";

/// Receives, decrypts and dispatches incoming envelopes
pub struct MessageReceiver {
    inner: Arc<ReceiverInner>,
    run_task: Mutex<Option<JoinHandle<()>>>,
}

struct ReceiverInner {
    config: ClientConfig,
    service: Arc<dyn SignalService>,
    storage: Arc<dyn Storage>,
    cipher: Arc<dyn SessionCipher>,
    sender: Option<Arc<MessageSender>>,
    events: Arc<EventDispatcher>,
    addr: Address,
    device_id: DeviceId,
    signaling_key: SignalingKey,
    queue: SerialQueue,
    closing: AtomicBool,
    connected: watch::Sender<bool>,
    transport: Mutex<Option<TransportHandle>>,
}

impl MessageReceiver {
    /// Create a receiver from the provisioned process state. `sender`
    /// wires up the retransmit path used by session-fault recovery.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ClientConfig,
        state: ProcessState,
        service: Arc<dyn SignalService>,
        storage: Arc<dyn Storage>,
        cipher: Arc<dyn SessionCipher>,
        sender: Option<Arc<MessageSender>>,
        events: Arc<EventDispatcher>,
    ) -> Result<Self, CryptoError> {
        let signaling_key = SignalingKey::from_bytes(&state.signaling_key)?;
        let (connected, _) = watch::channel(false);

        Ok(Self {
            inner: Arc::new(ReceiverInner {
                config,
                service,
                storage,
                cipher,
                sender,
                events,
                addr: state.addr,
                device_id: state.device_id,
                signaling_key,
                queue: SerialQueue::new(),
                closing: AtomicBool::new(false),
                connected,
                transport: Mutex::new(None),
            }),
            run_task: Mutex::new(None),
        })
    }

    /// Connect the streaming transport and keep it connected.
    ///
    /// Idempotent until [`close`](Self::close): a second call while a
    /// connect is in flight joins the in-flight attempt. Resolves once
    /// the transport is established; the reconnect loop keeps running
    /// in the background afterwards.
    pub async fn connect(&self) -> Result<(), ReceiveError> {
        if !self.inner.config.use_stream {
            return Err(ReceiveError::Transport(
                "streaming transport is disabled".to_string(),
            ));
        }
        if self.inner.closing.load(Ordering::SeqCst) {
            return Err(ReceiveError::Closed);
        }

        {
            let mut task = self.run_task.lock();
            let running = task.as_ref().map(|t| !t.is_finished()).unwrap_or(false);
            if !running {
                let inner = self.inner.clone();
                *task = Some(tokio::spawn(inner.run()));
            }
        }

        let mut connected = self.inner.connected.subscribe();
        loop {
            if *connected.borrow() {
                return Ok(());
            }
            if self.inner.closing.load(Ordering::SeqCst) {
                return Err(ReceiveError::Closed);
            }
            if connected.changed().await.is_err() {
                return Err(ReceiveError::Closed);
            }
        }
    }

    /// Shut the receiver down. In-flight request handling completes and
    /// responds before the transport closes; later socket-close events
    /// are ignored.
    pub async fn close(&self) {
        self.inner.closing.store(true, Ordering::SeqCst);
        let handle = self.inner.transport.lock().take();
        if let Some(handle) = handle {
            handle.close().await;
        }
        let _ = self.inner.connected.send(false);
    }

    /// Feed one envelope through the serialization queue, exactly as
    /// the streaming and drain paths do. Faults are classified and
    /// emitted as error events, never returned.
    pub async fn handle_envelope(&self, envelope: Envelope) -> Result<(), QueueClosed> {
        let inner = self.inner.clone();
        self.inner
            .queue
            .run(async move { inner.process_envelope(envelope, false).await })
            .await
    }

    /// Pull and handle every queued message over the REST API; the
    /// receive path when streaming is disabled. Handled messages are
    /// deleted from the server queue concurrently.
    #[instrument(skip(self))]
    pub async fn drain(&self) -> Result<usize, ReceiveError> {
        let mut handled = 0usize;
        let mut deletes: Vec<JoinHandle<()>> = Vec::new();

        loop {
            let batch = self.inner.service.get_messages().await?;
            let more = batch.more;
            for stored in batch.messages {
                let source = Address::from(stored.source.clone());
                let timestamp = Timestamp::from_millis(stored.timestamp);
                let envelope = stored.into_envelope()?;

                let inner = self.inner.clone();
                self.inner
                    .queue
                    .run(async move { inner.process_envelope(envelope, false).await })
                    .await?;
                handled += 1;

                let service = self.inner.service.clone();
                deletes.push(tokio::spawn(async move {
                    if let Err(e) = service.delete_message(&source, timestamp).await {
                        warn!("failed to delete drained message: {e}");
                    }
                }));
            }
            if !more {
                break;
            }
        }

        for delete in deletes {
            let _ = delete.await;
        }
        Ok(handled)
    }
}

impl ReceiverInner {
    /// Reconnect loop: connect, service the socket until it drops,
    /// probe our registration, repeat until closed.
    async fn run(self: Arc<Self>) {
        let mut attempt: u32 = 0;
        while !self.closing.load(Ordering::SeqCst) {
            let url = match self.service.get_message_websocket_url().await {
                Ok(url) => url,
                Err(e) => {
                    warn!(attempt, "could not resolve websocket url: {e}");
                    self.check_registration().await;
                    tokio::time::sleep(self.config.retry.delay_for_attempt(attempt)).await;
                    attempt = attempt.saturating_add(1);
                    continue;
                }
            };

            match transport::connect(&url, self.config.keepalive.clone()).await {
                Ok((handle, events)) => {
                    info!("message stream connected");
                    attempt = 0;
                    *self.transport.lock() = Some(handle);
                    let _ = self.connected.send(true);

                    self.serve(events).await;

                    let _ = self.connected.send(false);
                    *self.transport.lock() = None;
                    if self.closing.load(Ordering::SeqCst) {
                        break;
                    }
                    warn!("message stream lost, reconnecting");
                    self.check_registration().await;
                }
                Err(e) => {
                    warn!(attempt, "stream connect failed: {e}");
                    self.check_registration().await;
                    tokio::time::sleep(self.config.retry.delay_for_attempt(attempt)).await;
                    attempt = attempt.saturating_add(1);
                }
            }
        }
        debug!("receiver run loop exited");
    }

    async fn serve(self: &Arc<Self>, mut events: tokio::sync::mpsc::Receiver<TransportEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::Request(request) => self.handle_request(request).await,
                TransportEvent::Closed { code, reason } => {
                    if self.closing.load(Ordering::SeqCst) {
                        debug!("ignoring socket close after shutdown");
                    } else {
                        warn!(?code, %reason, "message stream closed");
                    }
                    return;
                }
            }
        }
    }

    /// Dispatch one server-initiated request. Only the queue-empty
    /// notice and message delivery are valid paths.
    async fn handle_request(self: &Arc<Self>, request: IncomingRequest) {
        if request.verb == "GET" && request.path == QUEUE_EMPTY_PATH {
            debug!("server message queue is empty");
            if let Err(e) = request.respond(200, "OK").await {
                warn!("failed to respond to queue-empty notice: {e}");
            }
            return;
        }
        if request.verb != "PUT" || request.path != MESSAGE_PATH {
            warn!(verb = %request.verb, path = %request.path, "unexpected websocket request");
            let _ = request.respond(404, "Not found").await;
            return;
        }

        match self.decode_frame(&request.body) {
            Ok(envelope) => {
                let inner = self.clone();
                let _ = self
                    .queue
                    .run(async move { inner.process_envelope(envelope, false).await })
                    .await;
                // Acknowledge even when handling failed; only decode
                // failures produce a 500
                if let Err(e) = request.respond(200, "OK").await {
                    warn!("failed to acknowledge message: {e}");
                }
            }
            Err(err) => {
                error!("bad encrypted websocket message: {err}");
                let _ = request.respond(500, "Bad encrypted websocket message").await;
                self.emit_error(err, None).await;
            }
        }
    }

    fn decode_frame(&self, body: &[u8]) -> Result<Envelope, ReceiveError> {
        let plaintext = self.signaling_key.decrypt_frame(body)?;
        Ok(Envelope::decode_frame(&plaintext)?)
    }

    /// Handle one envelope, running the fault-recovery table on error
    async fn process_envelope(self: Arc<Self>, envelope: Envelope, reentrant: bool) {
        if let Err(err) = self.dispatch_envelope(&envelope, reentrant).await {
            self.recover(envelope, err, reentrant).await;
        }
    }

    /// Session-fault recovery
    async fn recover(self: &Arc<Self>, envelope: Envelope, err: ReceiveError, reentrant: bool) {
        match err {
            // Idempotent delivery: a replayed envelope is dropped
            ReceiveError::Crypto(CryptoError::MessageCounter(counter)) => {
                warn!(counter, "dropping envelope with duplicate counter");
            }
            ReceiveError::Crypto(CryptoError::UntrustedIdentity { addr, identity_key })
                if !reentrant =>
            {
                let addr = Address::from(addr);
                let change = Arc::new(KeyChangeEvent::new(addr.clone(), identity_key));
                self.events.emit(&Event::KeyChange(change.clone())).await;
                if change.is_accepted() {
                    if let Err(e) = self.storage.save_identity(&addr, &change.identity_key).await
                    {
                        warn!("failed to store accepted identity: {e}");
                        self.emit_error(ReceiveError::Storage(e), Some(envelope)).await;
                        return;
                    }
                    Box::pin(self.clone().process_envelope(envelope, true)).await;
                }
                // Not accepted: stop here, the listener owns the policy
            }
            ReceiveError::Crypto(CryptoError::UntrustedIdentity { addr, identity_key }) => {
                self.emit_error(
                    ReceiveError::UntrustedIdentity {
                        addr: Address::from(addr),
                        identity_key,
                    },
                    Some(envelope),
                )
                .await;
            }
            ReceiveError::Crypto(CryptoError::PreKey(reason)) => {
                warn!("prekey fault, replenishing keys: {reason}");
                if let Err(e) = self.replenish_pre_keys().await {
                    warn!("prekey replenishment failed: {e}");
                }
                self.reset_session(&envelope).await;
            }
            ReceiveError::Crypto(
                cause @ (CryptoError::Session(_)
                | CryptoError::InvalidMessage(_)
                | CryptoError::AuthenticationFailed
                | CryptoError::InvalidKeyLength { .. }),
            ) => {
                warn!("session fault, resetting: {cause}");
                self.reset_session(&envelope).await;
            }
            other => self.emit_error(other, Some(envelope)).await,
        }
    }

    /// Block filter, shape dispatch, decrypt and route
    async fn dispatch_envelope(
        &self,
        envelope: &Envelope,
        reentrant: bool,
    ) -> Result<(), ReceiveError> {
        let source = envelope.source_addr()?;
        if self.storage.is_blocked(&source).await? {
            debug!(%source, "dropping envelope from blocked sender");
            return Ok(());
        }

        let envelope_type = envelope.envelope_type()?;
        if envelope_type == EnvelopeType::Receipt {
            self.events
                .emit(&Event::Receipt(ReceiptEvent {
                    source,
                    source_device: envelope.source_device_id()?,
                    timestamp: envelope.sent_timestamp(),
                }))
                .await;
            return Ok(());
        }

        if let Some(content) = envelope.content.as_deref() {
            self.handle_content(envelope, &source, envelope_type, content, reentrant)
                .await
        } else if let Some(legacy) = envelope.legacy_message.as_deref() {
            self.handle_legacy(envelope, &source, envelope_type, legacy, reentrant)
                .await
        } else {
            Err(ReceiveError::EmptyEnvelope)
        }
    }

    async fn decrypt_body(
        &self,
        envelope: &Envelope,
        source: &Address,
        envelope_type: EnvelopeType,
        body: &[u8],
    ) -> Result<Vec<u8>, ReceiveError> {
        let remote = source.with_device(envelope.source_device_id()?);
        let plaintext = match envelope_type {
            EnvelopeType::Ciphertext => self.cipher.decrypt_whisper_message(&remote, body).await?,
            EnvelopeType::PrekeyBundle => {
                self.cipher
                    .decrypt_pre_key_whisper_message(&remote, body)
                    .await?
            }
            other => return Err(ReceiveError::UnsupportedEnvelopeType(other as i32)),
        };
        Ok(unpad(&plaintext)?)
    }

    async fn handle_content(
        &self,
        envelope: &Envelope,
        source: &Address,
        envelope_type: EnvelopeType,
        body: &[u8],
        reentrant: bool,
    ) -> Result<(), ReceiveError> {
        let plaintext = self
            .decrypt_body(envelope, source, envelope_type, body)
            .await?;
        let content = Content::decode(plaintext.as_slice()).map_err(CodecError::from)?;

        if let Some(data) = content.data_message {
            self.handle_data_message(envelope, source, data, reentrant)
                .await
        } else if let Some(sync) = content.sync_message {
            self.handle_sync_message(envelope, source, sync).await
        } else {
            Err(ReceiveError::EmptyContent)
        }
    }

    async fn handle_legacy(
        &self,
        envelope: &Envelope,
        source: &Address,
        envelope_type: EnvelopeType,
        body: &[u8],
        reentrant: bool,
    ) -> Result<(), ReceiveError> {
        let plaintext = self
            .decrypt_body(envelope, source, envelope_type, body)
            .await?;
        let data = DataMessage::decode(plaintext.as_slice()).map_err(CodecError::from)?;
        self.handle_data_message(envelope, source, data, reentrant)
            .await
    }

    async fn handle_data_message(
        &self,
        envelope: &Envelope,
        source: &Address,
        message: DataMessage,
        reentrant: bool,
    ) -> Result<(), ReceiveError> {
        if message.has_flag(data_message::Flags::EndSession) {
            return self.handle_end_session(source).await;
        }

        self.events
            .emit(&Event::Message(MessageEvent {
                source: source.clone(),
                source_device: envelope.source_device_id()?,
                timestamp: envelope.sent_timestamp(),
                message,
                key_change: reentrant,
            }))
            .await;
        Ok(())
    }

    /// Close every stored session for the address; there is no
    /// per-device variant of an end-session notice
    async fn handle_end_session(&self, source: &Address) -> Result<(), ReceiveError> {
        let device_ids = self.storage.get_device_ids(source).await?;
        info!(%source, devices = device_ids.len(), "peer ended session");
        for device_id in device_ids {
            self.cipher
                .close_open_session(&source.with_device(device_id))
                .await?;
        }
        Ok(())
    }

    /// Sync transcripts are only valid from our own address on another
    /// device
    async fn handle_sync_message(
        &self,
        envelope: &Envelope,
        source: &Address,
        sync: SyncMessage,
    ) -> Result<(), ReceiveError> {
        if *source != self.addr {
            return Err(ReceiveError::ForeignSync(source.clone()));
        }
        if envelope.source_device_id()? == self.device_id {
            return Err(ReceiveError::SelfSync);
        }

        if let Some(sent) = sync.sent {
            let destination = sent
                .destination
                .map(Address::from)
                .ok_or(CodecError::MissingField("destination"))?;
            self.events
                .emit(&Event::Sent(SentEvent {
                    destination,
                    timestamp: Timestamp::from_millis(sent.timestamp.unwrap_or(0)),
                }))
                .await;
            Ok(())
        } else if !sync.read.is_empty() {
            for read in sync.read {
                let sender = read
                    .sender
                    .map(Address::from)
                    .ok_or(CodecError::MissingField("sender"))?;
                self.events
                    .emit(&Event::Read(ReadEvent {
                        sender,
                        timestamp: Timestamp::from_millis(read.timestamp.unwrap_or(0)),
                    }))
                    .await;
            }
            Ok(())
        } else if sync.blocked.is_some() {
            Err(ReceiveError::UnsupportedSync)
        } else if sync.contacts.is_some() {
            Err(ReceiveError::DeprecatedSync("contact"))
        } else if sync.groups.is_some() {
            Err(ReceiveError::DeprecatedSync("group"))
        } else if sync.request.is_some() {
            Err(ReceiveError::DeprecatedSync("request"))
        } else {
            Err(ReceiveError::EmptySync)
        }
    }

    /// Close the faulted session and ask the peer to retransmit
    async fn reset_session(&self, envelope: &Envelope) {
        let Ok(source) = envelope.source_addr() else {
            return;
        };
        let retransmit = Some(envelope.sent_timestamp());

        match &self.sender {
            Some(sender) => {
                if let Err(e) = sender.close_session(&source, retransmit).await {
                    warn!("session reset send failed: {e}");
                }
            }
            None => {
                // No sender wired up; close the faulted session locally
                if let Ok(device_id) = envelope.source_device_id() {
                    if let Err(e) = self
                        .cipher
                        .close_open_session(&source.with_device(device_id))
                        .await
                    {
                        warn!("failed to close faulted session: {e}");
                    }
                }
            }
        }
    }

    async fn replenish_pre_keys(&self) -> Result<(), ReceiveError> {
        let keys = self.service.generate_keys().await?;
        self.service.register_keys(&keys).await?;
        info!(pre_keys = keys.pre_keys.len(), "registered fresh prekeys");
        Ok(())
    }

    /// Probe our registration after a transport failure and surface a
    /// rejection to the application
    async fn check_registration(&self) {
        match self.service.get_devices().await {
            Ok(devices) => debug!(count = devices.len(), "registration probe ok"),
            Err(err) => {
                warn!("registration probe failed: {err}");
                self.emit_error(ReceiveError::Service(err), None).await;
            }
        }
    }

    async fn emit_error(&self, err: ReceiveError, envelope: Option<Envelope>) {
        let cause: Arc<dyn std::error::Error + Send + Sync> = Arc::new(err);
        self.events
            .emit(&Event::Error(ErrorEvent { cause, envelope }))
            .await;
    }
}
