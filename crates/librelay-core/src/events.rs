//! Event dispatch for the messaging pipelines
//!
//! A dispatcher is a list of listeners invoked sequentially in
//! registration order, each awaited before the next. A listener failure
//! is logged and swallowed; it never propagates into the pipeline that
//! emitted the event.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::warn;

use crate::envelope::{DataMessage, Envelope};
use crate::types::{Address, DeviceId, Timestamp};

/// Boxed listener failure
pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

/// A decrypted incoming message
#[derive(Clone, Debug)]
pub struct MessageEvent {
    pub source: Address,
    pub source_device: DeviceId,
    pub timestamp: Timestamp,
    pub message: DataMessage,
    /// Set when the envelope was redelivered after an accepted identity
    /// key change
    pub key_change: bool,
}

/// A message journaled as sent, either by the outgoing pipeline or via
/// a sync transcript from another of our devices
#[derive(Clone, Debug)]
pub struct SentEvent {
    pub destination: Address,
    pub timestamp: Timestamp,
}

/// A delivery receipt envelope
#[derive(Clone, Debug)]
pub struct ReceiptEvent {
    pub source: Address,
    pub source_device: DeviceId,
    pub timestamp: Timestamp,
}

/// A read marker from another of our devices
#[derive(Clone, Debug)]
pub struct ReadEvent {
    pub sender: Address,
    pub timestamp: Timestamp,
}

/// A pipeline fault surfaced to the application
#[derive(Clone, Debug)]
pub struct ErrorEvent {
    pub cause: Arc<dyn std::error::Error + Send + Sync>,
    /// The envelope being handled when the fault occurred, if any
    pub envelope: Option<Envelope>,
}

/// An identity key change awaiting a user decision.
///
/// Listeners accept the new key by calling [`KeyChangeEvent::accept`];
/// the emitting pipeline checks [`KeyChangeEvent::is_accepted`] after
/// dispatch and retries the operation once when accepted.
#[derive(Debug)]
pub struct KeyChangeEvent {
    pub addr: Address,
    pub identity_key: Vec<u8>,
    accepted: AtomicBool,
}

impl KeyChangeEvent {
    pub fn new(addr: Address, identity_key: Vec<u8>) -> Self {
        Self {
            addr,
            identity_key,
            accepted: AtomicBool::new(false),
        }
    }

    /// Accept the new identity key
    pub fn accept(&self) {
        self.accepted.store(true, Ordering::SeqCst);
    }

    /// Whether any listener accepted the new key
    pub fn is_accepted(&self) -> bool {
        self.accepted.load(Ordering::SeqCst)
    }
}

/// Events emitted by the messaging pipelines
#[derive(Clone, Debug)]
pub enum Event {
    Message(MessageEvent),
    Sent(SentEvent),
    Receipt(ReceiptEvent),
    Read(ReadEvent),
    KeyChange(Arc<KeyChangeEvent>),
    Error(ErrorEvent),
}

impl Event {
    /// Event name for logging
    pub fn name(&self) -> &'static str {
        match self {
            Event::Message(_) => "message",
            Event::Sent(_) => "sent",
            Event::Receipt(_) => "receipt",
            Event::Read(_) => "read",
            Event::KeyChange(_) => "keychange",
            Event::Error(_) => "error",
        }
    }
}

/// A registered event listener
#[async_trait]
pub trait EventListener: Send + Sync {
    async fn on_event(&self, event: &Event) -> Result<(), ListenerError>;
}

/// Cooperative fan-out of pipeline events to registered listeners
#[derive(Default)]
pub struct EventDispatcher {
    listeners: RwLock<Vec<Arc<dyn EventListener>>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener. Listeners run in registration order.
    pub fn add_listener(&self, listener: Arc<dyn EventListener>) {
        self.listeners.write().push(listener);
    }

    /// Dispatch an event to every listener, awaiting each in turn.
    /// Listener errors are logged and swallowed.
    pub async fn emit(&self, event: &Event) {
        let listeners: Vec<_> = self.listeners.read().clone();
        for listener in listeners {
            if let Err(e) = listener.on_event(event).await {
                warn!(event = event.name(), "event listener failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct Recorder {
        tag: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
        fail: bool,
    }

    #[async_trait]
    impl EventListener for Recorder {
        async fn on_event(&self, _event: &Event) -> Result<(), ListenerError> {
            self.log.lock().push(self.tag);
            if self.fail {
                return Err("listener exploded".into());
            }
            Ok(())
        }
    }

    fn sent_event() -> Event {
        Event::Sent(SentEvent {
            destination: Address::from("alice"),
            timestamp: Timestamp::from_millis(1),
        })
    }

    #[tokio::test]
    async fn test_listeners_run_in_registration_order() {
        let dispatcher = EventDispatcher::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second", "third"] {
            dispatcher.add_listener(Arc::new(Recorder {
                tag,
                log: log.clone(),
                fail: false,
            }));
        }

        dispatcher.emit(&sent_event()).await;
        assert_eq!(*log.lock(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_listener_error_does_not_stop_fanout() {
        let dispatcher = EventDispatcher::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        dispatcher.add_listener(Arc::new(Recorder {
            tag: "failing",
            log: log.clone(),
            fail: true,
        }));
        dispatcher.add_listener(Arc::new(Recorder {
            tag: "after",
            log: log.clone(),
            fail: false,
        }));

        dispatcher.emit(&sent_event()).await;
        assert_eq!(*log.lock(), vec!["failing", "after"]);
    }

    struct Acceptor;

    #[async_trait]
    impl EventListener for Acceptor {
        async fn on_event(&self, event: &Event) -> Result<(), ListenerError> {
            if let Event::KeyChange(change) = event {
                change.accept();
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_keychange_accept() {
        let dispatcher = EventDispatcher::new();
        dispatcher.add_listener(Arc::new(Acceptor));

        let change = Arc::new(KeyChangeEvent::new(Address::from("bob"), vec![5; 33]));
        assert!(!change.is_accepted());

        dispatcher.emit(&Event::KeyChange(change.clone())).await;
        assert!(change.is_accepted());
    }
}
