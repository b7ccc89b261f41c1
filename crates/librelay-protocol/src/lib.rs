//! Messaging pipelines for the librelay client
//!
//! The outgoing pipeline fans a plaintext out to every device of every
//! recipient and reconciles device-list drift against the message
//! service; the incoming pipeline decrypts envelopes off the streaming
//! transport and heals from session faults. Both compose the session
//! primitives and the store facade from the companion crates.

pub mod config;
pub mod error;
pub mod outgoing;
pub mod queue;
pub mod receiver;
pub mod sender;
pub mod service;
pub mod transport;

pub use config::{ClientConfig, KeepAliveConfig, RetryConfig};
pub use error::{ReceiveError, SendError, ServiceError};
pub use outgoing::{ErrorEntry, OutgoingMessage, SentEntry};
pub use receiver::MessageReceiver;
pub use sender::MessageSender;
pub use service::{HttpSignalService, MessageBundle, SignalService};
