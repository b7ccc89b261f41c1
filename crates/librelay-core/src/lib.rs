//! Core building blocks for the librelay messaging client
//!
//! This crate carries the shared vocabulary of the outgoing and
//! incoming pipelines: addresses and timestamps, the envelope protobuf
//! codec, message padding, the event dispatcher, and the session store
//! facade the cipher primitives persist through.

pub mod envelope;
pub mod events;
pub mod keys;
pub mod padding;
pub mod storage;
pub mod types;

pub use envelope::{Content, DataMessage, Envelope, SyncMessage};
pub use events::{Event, EventDispatcher, EventListener};
pub use storage::{ProcessState, Storage};
pub use types::{Address, DeviceId, ProtocolAddress, Timestamp, PRIMARY_DEVICE_ID};
