//! Envelope and content protobuf codec
//!
//! Wire messages delivered by the message service. The definitions are
//! hand-derived `prost` messages; tags match the service's protobuf
//! schema, so `Envelope::decode` consumes frames straight off the
//! streaming transport.

use prost::Message;
use thiserror::Error;

use crate::types::{Address, DeviceId, Timestamp};

/// Decode failure for an envelope or content body
#[derive(Debug, Error)]
pub enum CodecError {
    /// Protobuf decode failed
    #[error("protobuf decode failed: {0}")]
    Decode(#[from] prost::DecodeError),

    /// Envelope carries an unknown type discriminant
    #[error("unknown envelope type {0}")]
    UnknownType(i32),

    /// Envelope is missing a required field
    #[error("envelope missing field: {0}")]
    MissingField(&'static str),
}

/// Outer message container delivered by the server
#[derive(Clone, PartialEq, Message)]
pub struct Envelope {
    #[prost(enumeration = "envelope::Type", tag = "1")]
    pub r#type: i32,
    #[prost(string, optional, tag = "2")]
    pub source: Option<String>,
    #[prost(string, optional, tag = "3")]
    pub relay: Option<String>,
    #[prost(uint64, optional, tag = "5")]
    pub timestamp: Option<u64>,
    #[prost(bytes = "vec", optional, tag = "6")]
    pub legacy_message: Option<Vec<u8>>,
    #[prost(uint32, optional, tag = "7")]
    pub source_device: Option<u32>,
    #[prost(bytes = "vec", optional, tag = "8")]
    pub content: Option<Vec<u8>>,
}

pub mod envelope {
    /// Envelope type discriminant
    #[derive(
        Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration,
    )]
    #[repr(i32)]
    pub enum Type {
        Unknown = 0,
        Ciphertext = 1,
        KeyExchange = 2,
        PrekeyBundle = 3,
        Receipt = 5,
    }
}

impl Envelope {
    /// Decode from a decrypted transport frame
    pub fn decode_frame(buf: &[u8]) -> Result<Self, CodecError> {
        Ok(Self::decode(buf)?)
    }

    /// Typed envelope discriminant
    pub fn envelope_type(&self) -> Result<envelope::Type, CodecError> {
        envelope::Type::try_from(self.r#type).map_err(|_| CodecError::UnknownType(self.r#type))
    }

    /// Sender address
    pub fn source_addr(&self) -> Result<Address, CodecError> {
        self.source
            .as_deref()
            .map(Address::from)
            .ok_or(CodecError::MissingField("source"))
    }

    /// Sender device id
    pub fn source_device_id(&self) -> Result<DeviceId, CodecError> {
        self.source_device
            .ok_or(CodecError::MissingField("sourceDevice"))
    }

    /// Sender clock, converted from the wire's 64-bit form. Subject to
    /// skew; used only for cross-referencing.
    pub fn sent_timestamp(&self) -> Timestamp {
        Timestamp::from_millis(self.timestamp.unwrap_or(0))
    }
}

/// Decoded ciphertext body: a data message, a sync transcript, or both
#[derive(Clone, PartialEq, Message)]
pub struct Content {
    #[prost(message, optional, tag = "1")]
    pub data_message: Option<DataMessage>,
    #[prost(message, optional, tag = "2")]
    pub sync_message: Option<SyncMessage>,
}

/// A user-visible message payload
#[derive(Clone, PartialEq, Message)]
pub struct DataMessage {
    #[prost(string, optional, tag = "1")]
    pub body: Option<String>,
    #[prost(message, repeated, tag = "2")]
    pub attachments: Vec<AttachmentPointer>,
    #[prost(uint32, optional, tag = "4")]
    pub flags: Option<u32>,
    #[prost(uint32, optional, tag = "5")]
    pub expire_timer: Option<u32>,
}

pub mod data_message {
    /// Bit flags carried by [`super::DataMessage::flags`]
    #[derive(
        Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration,
    )]
    #[repr(i32)]
    pub enum Flags {
        EndSession = 1,
        ExpirationTimerUpdate = 2,
    }
}

impl DataMessage {
    /// Check a flag bit
    pub fn has_flag(&self, flag: data_message::Flags) -> bool {
        self.flags.unwrap_or(0) & flag as u32 != 0
    }
}

/// Reference to an uploaded attachment ciphertext
#[derive(Clone, PartialEq, Message)]
pub struct AttachmentPointer {
    #[prost(uint64, optional, tag = "1")]
    pub id: Option<u64>,
    #[prost(string, optional, tag = "2")]
    pub content_type: Option<String>,
    #[prost(bytes = "vec", optional, tag = "3")]
    pub key: Option<Vec<u8>>,
    #[prost(uint32, optional, tag = "4")]
    pub size: Option<u32>,
    #[prost(bytes = "vec", optional, tag = "6")]
    pub digest: Option<Vec<u8>>,
}

/// Multi-device sync transcript; only valid from our own address on a
/// different device
#[derive(Clone, PartialEq, Message)]
pub struct SyncMessage {
    #[prost(message, optional, tag = "1")]
    pub sent: Option<sync_message::Sent>,
    #[prost(message, optional, tag = "2")]
    pub contacts: Option<sync_message::Contacts>,
    #[prost(message, optional, tag = "3")]
    pub groups: Option<sync_message::Groups>,
    #[prost(message, optional, tag = "4")]
    pub request: Option<sync_message::Request>,
    #[prost(message, repeated, tag = "5")]
    pub read: Vec<sync_message::Read>,
    #[prost(message, optional, tag = "6")]
    pub blocked: Option<sync_message::Blocked>,
}

pub mod sync_message {
    use prost::Message;

    /// Transcript of a message sent from another of our devices
    #[derive(Clone, PartialEq, Message)]
    pub struct Sent {
        #[prost(string, optional, tag = "1")]
        pub destination: Option<String>,
        #[prost(uint64, optional, tag = "2")]
        pub timestamp: Option<u64>,
        #[prost(message, optional, tag = "3")]
        pub message: Option<super::DataMessage>,
    }

    /// Deprecated contact sync blob
    #[derive(Clone, PartialEq, Message)]
    pub struct Contacts {
        #[prost(bytes = "vec", optional, tag = "1")]
        pub blob: Option<Vec<u8>>,
    }

    /// Deprecated group sync blob
    #[derive(Clone, PartialEq, Message)]
    pub struct Groups {
        #[prost(bytes = "vec", optional, tag = "1")]
        pub blob: Option<Vec<u8>>,
    }

    /// Deprecated sync request
    #[derive(Clone, PartialEq, Message)]
    pub struct Request {
        #[prost(uint32, optional, tag = "1")]
        pub r#type: Option<u32>,
    }

    /// Read marker relayed from another of our devices
    #[derive(Clone, PartialEq, Message)]
    pub struct Read {
        #[prost(string, optional, tag = "1")]
        pub sender: Option<String>,
        #[prost(uint64, optional, tag = "2")]
        pub timestamp: Option<u64>,
    }

    /// Blocked-contacts sync; unsupported
    #[derive(Clone, PartialEq, Message)]
    pub struct Blocked {
        #[prost(string, repeated, tag = "1")]
        pub addrs: Vec<String>,
    }
}
